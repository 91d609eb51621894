//! `commlink` – interface microservice entry point.
//!
//! Boots one interface microservice from `~/.commlink/config.toml`:
//!
//! 1. Initialises structured logging (`RUST_LOG`, and
//!    `COMMLINK_LOG_FORMAT=json` for newline-delimited JSON logs).
//! 2. Loads the config, applying `COMMLINK_*` environment overrides.
//! 3. Wires a [`TcpLink`] to the in-process dictionary and store and starts
//!    the supervisor and command worker tasks.
//! 4. Intercepts **Ctrl-C**, closes the store's command routes, and stops
//!    the supervisor so no connect can follow.

mod config;

use std::sync::Arc;

use colored::Colorize;
use tokio::sync::Notify;
use tracing::{info, warn};

use commlink_dict::{Dictionary, MemoryDictionary};
use commlink_link::{Link, TcpLink};
use commlink_runtime::{InterfaceMicroservice, InterfaceOptions};
use commlink_store::{MemoryStore, Store};

#[tokio::main]
async fn main() {
    // ── Structured logging ────────────────────────────────────────────────
    // The banner still uses println! for operator-facing output.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    if std::env::var("COMMLINK_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .compact()
            .init();
    }

    print_banner();

    // ── Configuration ─────────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let cfg = config::Config::default();
            if let Err(e) = config::save(&cfg) {
                warn!(error = %e, "could not write default config");
            }
            println!(
                "  No config found; defaults written to {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    println!(
        "  Interface {} → {} (scope {})",
        cfg.interface_name.bold(),
        cfg.connect_addr.bold(),
        cfg.scope.dimmed()
    );

    // ── Wiring ────────────────────────────────────────────────────────────
    let link: Arc<dyn Link> = Arc::new(TcpLink::new(cfg.connect_addr.clone()));
    let dictionary: Arc<dyn Dictionary> = Arc::new(MemoryDictionary::new());
    let store = Arc::new(MemoryStore::default());

    let options = InterfaceOptions {
        targets: cfg.targets.clone(),
        auto_reconnect: cfg.auto_reconnect,
        reconnect_delay: cfg.reconnect_delay(),
        read_allowed: cfg.read_allowed,
        exception_dir: cfg.exception_dir.clone().into(),
    };

    let mut microservice = match InterfaceMicroservice::new(
        &cfg.microservice_name(),
        options,
        link,
        dictionary,
        Arc::clone(&store) as Arc<dyn Store>,
    ) {
        Ok(ms) => ms,
        Err(e) => {
            eprintln!("{}: {}", "Startup error".red(), e);
            std::process::exit(1);
        }
    };

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(Notify::new());
    let shutdown_signal = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        shutdown_signal.notify_one();
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; graceful shutdown unavailable");
    }

    // ── Run ───────────────────────────────────────────────────────────────
    if let Err(e) = microservice.start().await {
        eprintln!("{}: {}", "Startup error".red(), e);
        std::process::exit(1);
    }
    info!(microservice = %microservice.name(), "running until Ctrl-C");

    shutdown.notified().await;

    // Close the command routes first so the worker's sequence ends, then
    // stop the supervisor and join both tasks.
    store.shutdown();
    microservice.stop().await;
    println!("{}", "  ✓ Interface stopped. Exiting commlink.".green());
}

fn print_banner() {
    println!();
    println!("  {}", "commlink".bright_blue().bold());
    println!("  {}", "interface microservice".dimmed());
    println!();
}
