//! The interface descriptor and its shared handle.
//!
//! One [`InterfaceInfo`] describes one configured bidirectional link to an
//! external target or group of targets. The supervisor owns state
//! transitions; the command worker reads the descriptor through the same
//! [`SharedInterface`] handle.

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection state of an interface. Only the supervisor transitions it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterfaceState {
    Disconnected,
    Attempting,
    Connected,
}

impl fmt::Display for InterfaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceState::Disconnected => write!(f, "DISCONNECTED"),
            InterfaceState::Attempting => write!(f, "ATTEMPTING"),
            InterfaceState::Connected => write!(f, "CONNECTED"),
        }
    }
}

/// Descriptor of one configured interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceInfo {
    /// Stable identity used in topic names and logs.
    pub name: String,
    /// Logical targets this interface serves. Append-only after construction.
    pub target_names: Vec<String>,
    pub state: InterfaceState,
    /// Whether a lost connection is re-established automatically.
    pub auto_reconnect: bool,
    /// Delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// When false the interface only maintains the connection; no read loop.
    pub read_allowed: bool,
}

impl InterfaceInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target_names: Vec::new(),
            state: InterfaceState::Disconnected,
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(5),
            read_allowed: true,
        }
    }
}

/// Cheaply clonable shared handle over an [`InterfaceInfo`].
///
/// Readers take consistent snapshots; only the supervisor mutates state.
#[derive(Clone, Debug)]
pub struct SharedInterface {
    inner: Arc<RwLock<InterfaceInfo>>,
}

impl SharedInterface {
    pub fn new(info: InterfaceInfo) -> Self {
        Self {
            inner: Arc::new(RwLock::new(info)),
        }
    }

    /// A point-in-time copy of the descriptor.
    pub fn snapshot(&self) -> InterfaceInfo {
        self.inner.read().expect("interface lock poisoned").clone()
    }

    pub fn name(&self) -> String {
        self.inner.read().expect("interface lock poisoned").name.clone()
    }

    pub fn state(&self) -> InterfaceState {
        self.inner.read().expect("interface lock poisoned").state
    }

    pub fn set_state(&self, state: InterfaceState) {
        self.inner.write().expect("interface lock poisoned").state = state;
    }

    pub fn target_names(&self) -> Vec<String> {
        self.inner
            .read()
            .expect("interface lock poisoned")
            .target_names
            .clone()
    }

    /// Append a target. Targets are never removed.
    pub fn add_target(&self, target: impl Into<String>) {
        self.inner
            .write()
            .expect("interface lock poisoned")
            .target_names
            .push(target.into());
    }

    pub fn auto_reconnect(&self) -> bool {
        self.inner.read().expect("interface lock poisoned").auto_reconnect
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.inner.read().expect("interface lock poisoned").reconnect_delay
    }

    pub fn read_allowed(&self) -> bool {
        self.inner.read().expect("interface lock poisoned").read_allowed
    }
}
