//! TCP link driver with u32 big-endian length-prefixed frames.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use commlink_types::{LinkError, Packet};

use crate::Link;

/// Upper bound on a single frame; anything larger is a protocol error, not
/// an allocation request.
const MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Length-framed TCP transport. Read and write halves are stored
/// separately so the read loop and concurrent commanders do not contend.
pub struct TcpLink {
    addr: String,
    connect_timeout: Duration,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl TcpLink {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Link for TcpLink {
    async fn connect(&self) -> Result<(), LinkError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                LinkError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", self.addr),
                ))
            })??;
        stream.set_nodelay(true).map_err(LinkError::Io)?;
        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(read_half);
        *self.writer.lock().await = Some(write_half);
        debug!(addr = %self.addr, "tcp link connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.reader.lock().await.take();
        if let Some(mut write_half) = self.writer.lock().await.take() {
            // Best effort; the peer may already be gone.
            let _ = write_half.shutdown().await;
        }
        debug!(addr = %self.addr, "tcp link disconnected");
        Ok(())
    }

    async fn connected(&self) -> bool {
        self.reader.lock().await.is_some() && self.writer.lock().await.is_some()
    }

    async fn read(&self) -> Result<Option<Packet>, LinkError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(LinkError::NotConnected)?;

        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            // A close between frames is a clean disconnect.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(LinkError::Io(e)),
        }
        let len = u32::from_be_bytes(len_bytes);
        if len > MAX_FRAME_LEN {
            return Err(LinkError::Protocol(format!(
                "frame length {len} exceeds maximum {MAX_FRAME_LEN}"
            )));
        }

        let mut buffer = vec![0u8; len as usize];
        reader.read_exact(&mut buffer).await.map_err(LinkError::Io)?;
        Ok(Some(Packet::from_buffer(buffer)))
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(LinkError::NotConnected)?;
        let len = u32::try_from(bytes.len()).map_err(|_| {
            LinkError::Protocol(format!("frame length {} exceeds u32", bytes.len()))
        })?;
        writer.write_all(&len.to_be_bytes()).await.map_err(LinkError::Io)?;
        writer.write_all(bytes).await.map_err(LinkError::Io)?;
        writer.flush().await.map_err(LinkError::Io)?;
        Ok(())
    }
}
