//! Framed byte transports and the mount-tag registry.
//!
//! A transport moves whole 9P frames, one at a time, in each direction.
//! Ordering and request/response pairing are the client's problem; a
//! transport only promises that a frame handed to `send` reaches the
//! peer intact and that `receive` yields exactly one complete frame.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tracing::debug;

use super::errors::{P9Error, Result};
use super::protocol::MAX_MSIZE;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Tag-like name used in logs and by the registry.
    fn name(&self) -> &str;

    /// Largest frame this transport can carry in either direction.
    fn max_message_size(&self) -> u32;

    /// Deliver one complete frame.
    async fn send(&self, frame: &[u8]) -> Result<()>;

    /// Receive one complete frame, header included.
    async fn receive(&self) -> Result<Bytes>;
}

/// 9P over a TCP stream, framed by the leading size field.
pub struct TcpTransport {
    name: String,
    reader: tokio::sync::Mutex<OwnedReadHalf>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    max_frame: u32,
}

impl TcpTransport {
    pub async fn connect(name: &str, addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(name, stream))
    }

    pub fn from_stream(name: &str, stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            name: name.to_string(),
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            max_frame: MAX_MSIZE,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_message_size(&self) -> u32 {
        self.max_frame
    }

    async fn send(&self, frame: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Bytes> {
        let mut reader = self.reader.lock().await;

        let mut size_buf = [0u8; 4];
        reader.read_exact(&mut size_buf).await?;
        let size = u32::from_le_bytes(size_buf);
        if !(7..=self.max_frame).contains(&size) {
            return Err(P9Error::protocol(format!("invalid frame size {size}")));
        }

        let mut frame = vec![0u8; size as usize];
        frame[0..4].copy_from_slice(&size_buf);
        reader.read_exact(&mut frame[4..]).await?;

        debug!(transport = %self.name, size, "received frame");
        Ok(Bytes::from(frame))
    }
}

/// In-memory loopback endpoint. `pair` yields two endpoints whose
/// send/receive queues are crossed, so one side can act as a server.
pub struct ChannelTransport {
    name: String,
    tx: mpsc::UnboundedSender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    max_frame: u32,
}

impl ChannelTransport {
    pub fn pair(name: &str) -> (ChannelTransport, ChannelTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let client = ChannelTransport {
            name: name.to_string(),
            tx: a_tx,
            rx: tokio::sync::Mutex::new(b_rx),
            max_frame: MAX_MSIZE,
        };
        let server = ChannelTransport {
            name: format!("{name}-peer"),
            tx: b_tx,
            rx: tokio::sync::Mutex::new(a_rx),
            max_frame: MAX_MSIZE,
        };
        (client, server)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_message_size(&self) -> u32 {
        self.max_frame
    }

    async fn send(&self, frame: &[u8]) -> Result<()> {
        if frame.len() > self.max_frame as usize {
            return Err(P9Error::BufferOverflow);
        }
        self.tx
            .send(Bytes::copy_from_slice(frame))
            .map_err(|_| P9Error::Io(std::io::ErrorKind::BrokenPipe.into()))
    }

    async fn receive(&self) -> Result<Bytes> {
        let mut rx = self.rx.lock().await;
        let frame = rx
            .recv()
            .await
            .ok_or_else(|| P9Error::Io(std::io::ErrorKind::BrokenPipe.into()))?;
        if frame.len() > self.max_frame as usize {
            return Err(P9Error::BufferOverflow);
        }
        Ok(frame)
    }
}

/// Largest number of transports a registry will hold.
pub const MAX_TRANSPORTS: usize = 8;

/// Maps mount tags to live transports. A mount looks its transport up
/// here by the `tag=` option.
#[derive(Default)]
pub struct TransportRegistry {
    slots: Mutex<HashMap<String, std::sync::Arc<dyn Transport>>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, transport: std::sync::Arc<dyn Transport>) -> Result<()> {
        let mut slots = self.slots.lock().unwrap();
        if slots.len() >= MAX_TRANSPORTS {
            return Err(P9Error::NoSpace);
        }
        let tag = transport.name().to_string();
        if slots.contains_key(&tag) {
            return Err(P9Error::Exists);
        }
        debug!(%tag, "registered transport");
        slots.insert(tag, transport);
        Ok(())
    }

    pub fn unregister(&self, tag: &str) -> Option<std::sync::Arc<dyn Transport>> {
        self.slots.lock().unwrap().remove(tag)
    }

    pub fn find(&self, tag: &str) -> Option<std::sync::Arc<dyn Transport>> {
        self.slots.lock().unwrap().get(tag).cloned()
    }
}
