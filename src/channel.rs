//! The command channel to the controller.
//!
//! A [`Connector`] dials the endpoint and yields a byte stream; a
//! [`Connection`] wraps that stream with receive/send/close primitives and
//! the configured [`Framing`]. Anything that is `AsyncRead + AsyncWrite`
//! can sit underneath, so a TLS stream can be slotted in by a connector
//! without touching the dispatcher.

use crate::config::Endpoint;
use async_trait::async_trait;
use std::borrow::Cow;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// Largest single read in raw framing.
pub const RAW_READ_SIZE: usize = 1024;

/// Largest frame accepted in line or length-prefixed framing.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Transport failures. Any of these ends the current connection.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to {0}")]
    ConnectTimeout(Endpoint),

    #[error("failed to receive command: {0}")]
    Receive(#[source] std::io::Error),

    #[error("failed to send payload: {0}")]
    Send(#[source] std::io::Error),

    #[error("connection closed by controller")]
    Closed,

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
}

/// How messages are delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// One read call is one command; payloads are written as-is.
    ///
    /// Coalesced or split writes from the controller are not detected.
    #[default]
    Raw,
    /// Newline-terminated in both directions.
    Line,
    /// 4-byte big-endian length prefix in both directions.
    LengthPrefixed,
}

/// Dials the controller.
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Stream, ChannelError>;
}

#[async_trait]
impl<C: Connector> Connector for std::sync::Arc<C> {
    type Stream = C::Stream;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Stream, ChannelError> {
        (**self).connect(endpoint).await
    }
}

/// Plain TCP connector.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    timeout: Option<Duration>,
}

impl TcpConnector {
    #[must_use]
    pub const fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, endpoint: &Endpoint) -> Result<TcpStream, ChannelError> {
        let dial = TcpStream::connect((endpoint.host(), endpoint.port()));
        let stream = bounded_dial(endpoint, self.timeout, dial).await?;
        // Commands are tiny; don't let Nagle hold them back.
        stream.set_nodelay(true).ok();
        Ok(stream)
    }
}

/// Await a dial, giving up after `limit` if one is set.
async fn bounded_dial<S, F>(
    endpoint: &Endpoint,
    limit: Option<Duration>,
    dial: F,
) -> Result<S, ChannelError>
where
    F: Future<Output = std::io::Result<S>>,
{
    let result = match limit {
        Some(limit) => tokio::time::timeout(limit, dial)
            .await
            .map_err(|_| ChannelError::ConnectTimeout(endpoint.clone()))?,
        None => dial.await,
    };
    result.map_err(|source| ChannelError::Connect {
        endpoint: endpoint.clone(),
        source,
    })
}

/// An open duplex stream to the controller.
pub struct Connection<S> {
    stream: BufReader<S>,
    framing: Framing,
    closed: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[must_use]
    pub fn new(stream: S, framing: Framing) -> Self {
        Self {
            stream: BufReader::new(stream),
            framing,
            closed: false,
        }
    }

    #[must_use]
    pub const fn framing(&self) -> Framing {
        self.framing
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Wait for the next inbound frame.
    ///
    /// End of stream is reported as [`ChannelError::Closed`].
    pub async fn receive(&mut self) -> Result<Vec<u8>, ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        match self.framing {
            Framing::Raw => self.receive_raw().await,
            Framing::Line => self.receive_line().await,
            Framing::LengthPrefixed => self.receive_length_prefixed().await,
        }
    }

    async fn receive_raw(&mut self) -> Result<Vec<u8>, ChannelError> {
        let mut buf = vec![0u8; RAW_READ_SIZE];
        let n = self
            .stream
            .read(&mut buf)
            .await
            .map_err(ChannelError::Receive)?;
        if n == 0 {
            return Err(ChannelError::Closed);
        }
        buf.truncate(n);
        Ok(buf)
    }

    async fn receive_line(&mut self) -> Result<Vec<u8>, ChannelError> {
        let mut buf = Vec::new();
        let limit = (MAX_FRAME_LEN + 1) as u64;
        let n = (&mut self.stream)
            .take(limit)
            .read_until(b'\n', &mut buf)
            .await
            .map_err(ChannelError::Receive)?;
        if n == 0 {
            return Err(ChannelError::Closed);
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        } else if n > MAX_FRAME_LEN {
            return Err(ChannelError::FrameTooLarge(n));
        } else {
            // EOF in the middle of a line
            return Err(ChannelError::Closed);
        }
        Ok(buf)
    }

    async fn receive_length_prefixed(&mut self) -> Result<Vec<u8>, ChannelError> {
        let len = match self.stream.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ChannelError::Closed);
            }
            Err(e) => return Err(ChannelError::Receive(e)),
        };
        if len > MAX_FRAME_LEN {
            return Err(ChannelError::FrameTooLarge(len));
        }
        let mut buf = vec![0u8; len];
        self.stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => ChannelError::Closed,
                _ => ChannelError::Receive(e),
            })?;
        Ok(buf)
    }

    /// Write one outbound message and flush it.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        let framed: Cow<'_, [u8]> = match self.framing {
            Framing::Raw => Cow::Borrowed(payload),
            Framing::Line => {
                let mut buf = Vec::with_capacity(payload.len() + 1);
                buf.extend_from_slice(payload);
                buf.push(b'\n');
                Cow::Owned(buf)
            }
            Framing::LengthPrefixed => {
                let len = u32::try_from(payload.len())
                    .ok()
                    .filter(|&len| len as usize <= MAX_FRAME_LEN)
                    .ok_or(ChannelError::FrameTooLarge(payload.len()))?;
                let mut buf = Vec::with_capacity(payload.len() + 4);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.extend_from_slice(payload);
                Cow::Owned(buf)
            }
        };
        let writer = self.stream.get_mut();
        writer.write_all(&framed).await.map_err(ChannelError::Send)?;
        writer.flush().await.map_err(ChannelError::Send)
    }

    /// Shut the stream down. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.stream.get_mut().shutdown().await {
            debug!("Shutdown after close failed: {}", e);
        }
    }
}
