//! Connection halves a session runs on.
//!
//! A session needs exactly one writer and one reader. The outbound loop owns
//! the `EnvelopeSink`, the inbound loop owns the `EnvelopeSource`, so writes
//! never interleave and no write lock is needed.
//!
//! Besides the traits, this module ships a length-prefixed JSON framing over
//! any `AsyncRead + AsyncWrite` stream, for peers that are not behind a
//! WebSocket (a TCP or Unix socket, a child process's stdio pipes):
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON object of len bytes]
//! ```
//!
//! ```rust,ignore
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:9000").await?;
//! let (sink, source) = evalbridge_core::transport::framed(stream);
//! let report = broker.serve(sink, source).await;
//! ```

use crate::envelope::Envelope;
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Largest frame accepted by the framed transport.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Write half of a connection.
#[async_trait]
pub trait EnvelopeSink: Send + 'static {
    /// Write one envelope. Failures are `WriteFailure`.
    async fn send(&mut self, envelope: &Envelope) -> Result<()>;

    /// Close the connection. Calling it twice is harmless.
    async fn close(&mut self) -> Result<()>;
}

/// Read half of a connection.
#[async_trait]
pub trait EnvelopeSource: Send + 'static {
    /// Read the next envelope.
    ///
    /// `Ok(None)` means the peer closed the connection. `MalformedEnvelope`
    /// means one bad frame on an otherwise healthy connection; any other
    /// error means the connection is unusable.
    async fn recv(&mut self) -> Result<Option<Envelope>>;
}

/// Split a byte stream into framed envelope halves.
pub fn framed<T>(stream: T) -> (FrameSink<WriteHalf<T>>, FrameSource<ReadHalf<T>>)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    (FrameSink::new(writer), FrameSource::new(reader))
}

/// Length-prefixed JSON writer.
#[derive(Debug)]
pub struct FrameSink<W> {
    writer: W,
    closed: bool,
}

impl<W> FrameSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            closed: false,
        }
    }
}

#[async_trait]
impl<W> EnvelopeSink for FrameSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        if self.closed {
            return Err(BridgeError::WriteFailure {
                message: "connection already closed".to_string(),
            });
        }
        let payload = serde_json::to_vec(envelope.as_map())?;
        write_frame(&mut self.writer, &payload)
            .await
            .map_err(|e| BridgeError::WriteFailure {
                message: e.to_string(),
            })
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer
            .shutdown()
            .await
            .map_err(|e| BridgeError::WriteFailure {
                message: e.to_string(),
            })
    }
}

/// Length-prefixed JSON reader.
#[derive(Debug)]
pub struct FrameSource<R> {
    reader: R,
}

impl<R> FrameSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl<R> EnvelopeSource for FrameSource<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<Envelope>> {
        let frame = read_frame(&mut self.reader)
            .await
            .map_err(|e| BridgeError::ReadFailure {
                message: e.to_string(),
            })?;
        let Some(payload) = frame else {
            return Ok(None);
        };

        let value: serde_json::Value =
            serde_json::from_slice(&payload).map_err(|e| BridgeError::MalformedEnvelope {
                message: format!("invalid JSON: {}", e),
            })?;
        Envelope::from_value(value).map(Some)
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection). An oversized length
/// prefix is an `InvalidData` error: the stream cannot be resynchronized.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame size {} exceeds maximum {}", len, MAX_FRAME_SIZE),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large")
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}
