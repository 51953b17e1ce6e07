//! TCP transport: owns the socket and moves whole frames in and out of it.

use crate::config::DeviceConfig;
use crate::error::{Result, TuyaError};
use crate::protocol::{HEADER_LEN, PREFIX_55AA, parse_header};
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::{Duration, timeout};

const READ_CHUNK: usize = 1024;
const PREFIX_BYTES: [u8; 4] = PREFIX_55AA.to_be_bytes();

/// One TCP connection to the device.
///
/// A session is never reused after an I/O failure; the dispatcher opens a new
/// one (with a fresh sequence counter) instead.
pub struct TransportSession {
    peer: String,
    reader: FrameReader,
    writer: FrameWriter,
}

impl TransportSession {
    /// Connects to `host:port`. Refusal maps to `ConnectionFailed`, an elapsed
    /// `connect_timeout` to `Timeout`.
    pub async fn open(config: &DeviceConfig, connect_timeout: Duration) -> Result<Self> {
        let peer = format!("{}:{}", config.host, config.port);
        info!("Connecting to device {} at {}", config.device_id, peer);

        let stream = timeout(connect_timeout, TcpStream::connect(&peer))
            .await
            .map_err(|_| TuyaError::Timeout)?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => TuyaError::ConnectionFailed,
                _ => TuyaError::Io(e.to_string()),
            })?;
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            peer,
            reader: FrameReader::new(read_half),
            writer: FrameWriter::new(write_half, connect_timeout),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.writer.write_frame(frame).await
    }

    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        self.reader.read_frame().await
    }

    /// Shuts the socket down. Safe to call more than once.
    pub async fn close(&mut self) {
        self.writer.close().await;
    }

    /// Splits the session so the read loop can run in its own task.
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

/// Read side of a session. Buffers partial reads until a whole frame is available.
pub struct FrameReader {
    stream: OwnedReadHalf,
    buffer: Vec<u8>,
}

impl FrameReader {
    fn new(stream: OwnedReadHalf) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(READ_CHUNK),
        }
    }

    /// Returns the next complete frame (header, payload, CRC and suffix).
    ///
    /// Bytes before a prefix magic are discarded. End of stream is reported as
    /// `ConnectionLost`.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.take_frame() {
                return Ok(frame);
            }

            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                debug!(
                    "Peer closed connection ({} buffered bytes dropped)",
                    self.buffer.len()
                );
                return Err(TuyaError::ConnectionLost);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    fn take_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            match find_prefix(&self.buffer) {
                Some(0) => {}
                Some(start) => {
                    debug!("Skipping {} bytes before frame prefix", start);
                    self.buffer.drain(..start);
                }
                None => {
                    // Keep a possible partial prefix at the tail.
                    let keep = self.buffer.len().min(PREFIX_BYTES.len() - 1);
                    let discard = self.buffer.len() - keep;
                    if discard > 0 {
                        debug!("Discarding {} bytes without frame prefix", discard);
                        self.buffer.drain(..discard);
                    }
                    return None;
                }
            }

            if self.buffer.len() < HEADER_LEN {
                return None;
            }

            match parse_header(&self.buffer) {
                Ok(header) => {
                    let total = header.total_length as usize;
                    if self.buffer.len() < total {
                        return None;
                    }
                    return Some(self.buffer.drain(..total).collect());
                }
                Err(e) => {
                    warn!("Dropping unframeable data: {}", e);
                    self.buffer.drain(..1);
                }
            }
        }
    }
}

fn find_prefix(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(PREFIX_BYTES.len())
        .position(|w| w == PREFIX_BYTES)
}

/// Write side of a session.
pub struct FrameWriter {
    stream: Option<OwnedWriteHalf>,
    write_timeout: Duration,
}

impl FrameWriter {
    fn new(stream: OwnedWriteHalf, write_timeout: Duration) -> Self {
        Self {
            stream: Some(stream),
            write_timeout,
        }
    }

    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(TuyaError::ConnectionLost)?;
        timeout(self.write_timeout, stream.write_all(frame))
            .await
            .map_err(|_| TuyaError::Io("Write timeout".to_string()))?
            .map_err(TuyaError::from)
    }

    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}
