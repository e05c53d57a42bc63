//! Framed message transport.
//!
//! Messages are JSON payloads prefixed with a `Content-Length` header:
//!
//! ```text
//! Content-Length: 42\r\n
//! \r\n
//! {"id":1,"method":"query.compile","params":{}}
//! ```
//!
//! The transport is generic over any async byte stream pair: child process
//! stdio in production, an in-memory duplex in tests.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK: usize = 8 * 1024;

/// Reads length-prefixed frames from an async byte stream.
pub struct FrameReader<R> {
    inner: R,
    buffer: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
        }
    }

    /// Read the next complete frame payload.
    ///
    /// Returns `Ok(None)` on clean end-of-stream. A stream that ends in the
    /// middle of a frame is an error.
    pub async fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(payload) = extract_frame(&mut self.buffer)? {
                return Ok(Some(payload));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended mid-frame",
                ));
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Writes length-prefixed frames to an async byte stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one frame: header then payload, flushed.
    pub async fn write_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        let header = format!("Content-Length: {}\r\n\r\n", payload.len());
        self.inner.write_all(header.as_bytes()).await?;
        self.inner.write_all(payload).await?;
        self.inner.flush().await
    }

    /// Shut down the underlying stream (closes the server's stdin).
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Extract a complete frame payload from the buffer, stripping the header.
///
/// Returns `Ok(None)` if no complete frame is buffered yet.
fn extract_frame(buffer: &mut Vec<u8>) -> io::Result<Option<Vec<u8>>> {
    let Some(header_end) = find_header_end(buffer) else {
        return Ok(None);
    };

    let header = std::str::from_utf8(&buffer[..header_end])
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-UTF-8 frame header"))?;
    let content_length = parse_content_length(header).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "frame header missing Content-Length",
        )
    })?;

    let body_start = header_end + 4; // skip \r\n\r\n
    let message_end = body_start + content_length;
    if buffer.len() < message_end {
        return Ok(None); // incomplete body
    }

    let payload = buffer[body_start..message_end].to_vec();
    buffer.drain(..message_end);
    Ok(Some(payload))
}

/// Find the position of `\r\n\r\n` which separates the header from the body.
fn find_header_end(buffer: &[u8]) -> Option<usize> {
    for i in 0..buffer.len().saturating_sub(3) {
        if &buffer[i..i + 4] == b"\r\n\r\n" {
            return Some(i);
        }
    }
    None
}

/// Parse the Content-Length value from the frame header.
fn parse_content_length(header: &str) -> Option<usize> {
    for line in header.lines() {
        if let Some(value) = line.strip_prefix("Content-Length:") {
            return value.trim().parse().ok();
        }
    }
    None
}
