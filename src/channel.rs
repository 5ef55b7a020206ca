//! Buffered, length-prefix-framed reader and writer over a stream
//! socket.
//!
//! The reader keeps every partially-received frame in its own buffer, so
//! `next_frame` is safe to race inside a `select!`: a dropped read loses
//! nothing. The writer buffers frames until an explicit flush or until
//! the buffer outgrows its capacity.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{Frame, FrameType, ProtocolError, HEADER_LEN};

// The loopback default MTU sizes are usually fairly large.
const INITIAL_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        FrameReader {
            inner,
            buf: vec![0; INITIAL_BUFFER_SIZE],
            start: 0,
            end: 0,
        }
    }

    /// Whether bytes are already buffered, so another frame may be
    /// available without touching the socket.
    pub fn has_buffered_data(&self) -> bool {
        self.start != self.end
    }

    /// Reads the next complete frame. Returns `Ok(None)` on a clean EOF
    /// at a frame boundary; an EOF inside a frame is an error.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, ChannelError> {
        loop {
            if let Some(frame) = self.parse_buffered()? {
                return Ok(Some(frame));
            }

            if self.fill().await? == 0 {
                if !self.has_buffered_data() {
                    return Ok(None);
                }

                let available = self.end - self.start;

                if available < HEADER_LEN {
                    return Err(ProtocolError::TruncatedHeader.into());
                }

                return Err(ProtocolError::TruncatedPayload {
                    got: available - HEADER_LEN,
                    expected: u32::from_le_bytes([
                        self.buf[self.start + 1],
                        self.buf[self.start + 2],
                        self.buf[self.start + 3],
                        self.buf[self.start + 4],
                    ]) as usize,
                }
                .into());
            }
        }
    }

    fn parse_buffered(&mut self) -> Result<Option<Frame>, ChannelError> {
        if self.end - self.start < HEADER_LEN {
            return Ok(None);
        }

        let header = &self.buf[self.start..self.start + HEADER_LEN];
        let frame_type = FrameType::from_byte(header[0])?;
        let value = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
        let payload_len = if frame_type.carries_payload() {
            value as usize
        } else {
            0
        };

        if self.end - self.start < HEADER_LEN + payload_len {
            return Ok(None);
        }

        let payload_start = self.start + HEADER_LEN;
        let payload = self.buf[payload_start..payload_start + payload_len].to_vec();
        self.start = payload_start + payload_len;

        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }

        Ok(Some(Frame {
            frame_type,
            value,
            payload,
        }))
    }

    async fn fill(&mut self) -> io::Result<usize> {
        if self.end == self.buf.len() {
            if self.start > 0 {
                self.buf.copy_within(self.start..self.end, 0);
                self.end -= self.start;
                self.start = 0;
            } else {
                self.buf.resize(self.buf.len() * 2, 0);
            }
        }

        let read = self.inner.read(&mut self.buf[self.end..]).await?;
        self.end += read;
        Ok(read)
    }
}

pub struct FrameWriter<W> {
    inner: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        FrameWriter {
            inner,
            buf: Vec::with_capacity(INITIAL_BUFFER_SIZE),
        }
    }

    /// Appends a data frame; drains the buffer when `flush` is requested
    /// or the buffer has outgrown its capacity.
    pub async fn write_data(
        &mut self,
        frame_type: FrameType,
        payload: &[u8],
        flush: bool,
    ) -> io::Result<()> {
        self.buf
            .extend_from_slice(&Frame::header(frame_type, payload.len() as u32));
        self.buf.extend_from_slice(payload);

        if flush || self.buf.len() >= INITIAL_BUFFER_SIZE {
            self.flush().await?;
        }

        Ok(())
    }

    /// Writes a payloadless control frame whose header value is the
    /// datum, and flushes.
    pub async fn write_control(&mut self, frame_type: FrameType, value: u32) -> io::Result<()> {
        self.buf.extend_from_slice(&Frame::header(frame_type, value));
        self.flush().await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            self.inner.write_all(&self.buf).await?;
            self.buf.clear();
        }

        self.inner.flush().await
    }
}
