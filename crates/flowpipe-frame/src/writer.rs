use std::io::{ErrorKind, Write};

use bytes::{Buf, BytesMut};

use crate::codec::{encode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Buffered bytes above which `write_frame` drains to the stream without
/// waiting for an explicit flush.
const SOFT_FLUSH_THRESHOLD: usize = 64 * 1024;

/// Writes complete frames to any `Write` stream.
///
/// `write_frame` only buffers (draining early once the buffer grows large);
/// the caller decides when to `flush`. `send` writes and flushes.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Encode a frame into the write buffer.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.body.len() > self.config.max_body_size {
            return Err(FrameError::BodyTooLarge {
                size: frame.body.len(),
                max: self.config.max_body_size,
            });
        }

        encode_frame(frame, &mut self.buf)?;
        if self.buf.len() >= SOFT_FLUSH_THRESHOLD {
            self.drain()?;
        }
        Ok(())
    }

    /// Write a frame and flush it to the stream.
    pub fn send(&mut self, frame: &Frame) -> Result<()> {
        self.write_frame(frame)?;
        self.flush()
    }

    /// Drain buffered frames and flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        self.drain()?;
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    fn drain(&mut self) -> Result<()> {
        while !self.buf.is_empty() {
            match self.inner.write(&self.buf) {
                Ok(0) => {
                    self.buf.clear();
                    return Err(FrameError::Io(ErrorKind::WriteZero.into()));
                }
                Ok(n) => self.buf.advance(n),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.buf.clear();
                    return Err(FrameError::Io(err));
                }
            }
        }
        Ok(())
    }

    /// Bytes encoded but not yet written to the stream.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream. Unflushed frames are
    /// discarded.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}
