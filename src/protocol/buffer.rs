//! Connection buffer
//!
//! Accumulates the bytes a client sends while its protocol is being probed.
//! Nothing is ever consumed from the buffer: once a routing decision is made the
//! whole content becomes the replay payload sent to the backend.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest single read performed while probing
const READ_CHUNK: usize = 4096;

/// Append-only probe buffer bounded by a fixed capacity
#[derive(Debug)]
pub struct ConnectionBuffer {
    data: BytesMut,
    capacity: usize,
}

impl ConnectionBuffer {
    /// Create an empty buffer that will never hold more than `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity.min(READ_CHUNK)),
            capacity,
        }
    }

    /// Bytes received so far
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Room left before the buffer is full
    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn is_full(&self) -> bool {
        self.data.len() >= self.capacity
    }

    /// Append bytes, refusing (and leaving the buffer untouched) if they do not fit
    pub fn extend(&mut self, bytes: &[u8]) -> io::Result<()> {
        if bytes.len() > self.remaining() {
            return Err(overflow(self.capacity));
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Perform one read from `reader`, never past the capacity
    ///
    /// Returns the number of bytes appended; `0` means end of stream.
    pub async fn fill_from<R>(&mut self, reader: &mut R) -> io::Result<usize>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let want = self.remaining().min(READ_CHUNK);
        if want == 0 {
            return Err(overflow(self.capacity));
        }

        let mut chunk = [0u8; READ_CHUNK];
        let n = reader.read(&mut chunk[..want]).await?;
        self.data.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Freeze the buffer into the replay payload
    pub fn into_replay(self) -> Bytes {
        self.data.freeze()
    }
}

fn overflow(capacity: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::Other,
        format!("probe buffer full ({} bytes)", capacity),
    )
}
