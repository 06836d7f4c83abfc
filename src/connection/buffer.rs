//! Read buffer shared by the handshake and the session that follows it.

use std::time::Duration;

use super::{AsyncConnection, Connection};
use crate::error::ConnectionError;

/// Fixed-capacity read buffer allocated once per connection session.
///
/// Decoders only ever see [`ReadBuffer::filled`]; consumed bytes are compacted away
/// before the next read.
#[derive(Debug)]
pub struct ReadBuffer {
    data: Box<[u8]>,
    start: usize,
    end: usize,
}

impl ReadBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity.max(1)].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes read but not yet consumed.
    pub fn filled(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn consume(&mut self, n: usize) {
        debug_assert!(self.start + n <= self.end);
        self.start = (self.start + n).min(self.end);
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Writable tail of the buffer, compacting unconsumed bytes to the front first.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        if self.start > 0 {
            self.data.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        &mut self.data[self.end..]
    }

    pub fn commit(&mut self, n: usize) {
        self.end = (self.end + n).min(self.data.len());
    }

    /// Remove and return every unconsumed byte.
    pub fn take_remaining(&mut self) -> Vec<u8> {
        let rest = self.filled().to_vec();
        self.start = 0;
        self.end = 0;
        rest
    }

    /// Read once from `conn`. Returns the number of bytes added; zero means end of stream.
    pub fn fill<C: Connection + ?Sized>(
        &mut self,
        conn: &mut C,
        timeout: Duration,
    ) -> Result<usize, ConnectionError> {
        let n = conn.read(self.spare_mut(), timeout)?;
        self.commit(n);
        Ok(n)
    }

    pub async fn fill_async<C: AsyncConnection + ?Sized>(
        &mut self,
        conn: &mut C,
        timeout: Duration,
    ) -> Result<usize, ConnectionError> {
        let n = conn.read(self.spare_mut(), timeout).await?;
        self.commit(n);
        Ok(n)
    }
}
