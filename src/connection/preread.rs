//! Replay of look-ahead bytes in front of a blocking connection.

use std::time::Duration;

use uuid::Uuid;

use super::Connection;
use crate::error::ConnectionError;

/// Replays bytes that were read ahead before delegating reads to the inner connection.
pub struct PreReadConnection {
    inner: Box<dyn Connection>,
    buffer: Vec<u8>,
    offset: usize,
}

impl PreReadConnection {
    pub fn new(inner: Box<dyn Connection>, bytes: &[u8]) -> Self {
        Self {
            inner,
            buffer: bytes.to_vec(),
            offset: 0,
        }
    }

    /// Put `bytes` in front of `conn`'s input. An existing pre-read wrapper absorbs them
    /// into its own buffer rather than being wrapped a second time.
    pub fn wrap(mut conn: Box<dyn Connection>, bytes: &[u8]) -> Box<dyn Connection> {
        if bytes.is_empty() || conn.try_prepend(bytes) {
            return conn;
        }
        Box::new(Self::new(conn, bytes))
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer[self.offset..]
    }
}

impl Connection for PreReadConnection {
    fn connection_id(&self) -> Uuid {
        self.inner.connection_id()
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ConnectionError> {
        let pending = self.buffered();
        if pending.is_empty() {
            return self.inner.read(buf, timeout);
        }
        let n = pending.len().min(buf.len());
        buf[..n].copy_from_slice(&pending[..n]);
        self.offset += n;
        if self.offset == self.buffer.len() {
            self.buffer = Vec::new();
            self.offset = 0;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8], flush: bool, timeout: Duration) -> Result<(), ConnectionError> {
        self.inner.write(buf, flush, timeout)
    }

    fn shutdown(&mut self, timeout: Duration) -> Result<(), ConnectionError> {
        self.inner.shutdown(timeout)
    }

    fn abort(&mut self) {
        self.buffer = Vec::new();
        self.offset = 0;
        self.inner.abort();
    }

    fn validate(&mut self, via: &str) -> bool {
        self.inner.validate(via)
    }

    fn try_prepend(&mut self, bytes: &[u8]) -> bool {
        let mut joined = Vec::with_capacity(bytes.len() + self.buffered().len());
        joined.extend_from_slice(bytes);
        joined.extend_from_slice(self.buffered());
        self.buffer = joined;
        self.offset = 0;
        true
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    struct Scripted {
        id: Uuid,
        input: VecDeque<u8>,
    }

    impl Connection for Scripted {
        fn connection_id(&self) -> Uuid {
            self.id
        }

        fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, ConnectionError> {
            let n = buf.len().min(self.input.len());
            for slot in &mut buf[..n] {
                *slot = self.input.pop_front().unwrap();
            }
            Ok(n)
        }

        fn write(&mut self, _: &[u8], _: bool, _: Duration) -> Result<(), ConnectionError> {
            Ok(())
        }

        fn shutdown(&mut self, _: Duration) -> Result<(), ConnectionError> {
            Ok(())
        }

        fn abort(&mut self) {}
    }

    fn read_all(conn: &mut dyn Connection) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let n = conn.read(&mut buf, Duration::MAX).unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn replays_then_delegates() {
        let inner = Box::new(Scripted {
            id: Uuid::new_v4(),
            input: b"world".iter().copied().collect(),
        });
        let id = inner.id;
        let mut conn = PreReadConnection::wrap(inner, b"hello ");
        assert_eq!(conn.connection_id(), id);
        assert_eq!(read_all(conn.as_mut()), b"hello world");
    }

    #[test]
    fn nested_prepend_coalesces() {
        let inner = Box::new(Scripted {
            id: Uuid::new_v4(),
            input: b"!".iter().copied().collect(),
        });
        let conn = PreReadConnection::wrap(inner, b"cd");
        let mut conn = PreReadConnection::wrap(conn, b"ab");
        assert_eq!(read_all(conn.as_mut()), b"abcd!");
    }

    #[test]
    fn empty_prepend_is_noop() {
        let inner: Box<dyn Connection> = Box::new(Scripted {
            id: Uuid::new_v4(),
            input: VecDeque::new(),
        });
        let mut conn = PreReadConnection::wrap(inner, b"");
        assert!(!conn.try_prepend(b""));
    }
}
