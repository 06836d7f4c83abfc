//! Connection abstraction over ordered, reliable byte streams.
//!
//! [`Connection`] is the blocking family and [`AsyncConnection`] the tokio family. Both own
//! their I/O object exclusively, and `&mut self` receivers keep at most one read and one
//! write outstanding. Pre-read wrappers replay buffered look-ahead before delegating, which
//! is how bytes read ahead of a stream upgrade survive the stream swap.

mod buffer;
mod nonblocking;
mod preread;
mod stream;
mod timeout;

use std::time::Duration;

use uuid::Uuid;

pub use buffer::ReadBuffer;
pub use nonblocking::{
    AsyncConnection, AsyncConnectionStream, AsyncPreReadConnection, AsyncStreamConnection,
};
pub use preread::PreReadConnection;
pub use stream::{ConnectionStream, IoStream, StreamConnection};
pub use timeout::TimeoutHelper;

use crate::error::ConnectionError;

/// A blocking byte-stream connection with per-call timeouts.
///
/// A `Duration::MAX` timeout waits indefinitely. Once [`Connection::abort`] has been called
/// every other operation fails with [`ConnectionError::Aborted`].
pub trait Connection: Send {
    /// Identifier used to correlate log events for this connection.
    fn connection_id(&self) -> Uuid;

    /// Read available bytes into `buf`; `Ok(0)` means the peer closed its write side.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ConnectionError>;

    /// Write all of `buf`, flushing afterwards when `flush` is set.
    fn write(&mut self, buf: &[u8], flush: bool, timeout: Duration) -> Result<(), ConnectionError>;

    /// Half-close: no more writes, reads continue until the peer closes.
    fn shutdown(&mut self, timeout: Duration) -> Result<(), ConnectionError>;

    /// Tear the connection down immediately. Idempotent.
    fn abort(&mut self);

    /// Connection-level check of the via before the server accepts a session.
    fn validate(&mut self, _via: &str) -> bool {
        true
    }

    /// Put `bytes` in front of any unread input, if this connection can buffer them.
    fn try_prepend(&mut self, _bytes: &[u8]) -> bool {
        false
    }
}

impl<C: Connection + ?Sized> Connection for Box<C> {
    fn connection_id(&self) -> Uuid {
        (**self).connection_id()
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ConnectionError> {
        (**self).read(buf, timeout)
    }

    fn write(&mut self, buf: &[u8], flush: bool, timeout: Duration) -> Result<(), ConnectionError> {
        (**self).write(buf, flush, timeout)
    }

    fn shutdown(&mut self, timeout: Duration) -> Result<(), ConnectionError> {
        (**self).shutdown(timeout)
    }

    fn abort(&mut self) {
        (**self).abort()
    }

    fn validate(&mut self, via: &str) -> bool {
        (**self).validate(via)
    }

    fn try_prepend(&mut self, bytes: &[u8]) -> bool {
        (**self).try_prepend(bytes)
    }
}
