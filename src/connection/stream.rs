//! Blocking connections over sockets and rustls streams.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use uuid::Uuid;

use super::Connection;
use crate::error::ConnectionError;

/// A blocking stream a [`StreamConnection`] can own.
pub trait IoStream: Read + Write + Send {
    /// Apply `timeout` to subsequent reads and writes; `None` blocks indefinitely.
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Close the write direction, leaving reads open.
    fn shutdown_write(&mut self) -> io::Result<()>;

    /// Release OS resources immediately.
    fn abort(&mut self) {}
}

impl IoStream for TcpStream {
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }

    fn abort(&mut self) {
        let _ = self.shutdown(Shutdown::Both);
    }
}

#[cfg(unix)]
impl IoStream for std::os::unix::net::UnixStream {
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }

    fn abort(&mut self) {
        let _ = self.shutdown(Shutdown::Both);
    }
}

impl<S: IoStream> IoStream for rustls::StreamOwned<rustls::ClientConnection, S> {
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.sock.set_io_timeout(timeout)
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        self.conn.send_close_notify();
        self.flush()?;
        self.sock.shutdown_write()
    }

    fn abort(&mut self) {
        self.sock.abort();
    }
}

impl<S: IoStream> IoStream for rustls::StreamOwned<rustls::ServerConnection, S> {
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.sock.set_io_timeout(timeout)
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        self.conn.send_close_notify();
        self.flush()?;
        self.sock.shutdown_write()
    }

    fn abort(&mut self) {
        self.sock.abort();
    }
}

/// Socket timeouts reject zero, and `Duration::MAX` means "no timeout".
fn socket_timeout(timeout: Duration) -> Result<Option<Duration>, ConnectionError> {
    if timeout.is_zero() {
        Err(ConnectionError::Timeout { timeout })
    } else if timeout == Duration::MAX {
        Ok(None)
    } else {
        Ok(Some(timeout))
    }
}

/// [`Connection`] over an exclusively owned blocking stream.
pub struct StreamConnection<S: IoStream> {
    id: Uuid,
    stream: Option<S>,
}

impl<S: IoStream> StreamConnection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            id: Uuid::new_v4(),
            stream: Some(stream),
        }
    }

    /// Keep the id of the connection this stream was layered over.
    pub fn with_id(stream: S, id: Uuid) -> Self {
        Self {
            id,
            stream: Some(stream),
        }
    }

    pub fn get_ref(&self) -> Option<&S> {
        self.stream.as_ref()
    }

    fn stream(&mut self, timeout: Duration) -> Result<&mut S, ConnectionError> {
        let stream = self.stream.as_mut().ok_or(ConnectionError::Aborted)?;
        stream
            .set_io_timeout(socket_timeout(timeout)?)
            .map_err(|e| ConnectionError::from_io(e, timeout))?;
        Ok(stream)
    }
}

impl<S: IoStream> Connection for StreamConnection<S> {
    fn connection_id(&self) -> Uuid {
        self.id
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ConnectionError> {
        let stream = self.stream(timeout)?;
        loop {
            match stream.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ConnectionError::from_io(e, timeout)),
            }
        }
    }

    fn write(&mut self, buf: &[u8], flush: bool, timeout: Duration) -> Result<(), ConnectionError> {
        let stream = self.stream(timeout)?;
        stream
            .write_all(buf)
            .map_err(|e| ConnectionError::from_io(e, timeout))?;
        if flush {
            stream
                .flush()
                .map_err(|e| ConnectionError::from_io(e, timeout))?;
        }
        Ok(())
    }

    fn shutdown(&mut self, timeout: Duration) -> Result<(), ConnectionError> {
        self.stream(timeout)?
            .shutdown_write()
            .map_err(|e| ConnectionError::from_io(e, timeout))
    }

    fn abort(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            tracing::debug!(connection_id = %self.id, "aborting connection");
            stream.abort();
        }
    }
}

/// A [`Connection`] viewed as a plain `Read + Write` stream, for upgrade providers that
/// layer a protocol (such as TLS) over it.
pub struct ConnectionStream {
    inner: Box<dyn Connection>,
    timeout: Duration,
}

impl ConnectionStream {
    pub fn new(inner: Box<dyn Connection>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn connection_id(&self) -> Uuid {
        self.inner.connection_id()
    }

    pub fn into_inner(self) -> Box<dyn Connection> {
        self.inner
    }
}

impl Read for ConnectionStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner
            .read(buf, self.timeout)
            .map_err(ConnectionError::into_io)
    }
}

impl Write for ConnectionStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .write(buf, false, self.timeout)
            .map_err(ConnectionError::into_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner
            .write(&[], true, self.timeout)
            .map_err(ConnectionError::into_io)
    }
}

impl IoStream for ConnectionStream {
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.timeout = timeout.unwrap_or(Duration::MAX);
        Ok(())
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        self.inner
            .shutdown(self.timeout)
            .map_err(ConnectionError::into_io)
    }

    fn abort(&mut self) {
        self.inner.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (server, _) = listener.accept().unwrap();
        (client.join().unwrap(), server)
    }

    #[test]
    fn read_write_and_half_close() {
        let (a, b) = pair();
        let mut a = StreamConnection::new(a);
        let mut b = StreamConnection::new(b);
        a.write(b"ping", true, Duration::from_secs(5)).unwrap();
        a.shutdown(Duration::from_secs(5)).unwrap();

        let mut buf = [0u8; 16];
        let mut got = Vec::new();
        loop {
            let n = b.read(&mut buf, Duration::from_secs(5)).unwrap();
            if n == 0 {
                break;
            }
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"ping");
    }

    #[test]
    fn read_times_out() {
        let (a, _b) = pair();
        let mut a = StreamConnection::new(a);
        let mut buf = [0u8; 4];
        let err = a.read(&mut buf, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout { .. }));
    }

    #[test]
    fn abort_is_idempotent_and_sticky() {
        let (a, _b) = pair();
        let mut a = StreamConnection::new(a);
        a.abort();
        a.abort();
        let err = a.write(b"x", true, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ConnectionError::Aborted));
    }

    #[test]
    fn connection_stream_round_trips() {
        let (a, b) = pair();
        let mut stream = ConnectionStream::new(
            Box::new(StreamConnection::new(a)),
            Duration::from_secs(5),
        );
        let mut b = StreamConnection::new(b);
        stream.write_all(b"hello").unwrap();
        stream.flush().unwrap();
        let mut buf = [0u8; 5];
        let mut read = 0;
        while read < 5 {
            read += b.read(&mut buf[read..], Duration::from_secs(5)).unwrap();
        }
        assert_eq!(&buf, b"hello");
    }
}
