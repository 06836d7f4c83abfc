use std::io;
use std::net::{TcpListener, TcpStream};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use uuid::Uuid;

use netframing::connection::{AsyncConnection, AsyncStreamConnection, Connection, StreamConnection};
use netframing::error::{DecoderError, ProtocolError};
use netframing::framing::{encode_fault, FaultKind, FramingMode};
use netframing::handshake::{blocking, nonblocking, ClientOptions, Endpoint, ViaValidation};
use netframing::upgrade::{
    AsyncUpgradeAcceptor, AsyncUpgradeInitiator, RemoteSecurity, StreamSecurity,
};
use netframing::{Error, FramingSettings, Result};

const CT: &str = "application/soap+msbinsession1";
const VIA: &str = "net.tcp://localhost/echo";
const TIMEOUT: Duration = Duration::from_secs(5);
const XOR_UPGRADE: &str = "application/x-xor";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn pair() -> (Box<dyn AsyncConnection>, Box<dyn AsyncConnection>) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (
        Box::new(AsyncStreamConnection::new(a)),
        Box::new(AsyncStreamConnection::new(b)),
    )
}

fn expect_err<T>(result: Result<T>) -> Error {
    match result {
        Ok(_) => panic!("expected an error"),
        Err(e) => e,
    }
}

fn fault_kind(err: &Error) -> FaultKind {
    match err {
        Error::Fault(f) => f.kind,
        other => panic!("expected a fault, got {other:?}"),
    }
}

/// Upgrade that masks every byte; enough to prove the stream was swapped.
struct XorConnection {
    inner: Box<dyn AsyncConnection>,
    key: u8,
}

const XOR_KEY: u8 = 0x5A;

impl AsyncRead for XorConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let start = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            let key = self.key;
            for b in &mut buf.filled_mut()[start..] {
                *b ^= key;
            }
        }
        poll
    }
}

impl AsyncWrite for XorConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let masked: Vec<u8> = buf.iter().map(|b| b ^ self.key).collect();
        Pin::new(&mut self.inner).poll_write(cx, &masked)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl AsyncConnection for XorConnection {
    fn connection_id(&self) -> Uuid {
        self.inner.connection_id()
    }

    fn abort(&mut self) {
        self.inner.abort();
    }
}

/// Applies one XOR layer per key, in order, each over the previous one.
struct XorUpgrade {
    keys: Vec<u8>,
    requested: usize,
    applied: usize,
}

impl Default for XorUpgrade {
    fn default() -> Self {
        Self::layers(&[XOR_KEY])
    }
}

impl XorUpgrade {
    fn layers(keys: &[u8]) -> Self {
        Self {
            keys: keys.to_vec(),
            requested: 0,
            applied: 0,
        }
    }

    fn wrap(&mut self, conn: Box<dyn AsyncConnection>) -> Box<dyn AsyncConnection> {
        let key = self.keys[self.applied];
        self.applied += 1;
        Box::new(XorConnection { inner: conn, key })
    }
}

impl StreamSecurity for XorUpgrade {
    fn remote_security(&self) -> Option<&RemoteSecurity> {
        None
    }
}

#[async_trait]
impl AsyncUpgradeInitiator for XorUpgrade {
    fn next_upgrade(&mut self) -> Option<String> {
        if self.requested == self.keys.len() {
            return None;
        }
        self.requested += 1;
        Some(XOR_UPGRADE.to_string())
    }

    async fn initiate_upgrade(
        &mut self,
        conn: Box<dyn AsyncConnection>,
        _timeout: Duration,
    ) -> Result<Box<dyn AsyncConnection>> {
        Ok(self.wrap(conn))
    }
}

#[async_trait]
impl AsyncUpgradeAcceptor for XorUpgrade {
    fn can_upgrade(&self, upgrade: &str) -> bool {
        self.applied < self.keys.len() && upgrade == XOR_UPGRADE
    }

    async fn accept_upgrade(
        &mut self,
        conn: Box<dyn AsyncConnection>,
        _timeout: Duration,
    ) -> Result<Box<dyn AsyncConnection>> {
        Ok(self.wrap(conn))
    }
}

#[tokio::test]
async fn duplex_envelopes_flow_both_ways() {
    init_tracing();
    let (client_conn, server_conn) = pair();
    let server = tokio::spawn(async move {
        let mut session =
            nonblocking::accept(server_conn, &FramingSettings::default(), &Endpoint::new(), None)
                .await?;
        assert_eq!(session.mode(), FramingMode::Duplex);
        assert_eq!(session.via(), VIA);
        assert_eq!(session.content_type(), CT);
        let mut received = Vec::new();
        while let Some(envelope) = session.receive_envelope(TIMEOUT).await? {
            session.send_envelope(&envelope, TIMEOUT).await?;
            received.push(envelope);
        }
        session.close(TIMEOUT).await?;
        Ok::<_, Error>(received)
    });

    let options = ClientOptions::new(FramingMode::Duplex, VIA, CT);
    let mut client = nonblocking::connect(client_conn, &options, None)
        .await
        .unwrap();
    assert!(client.upgrades().is_empty());
    client.send_envelope(b"twelve bytes", TIMEOUT).await.unwrap();
    assert_eq!(
        client.receive_envelope(TIMEOUT).await.unwrap().as_deref(),
        Some(&b"twelve bytes"[..])
    );
    client.close(TIMEOUT).await.unwrap();
    assert_eq!(client.receive_envelope(TIMEOUT).await.unwrap(), None);

    let received = server.await.unwrap().unwrap();
    assert_eq!(received, vec![Bytes::from_static(b"twelve bytes")]);
}

#[tokio::test]
async fn tiny_read_buffers_reassemble_random_envelopes() {
    let payloads: Vec<Vec<u8>> = {
        let mut rng = rand::thread_rng();
        (0..20)
            .map(|_| {
                let mut payload = vec![0u8; rng.gen_range(0..2000)];
                rng.fill(&mut payload[..]);
                payload
            })
            .collect()
    };
    let settings = FramingSettings {
        connection_buffer_size: 7,
        ..FramingSettings::default()
    };

    let (client_conn, server_conn) = pair();
    let server_settings = settings.clone();
    let server = tokio::spawn(async move {
        let mut session =
            nonblocking::accept(server_conn, &server_settings, &Endpoint::new(), None).await?;
        let mut received = Vec::new();
        while let Some(envelope) = session.receive_envelope(TIMEOUT).await? {
            received.push(envelope.to_vec());
        }
        Ok::<_, Error>(received)
    });

    let options = ClientOptions::new(FramingMode::Duplex, VIA, CT).with_settings(settings);
    let mut client = nonblocking::connect(client_conn, &options, None)
        .await
        .unwrap();
    for payload in &payloads {
        client.send_envelope(payload, TIMEOUT).await.unwrap();
    }
    client.close(TIMEOUT).await.unwrap();
    assert_eq!(server.await.unwrap().unwrap(), payloads);
}

#[tokio::test]
async fn oversized_via_is_faulted() {
    let (client_conn, server_conn) = pair();
    let server = tokio::spawn(async move {
        let settings = FramingSettings {
            max_via_size: 10,
            ..FramingSettings::default()
        };
        expect_err(nonblocking::accept(server_conn, &settings, &Endpoint::new(), None).await)
    });

    let via = format!("net.tcp://{}/svc", "h".repeat(26));
    assert_eq!(via.len(), 40);
    let options = ClientOptions::new(FramingMode::Duplex, via, CT);
    let err = expect_err(nonblocking::connect(client_conn, &options, None).await);
    assert_eq!(fault_kind(&err), FaultKind::ViaTooLong);

    let server_err = server.await.unwrap();
    assert!(matches!(
        server_err,
        Error::Protocol(DecoderError {
            source: ProtocolError::QuotaExceeded { quota: 10, .. },
            ..
        })
    ));
}

#[tokio::test]
async fn unknown_content_type_is_faulted() {
    let (client_conn, server_conn) = pair();
    let server = tokio::spawn(async move {
        let endpoint = Endpoint::new().with_content_types(["application/other"]);
        expect_err(
            nonblocking::accept(server_conn, &FramingSettings::default(), &endpoint, None).await,
        )
    });

    let options = ClientOptions::new(FramingMode::Duplex, VIA, CT);
    let err = expect_err(nonblocking::connect(client_conn, &options, None).await);
    assert_eq!(fault_kind(&err), FaultKind::ContentTypeInvalid);
    assert_eq!(
        server.await.unwrap().fault_to_send(),
        Some(FaultKind::ContentTypeInvalid)
    );
}

#[tokio::test]
async fn endpoint_validator_fault_reaches_client() {
    let (client_conn, server_conn) = pair();
    let server = tokio::spawn(async move {
        let endpoint = Endpoint::new().with_via_validator(|via| {
            if via.ends_with("/known") {
                ViaValidation::Accepted
            } else {
                ViaValidation::Fault(FaultKind::EndpointNotFound)
            }
        });
        expect_err(
            nonblocking::accept(server_conn, &FramingSettings::default(), &endpoint, None).await,
        )
    });

    let options = ClientOptions::new(FramingMode::Duplex, VIA, CT);
    let err = expect_err(nonblocking::connect(client_conn, &options, None).await);
    match &err {
        Error::Fault(f) => {
            assert_eq!(f.kind, FaultKind::EndpointNotFound);
            assert_eq!(f.via, VIA);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(server.await.unwrap(), Error::Rejected { .. }));
}

#[tokio::test]
async fn refused_via_closes_without_reply() {
    let (client_conn, server_conn) = pair();
    let server = tokio::spawn(async move {
        let endpoint = Endpoint::new().with_via_validator(|_| ViaValidation::Rejected);
        expect_err(
            nonblocking::accept(server_conn, &FramingSettings::default(), &endpoint, None).await,
        )
    });

    let options = ClientOptions::new(FramingMode::Duplex, VIA, CT);
    let err = expect_err(nonblocking::connect(client_conn, &options, None).await);
    assert!(matches!(
        err,
        Error::Protocol(DecoderError {
            source: ProtocolError::PrematureEof,
            ..
        })
    ));
    assert!(matches!(server.await.unwrap(), Error::ViaRefused { .. }));
}

#[tokio::test]
async fn unsupported_mode_gets_fault_bytes() {
    let (mut client_conn, server_conn) = pair();
    let server = tokio::spawn(async move {
        expect_err(
            nonblocking::accept(server_conn, &FramingSettings::default(), &Endpoint::new(), None)
                .await,
        )
    });

    AsyncConnection::write(client_conn.as_mut(), &[0x00, 0x01, 0x00, 0x01, 0x09], true, TIMEOUT)
        .await
        .unwrap();
    let mut reply = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let n = AsyncConnection::read(client_conn.as_mut(), &mut buf, TIMEOUT)
            .await
            .unwrap();
        if n == 0 {
            break;
        }
        reply.extend_from_slice(&buf[..n]);
    }
    client_conn.abort();
    assert_eq!(reply, encode_fault(&FaultKind::UnsupportedMode.fault_string()));
    assert!(matches!(
        server.await.unwrap(),
        Error::Protocol(DecoderError {
            source: ProtocolError::UnsupportedMode(9),
            ..
        })
    ));
}

#[tokio::test]
async fn truncated_preamble_is_premature_eof() {
    let (mut client_conn, server_conn) = pair();
    let server = tokio::spawn(async move {
        expect_err(
            nonblocking::accept(server_conn, &FramingSettings::default(), &Endpoint::new(), None)
                .await,
        )
    });
    AsyncConnection::write(client_conn.as_mut(), &[0x00, 0x01], true, TIMEOUT)
        .await
        .unwrap();
    AsyncConnection::shutdown(client_conn.as_mut(), TIMEOUT)
        .await
        .unwrap();
    assert!(matches!(
        server.await.unwrap(),
        Error::Protocol(DecoderError {
            source: ProtocolError::PrematureEof,
            ..
        })
    ));
}

#[tokio::test]
async fn upgraded_stream_carries_the_rest_of_the_session() {
    init_tracing();
    let (client_conn, server_conn) = pair();
    let server = tokio::spawn(async move {
        let mut acceptor = XorUpgrade::default();
        let mut session = nonblocking::accept(
            server_conn,
            &FramingSettings::default(),
            &Endpoint::new(),
            Some(&mut acceptor),
        )
        .await?;
        assert_eq!(session.upgrades(), [XOR_UPGRADE.to_string()]);
        assert!(session.remote_security().is_none());
        let envelope = session.receive_envelope(TIMEOUT).await?;
        session.send_envelope(b"masked reply", TIMEOUT).await?;
        session.close(TIMEOUT).await?;
        Ok::<_, Error>(envelope)
    });

    let mut initiator = XorUpgrade::default();
    let options = ClientOptions::new(FramingMode::Duplex, VIA, CT);
    let mut client = nonblocking::connect(client_conn, &options, Some(&mut initiator))
        .await
        .unwrap();
    assert_eq!(client.upgrades(), [XOR_UPGRADE.to_string()]);
    client.send_envelope(b"masked request", TIMEOUT).await.unwrap();
    assert_eq!(
        client.receive_envelope(TIMEOUT).await.unwrap().as_deref(),
        Some(&b"masked reply"[..])
    );
    client.close(TIMEOUT).await.unwrap();
    assert_eq!(
        server.await.unwrap().unwrap().as_deref(),
        Some(&b"masked request"[..])
    );
}

#[tokio::test]
async fn stacked_upgrades_apply_in_order() {
    let (client_conn, server_conn) = pair();
    let server = tokio::spawn(async move {
        let mut acceptor = XorUpgrade::layers(&[0x5A, 0xA5]);
        let mut session = nonblocking::accept(
            server_conn,
            &FramingSettings::default(),
            &Endpoint::new(),
            Some(&mut acceptor),
        )
        .await?;
        let upgrades = session.upgrades().to_vec();
        let envelope = session.receive_envelope(TIMEOUT).await?;
        session.send_envelope(b"two layers deep", TIMEOUT).await?;
        session.close(TIMEOUT).await?;
        Ok::<_, Error>((upgrades, envelope))
    });

    let mut initiator = XorUpgrade::layers(&[0x5A, 0xA5]);
    let options = ClientOptions::new(FramingMode::Duplex, VIA, CT);
    let mut client = nonblocking::connect(client_conn, &options, Some(&mut initiator))
        .await
        .unwrap();
    assert_eq!(client.upgrades(), [XOR_UPGRADE.to_string(), XOR_UPGRADE.to_string()]);
    client.send_envelope(b"stacked", TIMEOUT).await.unwrap();
    assert_eq!(
        client.receive_envelope(TIMEOUT).await.unwrap().as_deref(),
        Some(&b"two layers deep"[..])
    );
    client.close(TIMEOUT).await.unwrap();

    let (upgrades, envelope) = server.await.unwrap().unwrap();
    assert_eq!(upgrades, [XOR_UPGRADE.to_string(), XOR_UPGRADE.to_string()]);
    assert_eq!(envelope.as_deref(), Some(&b"stacked"[..]));
}

#[tokio::test]
async fn preamble_end_travels_through_the_last_upgrade() {
    let (client_conn, server_conn) = pair();
    let server = tokio::spawn(async move {
        // Second layer is the identity, so a PreambleEnd masked by the client's second
        // key arrives as garbage.
        let mut acceptor = XorUpgrade::layers(&[0x5A, 0x00]);
        expect_err(
            nonblocking::accept(
                server_conn,
                &FramingSettings::default(),
                &Endpoint::new(),
                Some(&mut acceptor),
            )
            .await,
        )
    });

    let mut initiator = XorUpgrade::layers(&[0x5A, 0xA5]);
    let options = ClientOptions::new(FramingMode::Duplex, VIA, CT);
    assert!(nonblocking::connect(client_conn, &options, Some(&mut initiator))
        .await
        .is_err());
    assert!(matches!(server.await.unwrap(), Error::Protocol(_)));
}

#[tokio::test]
async fn upgrade_without_acceptor_is_upgrade_invalid() {
    let (client_conn, server_conn) = pair();
    let server = tokio::spawn(async move {
        expect_err(
            nonblocking::accept(server_conn, &FramingSettings::default(), &Endpoint::new(), None)
                .await,
        )
    });

    let mut initiator = XorUpgrade::default();
    let options = ClientOptions::new(FramingMode::Duplex, VIA, CT);
    let err = expect_err(nonblocking::connect(client_conn, &options, Some(&mut initiator)).await);
    assert_eq!(fault_kind(&err), FaultKind::UpgradeInvalid);
    assert!(matches!(
        server.await.unwrap(),
        Error::Protocol(DecoderError {
            source: ProtocolError::UpgradeNotSupported(_),
            ..
        })
    ));
}

#[tokio::test]
async fn singleton_request_and_reply() {
    let (client_conn, server_conn) = pair();
    let server = tokio::spawn(async move {
        let mut session =
            nonblocking::accept(server_conn, &FramingSettings::default(), &Endpoint::new(), None)
                .await?;
        assert_eq!(session.mode(), FramingMode::Singleton);
        let request = session.receive_envelope(TIMEOUT).await?;
        session.send_envelope(b"pong", TIMEOUT).await?;
        let after = session.receive_envelope(TIMEOUT).await?;
        session.close(TIMEOUT).await?;
        Ok::<_, Error>((request, after))
    });

    let options = ClientOptions::new(FramingMode::Singleton, VIA, CT);
    let mut client = nonblocking::connect(client_conn, &options, None)
        .await
        .unwrap();
    client.send_envelope(b"ping", TIMEOUT).await.unwrap();
    assert!(client.send_envelope(b"again", TIMEOUT).await.is_err());
    assert_eq!(
        client.receive_envelope(TIMEOUT).await.unwrap().as_deref(),
        Some(&b"pong"[..])
    );
    assert_eq!(client.receive_envelope(TIMEOUT).await.unwrap(), None);
    client.close(TIMEOUT).await.unwrap();

    let (request, after) = server.await.unwrap().unwrap();
    assert_eq!(request.as_deref(), Some(&b"ping"[..]));
    assert_eq!(after, None);
}

#[tokio::test]
async fn sized_singleton_payload_runs_to_end_of_stream() {
    let (client_conn, server_conn) = pair();
    let server = tokio::spawn(async move {
        let mut session =
            nonblocking::accept(server_conn, &FramingSettings::default(), &Endpoint::new(), None)
                .await?;
        let payload = session.receive_envelope(TIMEOUT).await?;
        let after = session.receive_envelope(TIMEOUT).await?;
        Ok::<_, Error>((payload, after))
    });

    let options = ClientOptions::new(FramingMode::SingletonSized, VIA, CT);
    let mut client = nonblocking::connect(client_conn, &options, None)
        .await
        .unwrap();
    client.send_envelope(b"raw payload bytes", TIMEOUT).await.unwrap();
    client.close(TIMEOUT).await.unwrap();

    let (payload, after) = server.await.unwrap().unwrap();
    assert_eq!(payload.as_deref(), Some(&b"raw payload bytes"[..]));
    assert_eq!(after, None);
}

#[tokio::test]
async fn oversized_envelope_faults_the_sender() {
    let settings = FramingSettings {
        max_message_size: 16,
        ..FramingSettings::default()
    };
    let (client_conn, server_conn) = pair();
    let server_settings = settings.clone();
    let server = tokio::spawn(async move {
        let mut session =
            nonblocking::accept(server_conn, &server_settings, &Endpoint::new(), None).await?;
        Ok::<_, Error>(expect_err(session.receive_envelope(TIMEOUT).await))
    });

    let options = ClientOptions::new(FramingMode::Duplex, VIA, CT);
    let mut client = nonblocking::connect(client_conn, &options, None)
        .await
        .unwrap();
    client.send_envelope(&[1u8; 64], TIMEOUT).await.unwrap();
    let err = expect_err(client.receive_envelope(TIMEOUT).await);
    assert_eq!(fault_kind(&err), FaultKind::MaxMessageSizeExceeded);
    assert_eq!(
        server.await.unwrap().unwrap().fault_to_send(),
        Some(FaultKind::MaxMessageSizeExceeded)
    );
}

#[test]
fn blocking_session_over_tcp() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = std::thread::spawn(move || -> Result<Vec<Bytes>> {
        let (stream, _) = listener.accept().map_err(anyhow::Error::from)?;
        let mut session = blocking::accept(
            Box::new(StreamConnection::new(stream)),
            &FramingSettings::default(),
            &Endpoint::new(),
            None,
        )?;
        let mut received = Vec::new();
        while let Some(envelope) = session.receive_envelope(TIMEOUT)? {
            session.send_envelope(&envelope, TIMEOUT)?;
            received.push(envelope);
        }
        session.close(TIMEOUT)?;
        Ok(received)
    });

    let stream = TcpStream::connect(addr).unwrap();
    let options = ClientOptions::new(FramingMode::Duplex, format!("net.tcp://{addr}/echo"), CT);
    let mut client =
        blocking::connect(Box::new(StreamConnection::new(stream)), &options, None).unwrap();
    for payload in [&b"first"[..], &b""[..], &b"third envelope"[..]] {
        client.send_envelope(payload, TIMEOUT).unwrap();
        assert_eq!(
            client.receive_envelope(TIMEOUT).unwrap().as_deref(),
            Some(payload)
        );
    }
    client.close(TIMEOUT).unwrap();
    assert_eq!(client.receive_envelope(TIMEOUT).unwrap(), None);
    assert_eq!(server.join().unwrap().unwrap().len(), 3);
}

/// Runs `server` on the accepted end of a loopback TCP connection.
fn blocking_pair<T: Send + 'static>(
    server: impl FnOnce(Box<dyn Connection>) -> T + Send + 'static,
) -> (TcpStream, std::thread::JoinHandle<T>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        server(Box::new(StreamConnection::new(stream)))
    });
    (TcpStream::connect(addr).unwrap(), handle)
}

fn blocking_client(stream: TcpStream, options: &ClientOptions) -> Result<()> {
    blocking::connect(Box::new(StreamConnection::new(stream)), options, None).map(|_| ())
}

#[test]
fn blocking_oversized_via_is_faulted() {
    let (stream, server) = blocking_pair(|conn| {
        let settings = FramingSettings {
            max_via_size: 10,
            ..FramingSettings::default()
        };
        expect_err(blocking::accept(conn, &settings, &Endpoint::new(), None))
    });

    let via = format!("net.tcp://{}/svc", "h".repeat(26));
    let options = ClientOptions::new(FramingMode::Duplex, via, CT);
    let err = expect_err(blocking_client(stream, &options));
    assert_eq!(fault_kind(&err), FaultKind::ViaTooLong);
    assert!(matches!(
        server.join().unwrap(),
        Error::Protocol(DecoderError {
            source: ProtocolError::QuotaExceeded { quota: 10, .. },
            ..
        })
    ));
}

#[test]
fn blocking_unknown_content_type_is_faulted() {
    let (stream, server) = blocking_pair(|conn| {
        let endpoint = Endpoint::new().with_content_types(["application/other"]);
        expect_err(blocking::accept(conn, &FramingSettings::default(), &endpoint, None))
    });

    let options = ClientOptions::new(FramingMode::Duplex, VIA, CT);
    let err = expect_err(blocking_client(stream, &options));
    assert_eq!(fault_kind(&err), FaultKind::ContentTypeInvalid);
    assert_eq!(
        server.join().unwrap().fault_to_send(),
        Some(FaultKind::ContentTypeInvalid)
    );
}

#[test]
fn blocking_refused_via_sends_nothing() {
    let (stream, server) = blocking_pair(|conn| {
        let endpoint = Endpoint::new().with_via_validator(|_| ViaValidation::Rejected);
        expect_err(blocking::accept(conn, &FramingSettings::default(), &endpoint, None))
    });

    let options = ClientOptions::new(FramingMode::Duplex, VIA, CT);
    let err = expect_err(blocking_client(stream, &options));
    // The server closes without a fault, so whatever the client sees, it is not one.
    assert!(!matches!(err, Error::Fault(_)), "unexpected {err:?}");
    assert!(matches!(server.join().unwrap(), Error::ViaRefused { .. }));
}

#[test]
fn blocking_unsupported_mode_gets_fault_bytes() {
    use std::io::{Read, Write};

    let (mut stream, server) = blocking_pair(|conn| {
        expect_err(blocking::accept(
            conn,
            &FramingSettings::default(),
            &Endpoint::new(),
            None,
        ))
    });

    stream.write_all(&[0x00, 0x01, 0x00, 0x01, 0x09]).unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).unwrap();
    drop(stream);
    assert_eq!(reply, encode_fault(&FaultKind::UnsupportedMode.fault_string()));
    assert!(matches!(
        server.join().unwrap(),
        Error::Protocol(DecoderError {
            source: ProtocolError::UnsupportedMode(9),
            ..
        })
    ));
}

#[test]
fn blocking_truncated_preamble_is_premature_eof() {
    use std::io::Write;

    let (mut stream, server) = blocking_pair(|conn| {
        expect_err(blocking::accept(
            conn,
            &FramingSettings::default(),
            &Endpoint::new(),
            None,
        ))
    });
    stream.write_all(&[0x00, 0x01]).unwrap();
    stream.shutdown(std::net::Shutdown::Write).unwrap();
    assert!(matches!(
        server.join().unwrap(),
        Error::Protocol(DecoderError {
            source: ProtocolError::PrematureEof,
            ..
        })
    ));
}

#[test]
fn blocking_singleton_request_and_reply() {
    let (stream, server) = blocking_pair(|conn| -> Result<_> {
        let mut session = blocking::accept(conn, &FramingSettings::default(), &Endpoint::new(), None)?;
        assert_eq!(session.mode(), FramingMode::Singleton);
        let request = session.receive_envelope(TIMEOUT)?;
        session.send_envelope(b"pong", TIMEOUT)?;
        let after = session.receive_envelope(TIMEOUT)?;
        session.close(TIMEOUT)?;
        Ok((request, after))
    });

    let options = ClientOptions::new(FramingMode::Singleton, VIA, CT);
    let mut client =
        blocking::connect(Box::new(StreamConnection::new(stream)), &options, None).unwrap();
    client.send_envelope(b"ping", TIMEOUT).unwrap();
    assert!(client.send_envelope(b"again", TIMEOUT).is_err());
    assert_eq!(
        client.receive_envelope(TIMEOUT).unwrap().as_deref(),
        Some(&b"pong"[..])
    );
    assert_eq!(client.receive_envelope(TIMEOUT).unwrap(), None);
    client.close(TIMEOUT).unwrap();

    let (request, after) = server.join().unwrap().unwrap();
    assert_eq!(request.as_deref(), Some(&b"ping"[..]));
    assert_eq!(after, None);
}

#[test]
fn blocking_sized_singleton_payload_runs_to_end_of_stream() {
    let (stream, server) = blocking_pair(|conn| -> Result<_> {
        let mut session = blocking::accept(conn, &FramingSettings::default(), &Endpoint::new(), None)?;
        assert_eq!(session.mode(), FramingMode::SingletonSized);
        let payload = session.receive_envelope(TIMEOUT)?;
        let after = session.receive_envelope(TIMEOUT)?;
        Ok((payload, after))
    });

    let options = ClientOptions::new(FramingMode::SingletonSized, VIA, CT);
    let mut client =
        blocking::connect(Box::new(StreamConnection::new(stream)), &options, None).unwrap();
    client.send_envelope(b"raw payload bytes", TIMEOUT).unwrap();
    client.close(TIMEOUT).unwrap();

    let (payload, after) = server.join().unwrap().unwrap();
    assert_eq!(payload.as_deref(), Some(&b"raw payload bytes"[..]));
    assert_eq!(after, None);
}
