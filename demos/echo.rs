//! Loopback echo over a duplex framing session.
//!
//! `cargo run --example echo` runs in the clear; `cargo run --example echo -- tls` upgrades
//! the stream with a throwaway certificate first. Set `RUST_LOG=netframing=trace` to watch
//! the handshake.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

use netframing::connection::AsyncStreamConnection;
use netframing::framing::FramingMode;
use netframing::handshake::{nonblocking, ClientOptions, Endpoint};
use netframing::upgrade::{
    AsyncUpgradeAcceptor, AsyncUpgradeInitiator, PemSource, TlsSettings, TlsUpgradeProvider,
};
use netframing::FramingSettings;

const CONTENT_TYPE: &str = "application/soap+msbinsession1";
const TIMEOUT: Duration = Duration::from_secs(10);

fn tls_provider() -> anyhow::Result<TlsUpgradeProvider> {
    let ca_key = KeyPair::generate()?;
    let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca = ca_params.self_signed(&ca_key)?;
    let key = KeyPair::generate()?;
    let cert = CertificateParams::new(vec!["localhost".to_string()])?.signed_by(&key, &ca, &ca_key)?;

    let settings = TlsSettings {
        server_certificate: Some(PemSource::Pem(cert.pem())),
        server_key: Some(PemSource::Pem(key.serialize_pem())),
        trust_roots: Some(PemSource::Pem(ca.pem())),
        ..TlsSettings::default()
    };
    Ok(TlsUpgradeProvider::open(&settings)?)
}

async fn serve(listener: TcpListener, tls: Option<Arc<TlsUpgradeProvider>>) -> anyhow::Result<()> {
    let (stream, peer) = listener.accept().await?;
    tracing::info!(%peer, "accepted connection");

    let mut acceptor = tls.as_deref().map(TlsUpgradeProvider::create_acceptor).transpose()?;
    let endpoint = Endpoint::new().with_content_types([CONTENT_TYPE]);
    let mut session = nonblocking::accept(
        Box::new(AsyncStreamConnection::new(stream)),
        &FramingSettings::default(),
        &endpoint,
        acceptor.as_mut().map(|a| a as &mut dyn AsyncUpgradeAcceptor),
    )
    .await?;
    tracing::info!(via = session.via(), upgrades = ?session.upgrades(), "session open");

    while let Some(envelope) = session.receive_envelope(TIMEOUT).await? {
        tracing::info!(bytes = envelope.len(), "echoing envelope");
        session.send_envelope(&envelope, TIMEOUT).await?;
    }
    session.close(TIMEOUT).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let tls = if std::env::args().any(|arg| arg == "tls") {
        Some(Arc::new(tls_provider().context("building tls credentials")?))
    } else {
        None
    };

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = tokio::spawn(serve(listener, tls.clone()));

    let via = format!("net.tcp://localhost:{}/echo", addr.port());
    let mut initiator = tls
        .as_deref()
        .map(|provider| provider.create_initiator(&via))
        .transpose()?;
    let stream = TcpStream::connect(addr).await?;
    let options = ClientOptions::new(FramingMode::Duplex, via, CONTENT_TYPE);
    let mut client = nonblocking::connect(
        Box::new(AsyncStreamConnection::new(stream)),
        &options,
        initiator.as_mut().map(|i| i as &mut dyn AsyncUpgradeInitiator),
    )
    .await?;
    if let Some(security) = client.remote_security() {
        tracing::info!(server = ?security.identity, "server authenticated");
    }

    for message in ["hello", "framed", "world"] {
        client.send_envelope(message.as_bytes(), TIMEOUT).await?;
        let reply = client
            .receive_envelope(TIMEOUT)
            .await?
            .context("server ended the session early")?;
        println!("{}", String::from_utf8_lossy(&reply));
    }
    client.close(TIMEOUT).await?;
    server.await??;
    Ok(())
}
