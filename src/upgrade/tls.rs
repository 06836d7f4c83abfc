//! TLS stream upgrade (`application/ssl-tls`) over rustls, blocking and async.

use std::fmt;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::{danger::ClientCertVerifier, WebPkiClientVerifier};
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};
use serde::{Deserialize, Serialize};

use super::{
    AsyncUpgradeAcceptor, AsyncUpgradeInitiator, RemoteSecurity, StreamSecurity,
    UpgradeAcceptor, UpgradeInitiator,
};
use crate::connection::{
    AsyncConnection, AsyncConnectionStream, AsyncStreamConnection, Connection, ConnectionStream,
    IoStream, StreamConnection, TimeoutHelper,
};
use crate::error::{ConnectionError, Error, SecurityError};
use crate::framing::TLS_UPGRADE;
use crate::Result;

/// RFC 9266 exporter label for `tls-exporter` channel bindings.
const CHANNEL_BINDING_LABEL: &[u8] = b"EXPORTER-Channel-Binding";
const CHANNEL_BINDING_LEN: usize = 32;

/// Whether the acceptor asks for, and insists on, a client certificate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientCertificatePolicy {
    #[default]
    None,
    Optional,
    Required,
}

/// PEM material, inline or on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PemSource {
    Path(PathBuf),
    Pem(String),
}

impl PemSource {
    fn read(&self) -> Result<Vec<u8>> {
        match self {
            PemSource::Path(path) => std::fs::read(path).map_err(|e| {
                SecurityError::Credentials(format!("reading {}: {e}", path.display())).into()
            }),
            PemSource::Pem(pem) => Ok(pem.as_bytes().to_vec()),
        }
    }
}

impl From<String> for PemSource {
    fn from(pem: String) -> Self {
        PemSource::Pem(pem)
    }
}

/// Credentials and policy for the TLS upgrade.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Server certificate chain; required to accept upgrades.
    pub server_certificate: Option<PemSource>,
    pub server_key: Option<PemSource>,
    /// Client certificate chain presented when initiating upgrades.
    pub client_certificate: Option<PemSource>,
    pub client_key: Option<PemSource>,
    /// Roots trusted for server certificates and, when requested, client certificates.
    pub trust_roots: Option<PemSource>,
    pub client_certificate_policy: ClientCertificatePolicy,
    /// Name checked against the server certificate instead of the via host.
    pub server_name: Option<String>,
}

/// Application check applied to the peer's certificate chain after rustls verified it.
pub trait CertificateValidator: Send + Sync {
    fn validate(&self, chain: &[CertificateDer<'static>]) -> std::result::Result<(), String>;
}

fn load_certificates(source: &PemSource) -> Result<Vec<CertificateDer<'static>>> {
    let pem = source.read()?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem.as_slice()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| SecurityError::Credentials(format!("parsing certificates: {e}")))?;
    if certs.is_empty() {
        return Err(SecurityError::Credentials("no certificates found".into()).into());
    }
    Ok(certs)
}

fn load_private_key(source: &PemSource) -> Result<PrivateKeyDer<'static>> {
    let pem = source.read()?;
    rustls_pemfile::private_key(&mut BufReader::new(pem.as_slice()))
        .map_err(|e| SecurityError::Credentials(format!("parsing private key: {e}")))?
        .ok_or_else(|| SecurityError::Credentials("no private key found".into()).into())
}

fn load_pair(
    cert: &Option<PemSource>,
    key: &Option<PemSource>,
    what: &str,
) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>> {
    match (cert, key) {
        (Some(cert), Some(key)) => Ok(Some((load_certificates(cert)?, load_private_key(key)?))),
        (None, None) => Ok(None),
        _ => Err(SecurityError::Credentials(format!(
            "{what} certificate and key must be configured together"
        ))
        .into()),
    }
}

fn config_error(e: impl fmt::Display) -> Error {
    SecurityError::Config(e.to_string()).into()
}

struct Credentials {
    client_config: Arc<ClientConfig>,
    server_config: Option<Arc<ServerConfig>>,
    policy: ClientCertificatePolicy,
    server_name: Option<String>,
}

/// Builds TLS initiators and acceptors from loaded credentials.
pub struct TlsUpgradeProvider {
    credentials: Option<Credentials>,
    validator: Option<Arc<dyn CertificateValidator>>,
}

impl TlsUpgradeProvider {
    /// Load credentials and build the rustls configurations.
    pub fn open(settings: &TlsSettings) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        if let Some(source) = &settings.trust_roots {
            for cert in load_certificates(source)? {
                roots.add(cert).map_err(|e| {
                    SecurityError::Credentials(format!("adding trust root: {e}"))
                })?;
            }
        }
        let roots = Arc::new(roots);

        let client_builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(config_error)?
            .with_root_certificates(roots.clone());
        let client_config = match load_pair(
            &settings.client_certificate,
            &settings.client_key,
            "client",
        )? {
            Some((certs, key)) => client_builder
                .with_client_auth_cert(certs, key)
                .map_err(config_error)?,
            None => client_builder.with_no_client_auth(),
        };

        let server_config = match load_pair(
            &settings.server_certificate,
            &settings.server_key,
            "server",
        )? {
            Some((certs, key)) => {
                let verifier = client_verifier(
                    settings.client_certificate_policy,
                    roots,
                    provider.clone(),
                )?;
                let config = ServerConfig::builder_with_provider(provider)
                    .with_safe_default_protocol_versions()
                    .map_err(config_error)?
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(certs, key)
                    .map_err(config_error)?;
                Some(Arc::new(config))
            }
            None => None,
        };

        tracing::debug!(
            server = server_config.is_some(),
            policy = ?settings.client_certificate_policy,
            "tls upgrade provider opened"
        );
        Ok(Self {
            credentials: Some(Credentials {
                client_config: Arc::new(client_config),
                server_config,
                policy: settings.client_certificate_policy,
                server_name: settings.server_name.clone(),
            }),
            validator: None,
        })
    }

    /// Check peer certificate chains with `validator` after TLS verification.
    pub fn with_validator(mut self, validator: Arc<dyn CertificateValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn is_open(&self) -> bool {
        self.credentials.is_some()
    }

    /// Release the loaded credentials; later factory calls fail.
    pub fn close(&mut self) {
        self.credentials = None;
    }

    fn credentials(&self) -> Result<&Credentials> {
        self.credentials
            .as_ref()
            .ok_or_else(|| SecurityError::NotOpen.into())
    }

    /// Initiator for one outbound connection to `via`. The server certificate is checked
    /// against the via host unless a server name is configured.
    pub fn create_initiator(&self, via: &str) -> Result<TlsInitiator> {
        let creds = self.credentials()?;
        let host = match &creds.server_name {
            Some(name) => name.clone(),
            None => via_host(via)
                .ok_or_else(|| SecurityError::Config(format!("no host in via {via:?}")))?
                .to_string(),
        };
        let server_name = ServerName::try_from(host)
            .map_err(|e| SecurityError::Config(format!("invalid server name: {e}")))?;
        Ok(TlsInitiator {
            config: creds.client_config.clone(),
            server_name,
            validator: self.validator.clone(),
            requested: false,
            security: None,
        })
    }

    /// Acceptor for one inbound connection.
    pub fn create_acceptor(&self) -> Result<TlsAcceptor> {
        let creds = self.credentials()?;
        let config = creds
            .server_config
            .clone()
            .ok_or(SecurityError::MissingServerCertificate)?;
        Ok(TlsAcceptor {
            config,
            policy: creds.policy,
            validator: self.validator.clone(),
            accepted: false,
            security: None,
        })
    }
}

fn client_verifier(
    policy: ClientCertificatePolicy,
    roots: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
) -> Result<Arc<dyn ClientCertVerifier>> {
    match policy {
        ClientCertificatePolicy::None => Ok(WebPkiClientVerifier::no_client_auth()),
        // Absent certificates pass the TLS layer so that `Required` can report them as
        // ClientCertificateMissing rather than as an opaque handshake failure.
        ClientCertificatePolicy::Optional | ClientCertificatePolicy::Required => {
            WebPkiClientVerifier::builder_with_provider(roots, provider)
                .allow_unauthenticated()
                .build()
                .map_err(config_error)
        }
    }
}

/// Host component of a via such as `net.tcp://host:808/service`.
pub fn via_host(via: &str) -> Option<&str> {
    let rest = via.split_once("://").map_or(via, |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next()?;
    let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);
    let host = if let Some(bracketed) = authority.strip_prefix('[') {
        bracketed.split_once(']')?.0
    } else {
        authority.split(':').next()?
    };
    (!host.is_empty()).then_some(host)
}

fn security_of(
    peer_certificates: Option<&[CertificateDer<'static>]>,
    channel_binding: Option<[u8; CHANNEL_BINDING_LEN]>,
) -> RemoteSecurity {
    RemoteSecurity::from_certificates(
        peer_certificates.map(<[_]>::to_vec).unwrap_or_default(),
        channel_binding.map(|b| b.to_vec()),
    )
}

/// rustls reports protocol and certificate failures as `InvalidData`.
fn tls_io_error(err: io::Error, helper: &TimeoutHelper) -> Error {
    if err.kind() == io::ErrorKind::InvalidData {
        SecurityError::Handshake(err.to_string()).into()
    } else {
        helper
            .classify(ConnectionError::from_io(err, helper.original_timeout()))
            .into()
    }
}

fn check_chain(
    validator: &Option<Arc<dyn CertificateValidator>>,
    security: &RemoteSecurity,
) -> Result<()> {
    match validator {
        Some(v) if !security.peer_certificates.is_empty() => v
            .validate(&security.peer_certificates)
            .map_err(|e| SecurityError::CertificateRejected(e).into()),
        _ => Ok(()),
    }
}

fn check_client_certificate(
    policy: ClientCertificatePolicy,
    validator: &Option<Arc<dyn CertificateValidator>>,
    security: &RemoteSecurity,
) -> Result<()> {
    if policy == ClientCertificatePolicy::Required && security.peer_certificates.is_empty() {
        return Err(SecurityError::ClientCertificateMissing.into());
    }
    check_chain(validator, security)
}

/// Drive a rustls handshake to completion over a blocking stream.
fn complete_handshake<D>(
    tls: &mut rustls::ConnectionCommon<D>,
    sock: &mut ConnectionStream,
    helper: &TimeoutHelper,
) -> Result<()> {
    while tls.is_handshaking() {
        sock.set_io_timeout(Some(helper.remaining_or_timeout()?))
            .map_err(|e| tls_io_error(e, helper))?;
        tls.complete_io(sock).map_err(|e| tls_io_error(e, helper))?;
    }
    while tls.wants_write() {
        tls.write_tls(sock).map_err(|e| tls_io_error(e, helper))?;
    }
    sock.flush().map_err(|e| tls_io_error(e, helper))
}

/// Client side of the TLS upgrade; requests `application/ssl-tls` once.
pub struct TlsInitiator {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
    validator: Option<Arc<dyn CertificateValidator>>,
    requested: bool,
    security: Option<RemoteSecurity>,
}

impl StreamSecurity for TlsInitiator {
    fn remote_security(&self) -> Option<&RemoteSecurity> {
        self.security.as_ref()
    }
}

impl TlsInitiator {
    fn next(&mut self) -> Option<String> {
        if self.requested {
            None
        } else {
            self.requested = true;
            Some(TLS_UPGRADE.to_string())
        }
    }

    fn finish(&mut self, security: RemoteSecurity) -> Result<()> {
        check_chain(&self.validator, &security)?;
        tracing::debug!(
            server = ?self.server_name,
            identity = security.identity.as_deref().unwrap_or(""),
            "tls upgrade initiated"
        );
        self.security = Some(security);
        Ok(())
    }

    fn handshake(
        &mut self,
        sock: &mut ConnectionStream,
        helper: &TimeoutHelper,
    ) -> Result<ClientConnection> {
        let mut tls = ClientConnection::new(self.config.clone(), self.server_name.clone())
            .map_err(|e| SecurityError::Handshake(e.to_string()))?;
        complete_handshake(&mut *tls, sock, helper)?;
        let binding = tls
            .export_keying_material([0u8; CHANNEL_BINDING_LEN], CHANNEL_BINDING_LABEL, None)
            .ok();
        self.finish(security_of(tls.peer_certificates(), binding))?;
        Ok(tls)
    }
}

impl UpgradeInitiator for TlsInitiator {
    fn next_upgrade(&mut self) -> Option<String> {
        self.next()
    }

    fn initiate_upgrade(
        &mut self,
        conn: Box<dyn Connection>,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>> {
        let id = conn.connection_id();
        let helper = TimeoutHelper::new(timeout);
        let mut sock = ConnectionStream::new(conn, timeout);
        let tls = match self.handshake(&mut sock, &helper) {
            Ok(tls) => tls,
            Err(e) => {
                sock.abort();
                return Err(e);
            }
        };
        let stream = rustls::StreamOwned::new(tls, sock);
        Ok(Box::new(StreamConnection::with_id(stream, id)))
    }
}

#[async_trait]
impl AsyncUpgradeInitiator for TlsInitiator {
    fn next_upgrade(&mut self) -> Option<String> {
        self.next()
    }

    async fn initiate_upgrade(
        &mut self,
        conn: Box<dyn AsyncConnection>,
        timeout: Duration,
    ) -> Result<Box<dyn AsyncConnection>> {
        let id = conn.connection_id();
        let helper = TimeoutHelper::new(timeout);
        let connector = tokio_rustls::TlsConnector::from(self.config.clone());
        let connect = connector.connect(self.server_name.clone(), AsyncConnectionStream::new(conn));
        let mut stream = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| helper.timeout_error())?
            .map_err(|e| tls_io_error(e, &helper))?;

        let (_, session) = stream.get_ref();
        let binding = session
            .export_keying_material([0u8; CHANNEL_BINDING_LEN], CHANNEL_BINDING_LABEL, None)
            .ok();
        let security = security_of(session.peer_certificates(), binding);
        if let Err(e) = self.finish(security) {
            stream.get_mut().0.abort();
            return Err(e);
        }
        Ok(Box::new(AsyncStreamConnection::with_id(stream, id)))
    }
}

/// Server side of the TLS upgrade; accepts `application/ssl-tls` once.
pub struct TlsAcceptor {
    config: Arc<ServerConfig>,
    policy: ClientCertificatePolicy,
    validator: Option<Arc<dyn CertificateValidator>>,
    accepted: bool,
    security: Option<RemoteSecurity>,
}

impl StreamSecurity for TlsAcceptor {
    fn remote_security(&self) -> Option<&RemoteSecurity> {
        self.security.as_ref()
    }
}

impl TlsAcceptor {
    fn can(&self, upgrade: &str) -> bool {
        !self.accepted && upgrade == TLS_UPGRADE
    }

    fn finish(&mut self, security: RemoteSecurity) -> Result<()> {
        check_client_certificate(self.policy, &self.validator, &security)?;
        tracing::debug!(
            identity = security.identity.as_deref().unwrap_or(""),
            "tls upgrade accepted"
        );
        self.security = Some(security);
        Ok(())
    }

    fn handshake(
        &mut self,
        sock: &mut ConnectionStream,
        helper: &TimeoutHelper,
    ) -> Result<ServerConnection> {
        let mut tls = ServerConnection::new(self.config.clone())
            .map_err(|e| SecurityError::Handshake(e.to_string()))?;
        complete_handshake(&mut *tls, sock, helper)?;
        let binding = tls
            .export_keying_material([0u8; CHANNEL_BINDING_LEN], CHANNEL_BINDING_LABEL, None)
            .ok();
        self.finish(security_of(tls.peer_certificates(), binding))?;
        Ok(tls)
    }
}

impl UpgradeAcceptor for TlsAcceptor {
    fn can_upgrade(&self, upgrade: &str) -> bool {
        self.can(upgrade)
    }

    fn accept_upgrade(
        &mut self,
        conn: Box<dyn Connection>,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>> {
        self.accepted = true;
        let id = conn.connection_id();
        let helper = TimeoutHelper::new(timeout);
        let mut sock = ConnectionStream::new(conn, timeout);
        let tls = match self.handshake(&mut sock, &helper) {
            Ok(tls) => tls,
            Err(e) => {
                sock.abort();
                return Err(e);
            }
        };
        let stream = rustls::StreamOwned::new(tls, sock);
        Ok(Box::new(StreamConnection::with_id(stream, id)))
    }
}

#[async_trait]
impl AsyncUpgradeAcceptor for TlsAcceptor {
    fn can_upgrade(&self, upgrade: &str) -> bool {
        self.can(upgrade)
    }

    async fn accept_upgrade(
        &mut self,
        conn: Box<dyn AsyncConnection>,
        timeout: Duration,
    ) -> Result<Box<dyn AsyncConnection>> {
        self.accepted = true;
        let id = conn.connection_id();
        let helper = TimeoutHelper::new(timeout);
        let acceptor = tokio_rustls::TlsAcceptor::from(self.config.clone());
        let mut stream = tokio::time::timeout(timeout, acceptor.accept(AsyncConnectionStream::new(conn)))
            .await
            .map_err(|_| helper.timeout_error())?
            .map_err(|e| tls_io_error(e, &helper))?;

        let (_, session) = stream.get_ref();
        let binding = session
            .export_keying_material([0u8; CHANNEL_BINDING_LEN], CHANNEL_BINDING_LABEL, None)
            .ok();
        let security = security_of(session.peer_certificates(), binding);
        if let Err(e) = self.finish(security) {
            stream.get_mut().0.abort();
            return Err(e);
        }
        Ok(Box::new(AsyncStreamConnection::with_id(stream, id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn via_host_forms() {
        assert_eq!(via_host("net.tcp://example.org:808/svc"), Some("example.org"));
        assert_eq!(via_host("net.tcp://localhost/svc?x"), Some("localhost"));
        assert_eq!(via_host("net.tcp://[::1]:808/svc"), Some("::1"));
        assert_eq!(via_host("net.tcp://user@host/svc"), Some("host"));
        assert_eq!(via_host("host"), Some("host"));
        assert_eq!(via_host("net.tcp:///svc"), None);
    }

    #[test]
    fn acceptor_requires_server_certificate() {
        let provider = TlsUpgradeProvider::open(&TlsSettings::default()).unwrap();
        assert!(matches!(
            provider.create_acceptor(),
            Err(Error::Security(SecurityError::MissingServerCertificate))
        ));
    }

    #[test]
    fn closed_provider_refuses_factories() {
        let mut provider = TlsUpgradeProvider::open(&TlsSettings::default()).unwrap();
        provider.close();
        assert!(!provider.is_open());
        assert!(matches!(
            provider.create_initiator("net.tcp://localhost/"),
            Err(Error::Security(SecurityError::NotOpen))
        ));
    }

    #[test]
    fn half_configured_pair_is_rejected() {
        let settings = TlsSettings {
            client_certificate: Some(PemSource::Pem(String::new())),
            ..TlsSettings::default()
        };
        assert!(matches!(
            TlsUpgradeProvider::open(&settings),
            Err(Error::Security(SecurityError::Credentials(_)))
        ));
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: TlsSettings = serde_json::from_str(
            r#"{"trust_roots": {"path": "/etc/ca.pem"}, "client_certificate_policy": "required"}"#,
        )
        .unwrap();
        assert_eq!(settings.client_certificate_policy, ClientCertificatePolicy::Required);
        assert_eq!(
            settings.trust_roots,
            Some(PemSource::Path(PathBuf::from("/etc/ca.pem")))
        );
        assert!(settings.server_certificate.is_none());
    }

    #[test]
    fn initiator_requests_tls_once() {
        let provider = TlsUpgradeProvider::open(&TlsSettings::default()).unwrap();
        let mut initiator = provider.create_initiator("net.tcp://localhost/svc").unwrap();
        assert_eq!(UpgradeInitiator::next_upgrade(&mut initiator).as_deref(), Some(TLS_UPGRADE));
        assert_eq!(UpgradeInitiator::next_upgrade(&mut initiator), None);
    }
}
