//! Stream upgrades negotiated inside the preamble.
//!
//! The client side asks its [`UpgradeInitiator`] which upgrade to request next, and once the
//! server answers with an upgrade response it hands the raw connection over and gets the
//! upgraded one back. The server side asks its [`UpgradeAcceptor`] whether it can honor a
//! requested upgrade and, if so, hands the connection over the same way. From then on every
//! byte flows through the returned connection.

mod tls;

use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};

pub use tls::{
    via_host, CertificateValidator, ClientCertificatePolicy, PemSource, TlsAcceptor,
    TlsInitiator, TlsSettings, TlsUpgradeProvider,
};

use crate::connection::{AsyncConnection, Connection};
use crate::Result;

/// What an upgrade established about the remote party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSecurity {
    /// Certificate chain presented by the peer, leaf first. Empty when none was presented.
    pub peer_certificates: Vec<CertificateDer<'static>>,
    /// SHA-256 thumbprint of the leaf certificate, lowercase hex.
    pub identity: Option<String>,
    /// Opaque token binding application authentication to this channel.
    pub channel_binding: Option<Vec<u8>>,
}

impl RemoteSecurity {
    pub fn from_certificates(
        peer_certificates: Vec<CertificateDer<'static>>,
        channel_binding: Option<Vec<u8>>,
    ) -> Self {
        let identity = peer_certificates.first().map(thumbprint);
        Self {
            peer_certificates,
            identity,
            channel_binding,
        }
    }
}

/// SHA-256 thumbprint of a DER certificate, lowercase hex.
pub fn thumbprint(cert: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(cert.as_ref()))
}

/// Access to the security established by an upgrade.
pub trait StreamSecurity {
    /// `None` until an upgrade completes, or when the upgrade authenticates nothing.
    fn remote_security(&self) -> Option<&RemoteSecurity>;
}

/// Client side of a blocking stream upgrade.
pub trait UpgradeInitiator: StreamSecurity + Send {
    /// Upgrade content type to request next, or `None` when no more upgrades are wanted.
    fn next_upgrade(&mut self) -> Option<String>;

    /// Upgrade `conn` after the server accepted the request. The returned connection
    /// replaces `conn` for the rest of the session. On error `conn` is gone, so
    /// implementations abort it before returning.
    fn initiate_upgrade(
        &mut self,
        conn: Box<dyn Connection>,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>>;
}

/// Server side of a blocking stream upgrade.
pub trait UpgradeAcceptor: StreamSecurity + Send {
    fn can_upgrade(&self, upgrade: &str) -> bool;

    /// Same contract as [`UpgradeInitiator::initiate_upgrade`].
    fn accept_upgrade(
        &mut self,
        conn: Box<dyn Connection>,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>>;
}

/// Client side of an async stream upgrade.
#[async_trait]
pub trait AsyncUpgradeInitiator: StreamSecurity + Send {
    fn next_upgrade(&mut self) -> Option<String>;

    async fn initiate_upgrade(
        &mut self,
        conn: Box<dyn AsyncConnection>,
        timeout: Duration,
    ) -> Result<Box<dyn AsyncConnection>>;
}

/// Server side of an async stream upgrade.
#[async_trait]
pub trait AsyncUpgradeAcceptor: StreamSecurity + Send {
    fn can_upgrade(&self, upgrade: &str) -> bool;

    async fn accept_upgrade(
        &mut self,
        conn: Box<dyn AsyncConnection>,
        timeout: Duration,
    ) -> Result<Box<dyn AsyncConnection>>;
}
