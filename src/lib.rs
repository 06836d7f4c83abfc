//! # netframing
//!
//! Connection-oriented binary message framing for stream transports, wire compatible
//! with the .NET Message Framing protocol.
//!
//! ## Features
//!
//! - Incremental decoders for the client and server halves of every framing mode
//!   (singleton, duplex, simplex, sized singleton)
//! - Preamble negotiation: version, mode, via, content type and in-band stream upgrades
//! - Fault records mapped to typed errors, with faults sent back before closing
//! - Blocking and tokio connection abstractions, including pre-read wrappers that keep
//!   look-ahead bytes across a stream swap
//! - TLS stream upgrade over rustls, with optional client certificates
//!
//! ## Example
//!
//! ```ignore
//! use netframing::connection::AsyncStreamConnection;
//! use netframing::framing::FramingMode;
//! use netframing::handshake::{nonblocking, ClientOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let stream = tokio::net::TcpStream::connect("127.0.0.1:8808").await?;
//!     let options = ClientOptions::new(
//!         FramingMode::Duplex,
//!         "net.tcp://127.0.0.1:8808/echo",
//!         "application/soap+msbinsession1",
//!     );
//!     let conn = Box::new(AsyncStreamConnection::new(stream));
//!     let mut session = nonblocking::connect(conn, &options, None).await?;
//!     session.send_envelope(b"hello", std::time::Duration::from_secs(5)).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod upgrade;

pub use config::FramingSettings;
pub use error::{Error, Result};
