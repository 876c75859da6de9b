//! # Ranger
//!
//! This crate provides a SOCKS5 proxy server with relay chaining, per-connection stream
//! encryption and compression.
//!
//! ## Overview of the SOCKS5 Protocol
//!
//! SOCKS5 (RFC 1928) routes TCP connections through a proxy. Only the parts needed for a
//! CONNECT proxy are served here:
//!
//! 1. **Method selection**: The client lists the authentication methods it supports and the
//!    server picks one, or answers `0xFF` when none is acceptable.
//! 2. **Authentication**: With username/password (RFC 1929) the client sends its
//!    credentials and the server answers `[0x01, 0x00]` or `[0x01, 0xFF]`.
//! 3. **Request**: The client names the target by IPv4 address or domain name. The server
//!    connects and echoes the target in its reply.
//! 4. **Data Transfer**: From then on the connection is a plain byte pump.
//!
//! ## Encryption and Compression
//!
//! A listener configured with a key writes a random 4 byte seed to each client right after
//! accept. Both ends derive the AES-CFB IV from that seed, and every byte after it is
//! encrypted. Compression frames each block with its compressed and original length and
//! runs before encryption.
//!
//! ## Gate Mode
//!
//! A gate does not speak SOCKS5 to its clients. It forwards every accepted connection to one
//! of its configured upstreams, typically another ranger listener with a key, so that only
//! the hop between the two is encrypted.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use ranger::{config::SessionConfig, Socks5Service};
//!
//! #[tokio::main]
//! async fn main() -> ranger::Result<()> {
//!     let service = Socks5Service::new();
//!     service.add_user("admin", "password");
//!
//!     let config = SessionConfig::default().with_key("secret").with_compression(true);
//!     let port = service.publish(Some("0.0.0.0"), 1080, config).await?;
//!     println!("listening on {}", port);
//!
//!     tokio::signal::ctrl_c().await?;
//!     service.shutdown();
//!     Ok(())
//! }
//! ```

use std::{io, net::SocketAddr};

use protocol::Reply;

pub mod auth;
pub mod config;
pub mod gate;
pub mod method_handlers;
mod outbox;
pub mod protocol;
pub mod service;
pub mod socks5_session;
pub mod stage;
pub mod tunnel;
pub mod unpacker;

pub use gate::GateService;
pub use service::Socks5Service;
pub use socks5_session::Socks5Session;

use method_handlers::ConnectError;
use stage::StageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Socks5Error>;

#[derive(Error, Debug)]
pub enum Socks5Error {
    #[error("Socks error: {0}")]
    Socks5Error(#[from] Reply),
    #[error("Error in network operation: {0}")]
    IoError(#[from] io::Error),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("Stage error: {0}")]
    Stage(#[from] StageError),
    #[error("Protocol error: {0}")]
    Protocol(&'static str),
    #[error("Could not listen on {addr}: {source}")]
    Bind { addr: String, source: io::Error },
}

pub(crate) fn listen_addr(host: Option<&str>, port: u16) -> String {
    match host {
        Some(host) if !host.is_empty() => format!("{}:{}", host, port),
        _ => SocketAddr::from(([0, 0, 0, 0], port)).to_string(),
    }
}
