use std::future::Future;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod tunnel_connect;
use crate::protocol::SocksSocketAddr;

/// Failure to reach a target: either name resolution or the TCP connect itself.
#[derive(Error, Debug, Clone)]
#[error("could not connect to {target}: {reason}")]
pub struct ConnectError {
    pub target: String,
    pub reason: String,
}

impl ConnectError {
    pub fn new(target: impl ToString, reason: impl ToString) -> Self {
        ConnectError {
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// The `Connect` trait establishes outbound connections for the SOCKS5 CONNECT command and
/// for gate upstreams.
///
/// Sessions run `establish_connection` on a separate task and keep serving their client
/// while it resolves. If the session is gone by the time the connection is ready, the
/// connection is simply dropped, which closes it.
pub trait Connect: Clone + Send + Sync + 'static {
    /// The type representing a server connection.
    type ServerConnection: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Resolves `destination` and connects to it.
    ///
    /// - `destination`: The target address to which the connection should be established.
    /// - Returns: A future that resolves to the connection or a [`ConnectError`] carrying
    ///   a human readable reason.
    fn establish_connection(
        &self,
        destination: SocksSocketAddr,
    ) -> impl Future<Output = Result<Self::ServerConnection, ConnectError>> + Send;
}
