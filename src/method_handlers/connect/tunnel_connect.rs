use std::net::SocketAddr;

use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

use crate::protocol::{Addr, SocksSocketAddr};

use super::{Connect, ConnectError};

/// Plain TCP connector: resolves domain names with the system resolver and tries every
/// resolved address in order.
#[derive(Debug, Clone, Copy, Default)]
pub struct TunnelConnect;

impl Connect for TunnelConnect {
    type ServerConnection = TcpStream;

    async fn establish_connection(
        &self,
        destination: SocksSocketAddr,
    ) -> Result<TcpStream, ConnectError> {
        let candidates: Vec<SocketAddr> = match &destination.addr {
            Addr::Ipv4(addr) => vec![SocketAddr::from((*addr, destination.port))],
            Addr::Domain(domain) => lookup_host((domain.as_str(), destination.port))
                .await
                .map_err(|err| {
                    ConnectError::new(&destination, format!("could not resolve host: {}", err))
                })?
                .collect(),
        };

        let mut last_error = None;
        for candidate in candidates {
            match TcpStream::connect(candidate).await {
                Ok(stream) => {
                    debug!("Connected to {} via {}", destination, candidate);
                    return Ok(stream);
                }
                Err(err) => last_error = Some(err),
            }
        }

        Err(match last_error {
            Some(err) => ConnectError::new(&destination, err),
            None => ConnectError::new(&destination, "host resolved to no addresses"),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn connects_to_ipv4_and_domain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let ipv4 = SocksSocketAddr::new(Addr::Ipv4(Ipv4Addr::LOCALHOST), port);
        assert!(TunnelConnect.establish_connection(ipv4).await.is_ok());

        let domain = SocksSocketAddr::new(Addr::Domain("127.0.0.1".to_owned()), port);
        assert!(TunnelConnect.establish_connection(domain).await.is_ok());
    }

    #[tokio::test]
    async fn refused_connect_reports_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = SocksSocketAddr::new(Addr::Ipv4(Ipv4Addr::LOCALHOST), port);
        let err = TunnelConnect.establish_connection(target).await.unwrap_err();
        assert_eq!(err.target, format!("127.0.0.1:{}", port));
    }
}
