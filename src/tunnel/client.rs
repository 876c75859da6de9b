use std::{convert::Infallible, future};

use tokio::{
    io::{self, AsyncRead, AsyncReadExt, AsyncWrite},
    net::TcpListener,
};
use tracing::{debug, info, warn, Instrument};

use crate::{
    method_handlers::{Connect, TunnelConnect},
    outbox::Outbox,
    protocol::SocksSocketAddr,
    service::{bind, Listeners},
    socks5_session::BUFFER_SIZE,
};

use super::{encode, encode_close, event_channel, FrameDecoder, Link, LinkEvent, Links, TunnelFrame};

/// Accepts local connections and carries all of them over one connection to a
/// [`TunnelServerSession`](super::TunnelServerSession).
pub struct TunnelClientService<C = TunnelConnect> {
    connector: C,
    remote: SocksSocketAddr,
    listeners: Listeners,
}

impl TunnelClientService<TunnelConnect> {
    pub fn new(remote: SocksSocketAddr) -> Self {
        Self::with_connector(TunnelConnect, remote)
    }
}

impl<C: Connect> TunnelClientService<C> {
    pub fn with_connector(connector: C, remote: SocksSocketAddr) -> Self {
        TunnelClientService {
            connector,
            remote,
            listeners: Listeners::default(),
        }
    }

    /// Connects to the tunnel server, then starts accepting on `host:port`. Returns the bound
    /// port. The listener stops when the tunnel connection closes.
    pub async fn publish(&self, host: Option<&str>, port: u16) -> crate::Result<u16> {
        let remote = self
            .connector
            .establish_connection(self.remote.clone())
            .await?;
        let listener = bind(host, port).await?;
        let local = listener.local_addr()?;
        info!("Tunnel listener on {} via {}", local, self.remote);

        let handle = tokio::spawn(
            async move {
                if let Err(err) = multiplex(listener, remote).await {
                    warn!("Tunnel failed: {}", err);
                }
            }
            .in_current_span(),
        );
        self.listeners.push(handle);
        Ok(local.port())
    }

    pub fn shutdown(&self) {
        self.listeners.abort_all();
    }
}

impl<C> Drop for TunnelClientService<C> {
    fn drop(&mut self) {
        self.listeners.abort_all();
    }
}

async fn multiplex<S>(listener: TcpListener, remote: S) -> crate::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut remote_rx, mut remote_tx) = io::split(remote);
    let (events_tx, mut events) = event_channel();
    let mut links = Links::default();
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut tunnel_out = Outbox::default();
    let mut next_id: i64 = 0;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("Failed to accept: {}", err);
                        continue;
                    }
                };
                next_id += 1;
                debug!(id = next_id, "Received connection from: {:?}", peer);
                let open = future::ready(Ok::<_, Infallible>(stream.into_split()));
                links.insert(next_id, Link::spawn(next_id, open, events_tx.clone()));
            }
            read = remote_rx.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    info!("Tunnel connection closed");
                    return Ok(());
                }
                for frame in decoder.feed(buf[..n].to_vec()) {
                    match frame {
                        TunnelFrame::Data { id, payload } => match links.get(id) {
                            Some(link) => {
                                link.send(payload);
                            }
                            None => warn!(id, "Data for unknown connection"),
                        },
                        TunnelFrame::Close { id } => {
                            links.remove(id);
                        }
                    }
                }
            }
            Some(event) = events.recv(), if !tunnel_out.is_full() => match event {
                LinkEvent::Data(id, bytes) => {
                    if links.contains(id) {
                        tunnel_out.push(encode(id, &bytes));
                    }
                }
                LinkEvent::Closed(id) => {
                    if links.remove(id) {
                        tunnel_out.push(encode_close(id));
                    }
                }
            },
            written = tunnel_out.write_to(Some(&mut remote_tx)) => written?,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::{io::AsyncWriteExt, net::TcpStream};

    use super::*;
    use crate::protocol::Addr;

    #[tokio::test]
    async fn tags_each_connection_with_an_id() {
        let tunnel = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = tunnel.local_addr().unwrap().port();
        let service = TunnelClientService::new(SocksSocketAddr::new(Addr::Ipv4(Ipv4Addr::LOCALHOST), port));

        let (published, accepted) = tokio::join!(service.publish(Some("127.0.0.1"), 0), tunnel.accept());
        let local_port = published.unwrap();
        let (mut server, _) = accepted.unwrap();

        let mut first = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
        first.write_all(&[5, 1, 0]).await.unwrap();

        let mut header = [0u8; 13];
        server.read_exact(&mut header).await.unwrap();
        assert_eq!(header[..8], 1i64.to_le_bytes());
        assert_eq!(header[8..10], [3, 0]);
        assert_eq!(header[10..], [5, 1, 0]);

        server.write_all(&encode(1, &[5, 0])).await.unwrap();
        let mut reply = [0u8; 2];
        first.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0]);

        server.write_all(&encode_close(1)).await.unwrap();
        let mut rest = [0u8; 1];
        assert_eq!(first.read(&mut rest).await.unwrap(), 0);
    }
}
