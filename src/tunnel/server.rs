use tokio::{
    io::{self, AsyncRead, AsyncReadExt, AsyncWrite},
    sync::mpsc,
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    method_handlers::{Connect, TunnelConnect},
    outbox::Outbox,
    protocol::SocksSocketAddr,
    socks5_session::BUFFER_SIZE,
    Socks5Error,
};

use super::{encode, encode_close, event_channel, FrameDecoder, Link, LinkEvent, Links, TunnelFrame};

/// The first frame of a connection carries the client's SOCKS5 greeting, so it is never
/// shorter than 3 or longer than 257 bytes.
const FIRST_FRAME: std::ops::RangeInclusive<usize> = 3..=257;

/// Serves one multiplexed connection, opening a connection to `target` for every new id.
///
/// Frames for an id whose connection is still being opened are queued on that id's link and
/// written once it is up. A failed connect is answered with a close frame for the id.
pub struct TunnelServerSession<C: Connect = TunnelConnect> {
    connector: C,
    target: SocksSocketAddr,
    links: Links,
}

impl<C: Connect> TunnelServerSession<C> {
    pub fn new(connector: C, target: SocksSocketAddr) -> Self {
        TunnelServerSession {
            connector,
            target,
            links: Links::default(),
        }
    }

    /// Connections currently open through the tunnel.
    pub fn links(&self) -> usize {
        self.links.len()
    }

    #[instrument(skip_all, fields(target = %self.target))]
    pub async fn run<T>(&mut self, local: T) -> crate::Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut local_rx, mut local_tx) = io::split(local);
        let result = self.serve(&mut local_rx, &mut local_tx).await;
        self.close();
        info!("Tunnel session closed");
        result
    }

    /// Drops every demultiplexed connection. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.links.abort_all();
    }

    async fn serve<R, W>(&mut self, local_rx: &mut R, local_tx: &mut W) -> crate::Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let (events_tx, mut events) = event_channel();
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut tunnel_out = Outbox::default();

        loop {
            tokio::select! {
                read = local_rx.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        return Ok(());
                    }
                    for frame in decoder.feed(buf[..n].to_vec()) {
                        self.on_frame(frame, &events_tx)?;
                    }
                }
                Some(event) = events.recv(), if !tunnel_out.is_full() => match event {
                    LinkEvent::Data(id, bytes) => {
                        if self.links.contains(id) {
                            tunnel_out.push(encode(id, &bytes));
                        }
                    }
                    LinkEvent::Closed(id) => {
                        if self.links.remove(id) {
                            debug!(id, "Upstream closed");
                            tunnel_out.push(encode_close(id));
                        }
                    }
                },
                written = tunnel_out.write_to(Some(&mut *local_tx)) => written?,
            }
        }
    }

    fn on_frame(&mut self, frame: TunnelFrame, events: &mpsc::Sender<LinkEvent>) -> crate::Result<()> {
        let (id, payload) = match frame {
            TunnelFrame::Close { id } => {
                if self.links.remove(id) {
                    debug!(id, "Client closed");
                }
                return Ok(());
            }
            TunnelFrame::Data { id, payload } => (id, payload),
        };

        if let Some(link) = self.links.get(id) {
            if !link.send(payload) {
                warn!(id, "Dropping payload, upstream connection is gone");
            }
            return Ok(());
        }

        if !FIRST_FRAME.contains(&payload.len()) {
            error!(id, len = payload.len(), "Tunnel protocol error");
            return Err(Socks5Error::Protocol("first tunnel frame has an invalid length"));
        }

        debug!(id, "New tunnelled connection");
        let connector = self.connector.clone();
        let target = self.target.clone();
        let open = async move { connector.establish_connection(target).await.map(io::split) };
        let link = Link::spawn(id, open, events.clone());
        link.send(payload);
        self.links.insert(id, link);
        Ok(())
    }
}
