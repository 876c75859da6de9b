use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tokio::{net::TcpListener, task::JoinSet};
use tracing::{debug, info, span, warn, Instrument, Level};

use crate::{
    method_handlers::{Connect, TunnelConnect},
    protocol::SocksSocketAddr,
    service::{bind, Listeners, SessionGuard},
};

use super::TunnelServerSession;

/// Accepts tunnel connections and serves each with a [`TunnelServerSession`] whose
/// demultiplexed connections all go to `target`, usually a SOCKS5 proxy.
pub struct TunnelServerService<C = TunnelConnect> {
    connector: C,
    target: SocksSocketAddr,
    listeners: Listeners,
    active: Arc<AtomicUsize>,
}

impl TunnelServerService<TunnelConnect> {
    pub fn new(target: SocksSocketAddr) -> Self {
        Self::with_connector(TunnelConnect, target)
    }
}

impl<C: Connect> TunnelServerService<C> {
    pub fn with_connector(connector: C, target: SocksSocketAddr) -> Self {
        TunnelServerService {
            connector,
            target,
            listeners: Listeners::default(),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Starts accepting on `host:port` and returns the bound port.
    pub async fn publish(&self, host: Option<&str>, port: u16) -> crate::Result<u16> {
        let listener = bind(host, port).await?;
        let local = listener.local_addr()?;
        info!("Tunnel server on {} for {}", local, self.target);

        let handle = tokio::spawn(serve(
            listener,
            self.connector.clone(),
            self.target.clone(),
            Arc::clone(&self.active),
        ));
        self.listeners.push(handle);
        Ok(local.port())
    }

    /// Tunnel connections currently being served.
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.listeners.abort_all();
    }
}

impl<C> Drop for TunnelServerService<C> {
    fn drop(&mut self) {
        self.listeners.abort_all();
    }
}

async fn serve<C: Connect>(
    listener: TcpListener,
    connector: C,
    target: SocksSocketAddr,
    active: Arc<AtomicUsize>,
) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (client, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("Failed to accept: {}", err);
                        continue;
                    }
                };
                debug!("Received tunnel from: {:?}", peer);
                let tunnel = span!(Level::INFO, "tunnel", %peer);
                let guard = SessionGuard::new(&active);
                let mut session = TunnelServerSession::new(connector.clone(), target.clone());

                sessions.spawn(
                    async move {
                        let _guard = guard;
                        if let Err(err) = session.run(client).await {
                            warn!("Failed tunnel: {}", err);
                        }
                    }
                    .instrument(tunnel),
                );
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }
}
