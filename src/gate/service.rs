use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, PoisonError, RwLock,
};

use tokio::{net::TcpListener, task::JoinSet};
use tracing::{debug, error, info, span, warn, Instrument, Level};

use crate::{
    config::{SessionConfig, Upstream},
    method_handlers::{Connect, TunnelConnect},
    service::{bind, Listeners, SessionGuard},
};

use super::{GateSession, HostSelector, RoundRobin};

#[derive(Clone)]
struct Hosts {
    list: Arc<RwLock<Vec<Upstream>>>,
    selector: Arc<dyn HostSelector>,
}

impl Hosts {
    fn pick(&self) -> Option<Upstream> {
        let list = self.list.read().unwrap_or_else(PoisonError::into_inner);
        if list.is_empty() {
            return None;
        }
        let index = self.selector.select(list.len());
        list.get(index).cloned()
    }
}

/// Relays accepted connections to upstream proxies.
pub struct GateService<C = TunnelConnect> {
    hosts: Hosts,
    connector: C,
    listeners: Listeners,
    active: Arc<AtomicUsize>,
}

impl GateService<TunnelConnect> {
    pub fn new() -> Self {
        Self::with_selector(TunnelConnect, RoundRobin::new())
    }
}

impl Default for GateService<TunnelConnect> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connect> GateService<C> {
    pub fn with_selector(connector: C, selector: impl HostSelector + 'static) -> Self {
        GateService {
            hosts: Hosts {
                list: Arc::new(RwLock::new(Vec::new())),
                selector: Arc::new(selector),
            },
            connector,
            listeners: Listeners::default(),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Adds a relay target. Entries without a host or with port 0 are ignored.
    pub fn add_host(&self, upstream: Upstream) -> bool {
        if !upstream.is_valid() {
            warn!("Ignoring invalid upstream {:?}:{}", upstream.host, upstream.port);
            return false;
        }
        debug!("Added upstream {}", upstream.target());
        self.hosts
            .list
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(upstream);
        true
    }

    pub fn hosts(&self) -> usize {
        self.hosts
            .list
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Starts accepting on `host:port` and returns the bound port. `config` only supplies the
    /// timeouts; each upstream carries its own key and compression.
    pub async fn publish(
        &self,
        host: Option<&str>,
        port: u16,
        config: SessionConfig,
    ) -> crate::Result<u16> {
        let listener = bind(host, port).await?;
        let local = listener.local_addr()?;
        info!("Gate listener on {} ({} upstreams)", local, self.hosts());

        let handle = tokio::spawn(serve(
            listener,
            self.connector.clone(),
            self.hosts.clone(),
            config,
            Arc::clone(&self.active),
        ));
        self.listeners.push(handle);
        Ok(local.port())
    }

    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.listeners.abort_all();
    }
}

impl<C> Drop for GateService<C> {
    fn drop(&mut self) {
        self.listeners.abort_all();
    }
}

async fn serve<C: Connect>(
    listener: TcpListener,
    connector: C,
    hosts: Hosts,
    config: SessionConfig,
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
                debug!("Received connection from: {:?}", peer);
                let Some(upstream) = hosts.pick() else {
                    error!("No upstream configured, closing connection from {}", peer);
                    continue;
                };

                let connection = span!(Level::INFO, "connection", %peer);
                let guard = SessionGuard::new(&active);
                let mut session = GateSession::new(connector.clone(), upstream, config.clone());

                sessions.spawn(
                    async move {
                        let _guard = guard;
                        if let Err(err) = session.run(client).await {
                            warn!("Failed connection: {}", err);
                        }
                    }
                    .instrument(connection),
                );
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_host_rejects_incomplete_entries() {
        let gate = GateService::new();
        assert!(!gate.add_host(Upstream::new("", 1080)));
        assert!(!gate.add_host(Upstream::new("127.0.0.1", 0)));
        assert!(gate.add_host(Upstream::new("127.0.0.1", 1080)));
        assert_eq!(gate.hosts(), 1);
    }

    #[test]
    fn pick_follows_selector() {
        let gate = GateService::new();
        gate.add_host(Upstream::new("10.0.0.1", 1));
        gate.add_host(Upstream::new("10.0.0.2", 2));
        let ports: Vec<u16> = (0..4)
            .filter_map(|_| gate.hosts.pick())
            .map(|upstream| upstream.port)
            .collect();
        assert_eq!(ports, vec![1, 2, 1, 2]);
    }
}
