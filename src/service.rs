use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, PoisonError,
};

use tokio::{
    net::TcpListener,
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, info, span, warn, Instrument, Level};

use crate::{
    auth::UserTable,
    config::SessionConfig,
    listen_addr,
    method_handlers::{Connect, TunnelConnect},
    Socks5Error, Socks5Session,
};

/// Counts a live session until dropped, including when its task is aborted.
pub(crate) struct SessionGuard(Arc<AtomicUsize>);

impl SessionGuard {
    pub(crate) fn new(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        SessionGuard(Arc::clone(active))
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Listener handles of a service. Aborting a listener drops its sessions with it.
#[derive(Default)]
pub(crate) struct Listeners(Mutex<Vec<JoinHandle<()>>>);

impl Listeners {
    pub(crate) fn push(&self, handle: JoinHandle<()>) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    pub(crate) fn abort_all(&self) {
        let mut handles = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        for handle in handles.drain(..) {
            handle.abort();
        }
    }
}

pub(crate) async fn bind(host: Option<&str>, port: u16) -> crate::Result<TcpListener> {
    let addr = listen_addr(host, port);
    TcpListener::bind(&addr)
        .await
        .map_err(|source| Socks5Error::Bind { addr, source })
}

/// A SOCKS5 proxy: any number of listeners sharing one user table.
pub struct Socks5Service<C = TunnelConnect> {
    users: UserTable,
    connector: C,
    listeners: Listeners,
    active: Arc<AtomicUsize>,
}

impl Socks5Service<TunnelConnect> {
    pub fn new() -> Self {
        Self::with_connector(TunnelConnect)
    }
}

impl Default for Socks5Service<TunnelConnect> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connect> Socks5Service<C> {
    pub fn with_connector(connector: C) -> Self {
        Socks5Service {
            users: UserTable::new(),
            connector,
            listeners: Listeners::default(),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Listeners ask for username/password as soon as the table holds one user.
    pub fn add_user(&self, username: impl Into<String>, password: impl Into<String>) -> bool {
        self.users.add_user(username, password)
    }

    pub fn users(&self) -> &UserTable {
        &self.users
    }

    /// Starts accepting on `host:port` (all interfaces when `host` is `None`) and returns the
    /// bound port, which differs from `port` when `port` is 0.
    pub async fn publish(
        &self,
        host: Option<&str>,
        port: u16,
        config: SessionConfig,
    ) -> crate::Result<u16> {
        let listener = bind(host, port).await?;
        let local = listener.local_addr()?;
        info!(
            "SOCKS5 listener on {} (encrypted: {}, compressed: {})",
            local,
            config.key.is_some(),
            config.compress
        );

        let handle = tokio::spawn(serve(
            listener,
            self.connector.clone(),
            self.users.clone(),
            config,
            Arc::clone(&self.active),
        ));
        self.listeners.push(handle);
        Ok(local.port())
    }

    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stops every listener together with its sessions.
    pub fn shutdown(&self) {
        self.listeners.abort_all();
    }
}

impl<C> Drop for Socks5Service<C> {
    fn drop(&mut self) {
        self.listeners.abort_all();
    }
}

async fn serve<C: Connect>(
    listener: TcpListener,
    connector: C,
    users: UserTable,
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
                let connection = span!(Level::INFO, "connection", %peer);
                let guard = SessionGuard::new(&active);
                let mut session = Socks5Session::new(connector.clone(), users.clone(), config.clone());

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
