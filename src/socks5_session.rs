//! One SOCKS5 client connection from accept to close.
//!
//! The protocol itself lives in [`Handshake`]; the session owns the sockets, the optional
//! transform stage and the timers, and carries out whatever the handshake asks for.

use std::{collections::VecDeque, future, io as std_io};

use tokio::{
    io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::oneshot,
    time::{self, Instant},
};
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::{
    auth::UserAuthenticator,
    config::SessionConfig,
    method_handlers::{Connect, ConnectError},
    outbox::Outbox,
    protocol::SocksSocketAddr,
    stage::{StageError, StageHandle, Transformed},
};

mod handshake;

pub use handshake::{Action, Handshake, State};

pub(crate) const BUFFER_SIZE: usize = 8192;

/// Stage requests one direction may have outstanding before its source stops being read.
pub(crate) const MAX_IN_FLIGHT: usize = 16;

/// Bytes moved over both legs of a session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Traffic {
    pub client_in: u64,
    pub client_out: u64,
    pub remote_in: u64,
    pub remote_out: u64,
}

pub(crate) type PendingConnect<S> = oneshot::Receiver<Result<S, ConnectError>>;

pub struct Socks5Session<C: Connect, A> {
    connector: C,
    authenticator: A,
    config: SessionConfig,
    handshake: Handshake,
    stage: Option<StageHandle>,
    remote: Option<WriteHalf<C::ServerConnection>>,
    connecting: Option<PendingConnect<C::ServerConnection>>,
    local_out: Outbox,
    remote_out: Outbox,
    client_in: u64,
    remote_in: u64,
    local_closed: bool,
    remote_closed: bool,
    closed: bool,
}

impl<C, A> Socks5Session<C, A>
where
    C: Connect,
    A: UserAuthenticator + Send + Sync + 'static,
{
    pub fn new(connector: C, authenticator: A, config: SessionConfig) -> Self {
        let handshake = Handshake::new(authenticator.requires_auth());
        Socks5Session {
            connector,
            authenticator,
            config,
            handshake,
            stage: None,
            remote: None,
            connecting: None,
            local_out: Outbox::default(),
            remote_out: Outbox::default(),
            client_in: 0,
            remote_in: 0,
            local_closed: false,
            remote_closed: false,
            closed: false,
        }
    }

    pub fn state(&self) -> &State {
        self.handshake.state()
    }

    pub fn traffic(&self) -> Traffic {
        Traffic {
            client_in: self.client_in,
            client_out: self.local_out.written(),
            remote_in: self.remote_in,
            remote_out: self.remote_out.written(),
        }
    }

    /// Serves `local` until either side is done, then closes the session.
    #[instrument(skip_all)]
    pub async fn run<T>(&mut self, local: T) -> crate::Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut local_rx, mut local_tx) = io::split(local);
        let result = self.relay(&mut local_rx, &mut local_tx).await;
        self.close();
        let _ = local_tx.shutdown().await;

        let traffic = self.traffic();
        info!(
            client_in = traffic.client_in,
            client_out = traffic.client_out,
            remote_in = traffic.remote_in,
            remote_out = traffic.remote_out,
            "Session closed"
        );
        result
    }

    /// Drops the remote connection, the stage, any outstanding connect and unsent bytes.
    /// Safe to call in any state, any number of times.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.handshake.close();
        if let Some(mut stage) = self.stage.take() {
            stage.shutdown();
        }
        self.remote = None;
        self.connecting = None;
        self.local_out.clear();
        self.remote_out.clear();
    }

    async fn relay<R, W>(&mut self, local_rx: &mut R, local_tx: &mut W) -> crate::Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        self.establish_stage()?;

        let mut local_buf = vec![0u8; BUFFER_SIZE];
        let mut remote_buf = vec![0u8; BUFFER_SIZE];
        let mut remote_rx: Option<ReadHalf<C::ServerConnection>> = None;

        let idle = time::sleep(self.config.idle_timeout);
        let grace = time::sleep(self.config.close_grace);
        tokio::pin!(idle, grace);
        let mut grace_armed = false;

        loop {
            tokio::select! {
                read = local_rx.read(&mut local_buf), if self.can_read_local() => {
                    let n = read?;
                    if n == 0 {
                        debug!("Client closed the connection");
                        self.local_closed = true;
                    } else {
                        idle.as_mut().reset(Instant::now() + self.config.idle_timeout);
                        self.client_in += n as u64;
                        self.from_local(local_buf[..n].to_vec()).await?;
                    }
                }
                read = read_optional(&mut remote_rx, &mut remote_buf), if self.can_read_remote() => {
                    let n = read?;
                    if n == 0 {
                        debug!("Remote closed the connection");
                        remote_rx = None;
                        self.remote = None;
                        self.remote_out.clear();
                        self.remote_closed = true;
                        grace.as_mut().reset(Instant::now() + self.config.close_grace);
                        grace_armed = true;
                    } else {
                        self.remote_in += n as u64;
                        self.send_local(remote_buf[..n].to_vec())?;
                    }
                }
                transformed = stage_recv(&mut self.stage) => {
                    match transformed {
                        Ok(Transformed::Encrypted(bytes)) => self.local_out.push(bytes),
                        Ok(Transformed::Decrypted(bytes)) => self.from_client(bytes).await?,
                        Err(err) => {
                            error!("Stage failed: {}", err);
                            return Err(err.into());
                        }
                    }
                }
                connected = connect_result(&mut self.connecting) => {
                    self.connecting = None;
                    remote_rx = self.on_connect(connected).await?;
                }
                written = self.local_out.write_to(Some(&mut *local_tx)) => written?,
                written = self.remote_out.write_to(self.remote.as_mut()) => written?,
                _ = &mut idle => {
                    warn!("Session idle for {:?}, closing", self.config.idle_timeout);
                    return Ok(());
                }
                _ = &mut grace, if grace_armed => {
                    debug!("Grace period after remote close elapsed");
                    return Ok(());
                }
            }

            if self.finished() {
                return Ok(());
            }
        }
    }

    /// Writes the seed ahead of everything else when the client leg is encrypted.
    fn establish_stage(&mut self) -> crate::Result<()> {
        let seed = if self.config.key.is_some() {
            let seed: u32 = rand::random();
            self.local_out.push(seed.to_le_bytes().to_vec());
            seed
        } else {
            0
        };

        if let Some(pipeline) = self.config.pipeline(seed)? {
            debug!(seed, compress = self.config.compress, "Stage established");
            self.stage = Some(StageHandle::spawn(pipeline));
        }
        Ok(())
    }

    /// Output still being produced for the client.
    fn encrypting(&self) -> usize {
        self.stage.as_ref().map_or(0, StageHandle::encrypting)
    }

    fn decrypting(&self) -> usize {
        self.stage.as_ref().map_or(0, StageHandle::decrypting)
    }

    fn can_read_local(&self) -> bool {
        !self.local_closed && !self.remote_out.is_full() && self.decrypting() < MAX_IN_FLIGHT
    }

    fn can_read_remote(&self) -> bool {
        !self.local_out.is_full() && self.encrypting() < MAX_IN_FLIGHT
    }

    /// A finished handshake or a closed remote ends the session once the client has every
    /// byte meant for it. A closed client ends it once the remote has every byte meant
    /// for it.
    fn finished(&self) -> bool {
        if !self.handshake.is_valid() || self.remote_closed {
            return self.encrypting() == 0 && self.local_out.is_empty();
        }
        if self.local_closed {
            return self.remote.is_none() || (self.decrypting() == 0 && self.remote_out.is_empty());
        }
        false
    }

    async fn from_local(&mut self, bytes: Vec<u8>) -> crate::Result<()> {
        if let Some(stage) = self.stage.as_mut() {
            stage.decrypt(bytes)?;
            return Ok(());
        }
        self.from_client(bytes).await
    }

    /// Plaintext from the client.
    async fn from_client(&mut self, bytes: Vec<u8>) -> crate::Result<()> {
        let actions = self.handshake.feed(bytes);
        self.execute(actions).await
    }

    async fn execute(&mut self, actions: Vec<Action>) -> crate::Result<()> {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Reply(bytes) => self.send_local(bytes)?,
                Action::Authenticate(user) => {
                    let ok = self.authenticator.authenticate_user(user).await;
                    queue.extend(self.handshake.auth_result(ok));
                }
                Action::Connect(target) => self.start_connect(target),
                Action::Forward(bytes) => self.send_remote(bytes),
                Action::Close => debug!("Handshake finished the session"),
            }
        }
        Ok(())
    }

    fn start_connect(&mut self, target: SocksSocketAddr) {
        let (tx, rx) = oneshot::channel();
        let connector = self.connector.clone();
        tokio::spawn(
            async move {
                let result = connector.establish_connection(target).await;
                if tx.send(result).is_err() {
                    debug!("Session is gone, dropping outbound connection");
                }
            }
            .in_current_span(),
        );
        self.connecting = Some(rx);
    }

    async fn on_connect(
        &mut self,
        result: Result<C::ServerConnection, ConnectError>,
    ) -> crate::Result<Option<ReadHalf<C::ServerConnection>>> {
        match result {
            Ok(stream) => {
                let (reader, writer) = io::split(stream);
                self.remote = Some(writer);
                let actions = self.handshake.connected();
                self.execute(actions).await?;
                Ok(Some(reader))
            }
            Err(err) => {
                warn!("{}", err);
                let actions = self.handshake.connect_failed();
                self.execute(actions).await?;
                Ok(None)
            }
        }
    }

    /// Bytes for the client, encrypted first when a stage is configured.
    fn send_local(&mut self, bytes: Vec<u8>) -> crate::Result<()> {
        match self.stage.as_mut() {
            Some(stage) => stage.encrypt(bytes)?,
            None => self.local_out.push(bytes),
        }
        Ok(())
    }

    fn send_remote(&mut self, bytes: Vec<u8>) {
        if self.remote.is_none() {
            warn!("Dropping {} bytes, remote connection is gone", bytes.len());
            return;
        }
        self.remote_out.push(bytes);
    }
}

pub(crate) async fn read_optional<R>(reader: &mut Option<R>, buf: &mut [u8]) -> std_io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(reader) => reader.read(buf).await,
        None => future::pending().await,
    }
}

pub(crate) async fn stage_recv(stage: &mut Option<StageHandle>) -> Result<Transformed, StageError> {
    match stage {
        Some(stage) => stage.recv().await,
        None => future::pending().await,
    }
}

pub(crate) async fn connect_result<S>(connecting: &mut Option<PendingConnect<S>>) -> Result<S, ConnectError> {
    match connecting {
        Some(rx) => rx
            .await
            .unwrap_or_else(|_| Err(ConnectError::new("outbound connect", "connect task vanished"))),
        None => future::pending().await,
    }
}
