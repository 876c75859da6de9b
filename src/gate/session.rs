use tokio::{
    io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::oneshot,
    time::{self, Instant},
};
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::{
    config::{SessionConfig, Upstream},
    method_handlers::Connect,
    outbox::{Outbox, HIGH_WATER},
    socks5_session::{
        connect_result, read_optional, stage_recv, PendingConnect, Traffic, BUFFER_SIZE,
        MAX_IN_FLIGHT,
    },
    stage::{StageHandle, Transformed},
    unpacker::Unpacker,
};

/// Forwards one accepted connection to a fixed upstream.
///
/// The remote leg carries the upstream's encryption: when the upstream has a key, its first
/// 4 bytes are the seed the IV derives from. Local bytes that arrive before the stage is
/// ready are held back and flushed in order.
pub struct GateSession<C: Connect> {
    connector: C,
    upstream: Upstream,
    config: SessionConfig,
    stage: Option<StageHandle>,
    remote: Option<WriteHalf<C::ServerConnection>>,
    connecting: Option<PendingConnect<C::ServerConnection>>,
    /// Present while the upstream seed has not fully arrived.
    seed: Option<Unpacker<()>>,
    pending: Vec<Vec<u8>>,
    local_out: Outbox,
    remote_out: Outbox,
    client_in: u64,
    remote_in: u64,
    local_closed: bool,
    remote_closed: bool,
    closed: bool,
}

impl<C: Connect> GateSession<C> {
    pub fn new(connector: C, upstream: Upstream, config: SessionConfig) -> Self {
        GateSession {
            connector,
            upstream,
            config,
            stage: None,
            remote: None,
            connecting: None,
            seed: None,
            pending: Vec::new(),
            local_out: Outbox::default(),
            remote_out: Outbox::default(),
            client_in: 0,
            remote_in: 0,
            local_closed: false,
            remote_closed: false,
            closed: false,
        }
    }

    pub fn traffic(&self) -> Traffic {
        Traffic {
            client_in: self.client_in,
            client_out: self.local_out.written(),
            remote_in: self.remote_in,
            remote_out: self.remote_out.written(),
        }
    }

    #[instrument(skip_all, fields(upstream = %self.upstream.target()))]
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
            "Gate session closed"
        );
        result
    }

    /// Safe to call any number of times.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut stage) = self.stage.take() {
            stage.shutdown();
        }
        self.remote = None;
        self.connecting = None;
        self.seed = None;
        self.pending.clear();
        self.local_out.clear();
        self.remote_out.clear();
    }

    async fn relay<R, W>(&mut self, local_rx: &mut R, local_tx: &mut W) -> crate::Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        self.start_connect();

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
                        self.from_local(local_buf[..n].to_vec())?;
                    }
                }
                read = read_optional(&mut remote_rx, &mut remote_buf), if self.can_read_remote() => {
                    let n = read?;
                    if n == 0 {
                        debug!("Upstream closed the connection");
                        if self.seed.is_some() {
                            warn!("Upstream closed before sending its seed");
                            return Ok(());
                        }
                        remote_rx = None;
                        self.remote = None;
                        self.remote_out.clear();
                        self.remote_closed = true;
                        grace.as_mut().reset(Instant::now() + self.config.close_grace);
                        grace_armed = true;
                    } else {
                        self.remote_in += n as u64;
                        self.from_remote(remote_buf[..n].to_vec())?;
                    }
                }
                transformed = stage_recv(&mut self.stage) => {
                    match transformed {
                        Ok(Transformed::Encrypted(bytes)) => self.send_remote(bytes),
                        Ok(Transformed::Decrypted(bytes)) => self.local_out.push(bytes),
                        Err(err) => {
                            error!("Stage failed: {}", err);
                            return Err(err.into());
                        }
                    }
                }
                connected = connect_result(&mut self.connecting) => {
                    self.connecting = None;
                    match connected {
                        Ok(stream) => remote_rx = Some(self.on_connect(stream)?),
                        Err(err) => {
                            warn!("{}", err);
                            return Err(err.into());
                        }
                    }
                }
                written = self.local_out.write_to(Some(&mut *local_tx)) => written?,
                written = self.remote_out.write_to(self.remote.as_mut()) => written?,
                _ = &mut idle => {
                    warn!("Session idle for {:?}, closing", self.config.idle_timeout);
                    return Ok(());
                }
                _ = &mut grace, if grace_armed => {
                    debug!("Grace period after upstream close elapsed");
                    return Ok(());
                }
            }

            if self.finished() {
                return Ok(());
            }
        }
    }

    fn start_connect(&mut self) {
        let (tx, rx) = oneshot::channel();
        let connector = self.connector.clone();
        let target = self.upstream.target();
        tokio::spawn(
            async move {
                let result = connector.establish_connection(target).await;
                if tx.send(result).is_err() {
                    debug!("Session is gone, dropping upstream connection");
                }
            }
            .in_current_span(),
        );
        self.connecting = Some(rx);
    }

    fn on_connect(
        &mut self,
        stream: C::ServerConnection,
    ) -> crate::Result<ReadHalf<C::ServerConnection>> {
        debug!("Connected to upstream");
        let (reader, writer) = io::split(stream);
        self.remote = Some(writer);

        if self.upstream.encrypted() {
            let mut seed = Unpacker::new();
            seed.expect(4, ());
            self.seed = Some(seed);
        } else {
            self.establish_stage(0, Vec::new())?;
        }
        Ok(reader)
    }

    /// Builds the pipeline for the upstream leg and releases everything held back so far.
    /// `leftover` is upstream data that arrived together with the seed.
    fn establish_stage(&mut self, seed: u32, leftover: Vec<u8>) -> crate::Result<()> {
        if let Some(pipeline) = self.upstream.pipeline(seed)? {
            debug!(seed, compress = self.upstream.compress, "Upstream stage established");
            let mut stage = StageHandle::spawn(pipeline);
            if !leftover.is_empty() {
                stage.decrypt(leftover)?;
            }
            self.stage = Some(stage);
        }

        for bytes in std::mem::take(&mut self.pending) {
            self.to_remote(bytes)?;
        }
        Ok(())
    }

    fn encrypting(&self) -> usize {
        self.stage.as_ref().map_or(0, StageHandle::encrypting)
    }

    fn decrypting(&self) -> usize {
        self.stage.as_ref().map_or(0, StageHandle::decrypting)
    }

    fn held_back(&self) -> usize {
        self.pending.iter().map(Vec::len).sum()
    }

    fn can_read_local(&self) -> bool {
        !self.local_closed
            && self.remote_out.len() + self.held_back() < HIGH_WATER
            && self.encrypting() < MAX_IN_FLIGHT
    }

    fn can_read_remote(&self) -> bool {
        !self.local_out.is_full() && self.decrypting() < MAX_IN_FLIGHT
    }

    /// A closed upstream ends the session once the client has every byte meant for it, and
    /// a closed client ends it once the upstream has every byte meant for it.
    fn finished(&self) -> bool {
        if self.remote_closed {
            return self.decrypting() == 0 && self.local_out.is_empty();
        }
        if self.local_closed {
            return !self.ready() || (self.encrypting() == 0 && self.remote_out.is_empty());
        }
        false
    }

    fn ready(&self) -> bool {
        self.remote.is_some() && self.seed.is_none()
    }

    fn from_local(&mut self, bytes: Vec<u8>) -> crate::Result<()> {
        if !self.ready() {
            self.pending.push(bytes);
            return Ok(());
        }
        self.to_remote(bytes)
    }

    fn to_remote(&mut self, bytes: Vec<u8>) -> crate::Result<()> {
        match self.stage.as_mut() {
            Some(stage) => stage.encrypt(bytes)?,
            None => self.send_remote(bytes),
        }
        Ok(())
    }

    fn from_remote(&mut self, bytes: Vec<u8>) -> crate::Result<()> {
        if let Some(mut unpacker) = self.seed.take() {
            let mut seed = None;
            unpacker.feed(bytes, |_, (), frame| {
                let mut word = [0u8; 4];
                word.copy_from_slice(&frame);
                seed = Some(u32::from_le_bytes(word));
                false
            });

            match seed {
                Some(seed) => {
                    let leftover = unpacker.take_remaining();
                    self.establish_stage(seed, leftover)?;
                }
                None => self.seed = Some(unpacker),
            }
            return Ok(());
        }

        match self.stage.as_mut() {
            Some(stage) => stage.decrypt(bytes)?,
            None => self.local_out.push(bytes),
        }
        Ok(())
    }

    fn send_remote(&mut self, bytes: Vec<u8>) {
        if self.remote.is_none() {
            warn!("Dropping {} bytes, upstream connection is gone", bytes.len());
            return;
        }
        self.remote_out.push(bytes);
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{duplex, AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::{
        method_handlers::TunnelConnect,
        stage::{self, Transform},
    };

    #[tokio::test]
    async fn buffers_until_seed_and_decrypts_leftover() {
        let key = b"gate key".to_vec();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let upstream_key = key.clone();
        let upstream = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let seed: u32 = 0xDEAD_BEEF;
            let mut pipe = stage::pipeline(Some(upstream_key.as_slice()), seed, false).unwrap().unwrap();

            // Seed and the first payload in one write.
            let mut first = seed.to_le_bytes().to_vec();
            first.extend(pipe.encrypt(b"greeting".to_vec()).unwrap());
            stream.write_all(&first).await.unwrap();

            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            pipe.decrypt(buf.to_vec()).unwrap()
        });

        let (mut client, server) = duplex(1024);
        client.write_all(b"early").await.unwrap();
        tokio::spawn(async move {
            let upstream = Upstream::new("127.0.0.1", port).with_key(key);
            let mut session = GateSession::new(TunnelConnect, upstream, SessionConfig::default());
            session.run(server).await
        });

        let mut greeting = [0u8; 8];
        client.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"greeting");
        assert_eq!(upstream.await.unwrap(), b"early".to_vec());
    }

    #[tokio::test]
    async fn upstream_close_mid_stream_delivers_then_ends() {
        const TOTAL: usize = 300 * 1024;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4];
            stream.read_exact(&mut request).await.unwrap();
            stream.write_all(&vec![3u8; TOTAL]).await.unwrap();
        });

        let (mut client, server) = duplex(4096);
        let handle = tokio::spawn(async move {
            let mut session =
                GateSession::new(TunnelConnect, Upstream::new("127.0.0.1", port), SessionConfig::default());
            session.run(server).await
        });
        client.write_all(b"more").await.unwrap();

        let mut received = Vec::new();
        tokio::time::timeout(std::time::Duration::from_secs(10), client.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.len(), TOTAL);
        assert!(received.iter().all(|&byte| byte == 3));
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn unreachable_upstream_closes_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (mut client, server) = duplex(64);
        let mut session = GateSession::new(
            TunnelConnect,
            Upstream::new("127.0.0.1", port),
            SessionConfig::default(),
        );
        assert!(session.run(server).await.is_err());

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        session.close();
    }
}
