use std::time::Duration;

use crate::{
    protocol::{Addr, SocksSocketAddr},
    stage::{self, BoxedTransform, StageError},
};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Per-listener session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Password for the AES-CFB stage. `None` leaves the client leg unencrypted.
    pub key: Option<Vec<u8>>,
    pub compress: bool,
    /// Closes the session when the client sends nothing for this long.
    pub idle_timeout: Duration,
    /// How long to wait for in-flight output after the remote side closed.
    pub close_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            key: None,
            compress: false,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }
}

impl SessionConfig {
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        let key = key.into();
        self.key = if key.is_empty() { None } else { Some(key) };
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_close_grace(mut self, close_grace: Duration) -> Self {
        self.close_grace = close_grace;
        self
    }

    pub fn pipeline(&self, seed: u32) -> Result<Option<BoxedTransform>, StageError> {
        stage::pipeline(self.key.as_deref(), seed, self.compress)
    }
}

/// A relay target of the gate service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
    /// Present when the upstream is an encrypted listener of this proxy.
    pub key: Option<Vec<u8>>,
    pub compress: bool,
}

impl Upstream {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Upstream {
            host: host.into(),
            port,
            key: None,
            compress: false,
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        let key = key.into();
        self.key = if key.is_empty() { None } else { Some(key) };
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }

    pub fn target(&self) -> SocksSocketAddr {
        let addr = match self.host.parse() {
            Ok(ipv4) => Addr::Ipv4(ipv4),
            Err(_) => Addr::Domain(self.host.clone()),
        };
        SocksSocketAddr::new(addr, self.port)
    }

    /// Whether the upstream expects a seed handshake before any payload.
    pub fn encrypted(&self) -> bool {
        self.key.is_some()
    }

    pub fn pipeline(&self, seed: u32) -> Result<Option<BoxedTransform>, StageError> {
        stage::pipeline(self.key.as_deref(), seed, self.compress)
    }
}
