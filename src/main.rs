use std::{error::Error, time::Duration};

use clap::{Args, Parser, Subcommand, ValueEnum};
use ranger::{
    config::{SessionConfig, Upstream},
    gate::{RandomPick, RoundRobin},
    method_handlers::TunnelConnect,
    protocol::SocksSocketAddr,
    tunnel::{TunnelClientService, TunnelServerService},
    GateService, Socks5Service,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ranger", version, about = "SOCKS5 proxy with encrypted relay chaining")]
struct Cli {
    /// Log protocol progress (same as RUST_LOG=ranger=debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Serve SOCKS5 clients
    Socks5 {
        #[command(flatten)]
        listen: Listen,

        /// Idle timeout in seconds
        #[arg(short, long, default_value_t = 300)]
        timeout: u64,

        /// Encrypt the client leg with this password
        #[arg(short, long)]
        key: Option<String>,

        /// Compress the client leg
        #[arg(long)]
        zlib: bool,

        /// Require username/password authentication (repeatable, name:password)
        #[arg(short, long = "user", value_parser = parse_user)]
        users: Vec<(String, String)>,
    },
    /// Relay every connection to one of the upstreams
    Gate {
        #[command(flatten)]
        listen: Listen,

        /// Idle timeout in seconds
        #[arg(short, long, default_value_t = 300)]
        timeout: u64,

        /// Upstream proxy as host:port or host:port,key (repeatable)
        #[arg(short, long = "upstream", value_parser = parse_upstream, required = true)]
        upstreams: Vec<Upstream>,

        /// Compress the upstream legs
        #[arg(long)]
        zlib: bool,

        #[arg(long, value_enum, default_value_t = Policy::RoundRobin)]
        policy: Policy,
    },
    /// Accept tunnel connections and open every carried connection to the target
    TunnelServer {
        #[command(flatten)]
        listen: Listen,

        /// Where carried connections go, usually a SOCKS5 proxy (host:port)
        #[arg(long, value_parser = parse_addr)]
        target: SocksSocketAddr,
    },
    /// Accept local connections and carry all of them over one tunnel connection
    TunnelClient {
        #[command(flatten)]
        listen: Listen,

        /// The tunnel server (host:port)
        #[arg(long, value_parser = parse_addr)]
        remote: SocksSocketAddr,
    },
}

#[derive(Args)]
struct Listen {
    /// Address to listen on, all interfaces when omitted
    #[arg(long)]
    host: Option<String>,

    #[arg(short, long, default_value_t = 1080)]
    port: u16,
}

#[derive(Clone, Copy, ValueEnum)]
enum Policy {
    RoundRobin,
    Random,
}

fn parse_user(value: &str) -> Result<(String, String), String> {
    match value.split_once(':') {
        Some((name, password)) if !name.is_empty() => Ok((name.to_owned(), password.to_owned())),
        _ => Err(format!("expected name:password, got {:?}", value)),
    }
}

fn split_host_port(value: &str) -> Result<(&str, u16), String> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("expected host:port, got {:?}", value))?;
    let port = port
        .parse()
        .map_err(|err| format!("invalid port {:?}: {}", port, err))?;
    Ok((host, port))
}

fn parse_addr(value: &str) -> Result<SocksSocketAddr, String> {
    let (host, port) = split_host_port(value)?;
    Ok(Upstream::new(host, port).target())
}

fn parse_upstream(value: &str) -> Result<Upstream, String> {
    let (addr, key) = match value.split_once(',') {
        Some((addr, key)) => (addr, Some(key)),
        None => (value, None),
    };
    let (host, port) = split_host_port(addr)?;

    let upstream = Upstream::new(host, port);
    Ok(match key {
        Some(key) => upstream.with_key(key),
        None => upstream,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "ranger=debug" } else { "ranger=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.mode {
        Mode::Socks5 {
            listen,
            timeout,
            key,
            zlib,
            users,
        } => {
            let service = Socks5Service::new();
            for (name, password) in users {
                if !service.add_user(name.clone(), password) {
                    warn!("Duplicate user {}", name);
                }
            }

            let mut config = SessionConfig::default()
                .with_compression(zlib)
                .with_idle_timeout(Duration::from_secs(timeout));
            if let Some(key) = key {
                config = config.with_key(key);
            }

            let port = service
                .publish(listen.host.as_deref(), listen.port, config)
                .await?;
            info!("SOCKS5 proxy listening on port {}", port);
            tokio::signal::ctrl_c().await?;
            service.shutdown();
        }
        Mode::Gate {
            listen,
            timeout,
            upstreams,
            zlib,
            policy,
        } => {
            let service = match policy {
                Policy::RoundRobin => GateService::with_selector(TunnelConnect, RoundRobin::new()),
                Policy::Random => GateService::with_selector(TunnelConnect, RandomPick),
            };
            for upstream in upstreams {
                service.add_host(upstream.with_compression(zlib));
            }

            let config = SessionConfig::default().with_idle_timeout(Duration::from_secs(timeout));
            let port = service
                .publish(listen.host.as_deref(), listen.port, config)
                .await?;
            info!("Gate listening on port {}", port);
            tokio::signal::ctrl_c().await?;
            service.shutdown();
        }
        Mode::TunnelServer { listen, target } => {
            let service = TunnelServerService::new(target);
            let port = service.publish(listen.host.as_deref(), listen.port).await?;
            info!("Tunnel server listening on port {}", port);
            tokio::signal::ctrl_c().await?;
            service.shutdown();
        }
        Mode::TunnelClient { listen, remote } => {
            let service = TunnelClientService::new(remote);
            let port = service.publish(listen.host.as_deref(), listen.port).await?;
            info!("Tunnel client listening on port {}", port);
            tokio::signal::ctrl_c().await?;
            service.shutdown();
        }
    }

    Ok(())
}
