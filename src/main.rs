//! Spacelink CLI - reverse TCP tunnel
//!
//! Expose a TCP service that has no inbound reachability through a public relay.

mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{AgentSection, ConfigFile, OnExhausted, RelaySection, RetrySection, StatusSection};
use spacelink_agent::{Agent, AgentConfig, ExhaustionPolicy, HeartbeatConfig};
use spacelink_relay::{RelayConfig, RelayServer};
use spacelink_status::{StatusServer, StatusServerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Spacelink - reach a service behind NAT through a public relay
#[derive(Parser, Debug)]
#[command(name = "spacelink")]
#[command(about = "Spacelink - reach a service behind NAT through a public relay")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging (same as --log-level debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info", env = "SPACELINK_LOG_LEVEL")]
    log_level: String,

    /// Configuration file (YAML)
    #[arg(long, short = 'c', global = true, env = "SPACELINK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public relay
    #[command(long_about = r#"
Run the public relay. External clients connect to the client port, the agent
connects to the tunnel port, and each client is spliced onto one idle tunnel.

EXAMPLES:
  # Default ports: clients on 4000, tunnels on 3000
  spacelink relay

  # Also serve the status API on port 2000
  spacelink relay --status-addr 0.0.0.0:2000

ENVIRONMENT VARIABLES:
  SPACELINK_CLIENT_ADDR  Address external clients connect to
  SPACELINK_TUNNEL_ADDR  Address the agent connects to
  SPACELINK_STATUS_ADDR  Status API address (optional)
"#)]
    Relay(RelayArgs),

    /// Run the agent next to the protected service
    #[command(long_about = r#"
Run the agent next to the protected service. It dials the relay's tunnel port
and the local service, pipes bytes between them, and redials whenever the
circuit breaks.

EXAMPLES:
  # Expose local SSH through relay.example.com
  spacelink agent --relay relay.example.com:3000 --local localhost:22

  # Report presence to the status API every 30 seconds
  spacelink agent --relay relay.example.com:3000 --local localhost:5000 \
    --status-url http://relay.example.com:2000/

ENVIRONMENT VARIABLES:
  SPACELINK_RELAY        Relay tunnel address (host:port)
  SPACELINK_LOCAL        Local service address (host:port)
  SPACELINK_STATUS_URL   Status API URL for heartbeats (optional)
"#)]
    Agent(AgentArgs),

    /// Run the status API on its own
    Status(StatusArgs),
}

#[derive(Args, Debug)]
struct RelayArgs {
    /// Address external clients connect to [default: 0.0.0.0:4000]
    #[arg(long, env = "SPACELINK_CLIENT_ADDR")]
    client_addr: Option<String>,

    /// Address the agent connects to [default: 0.0.0.0:3000]
    #[arg(long, env = "SPACELINK_TUNNEL_ADDR")]
    tunnel_addr: Option<String>,

    /// Idle tunnels kept waiting for clients [default: 16]
    #[arg(long)]
    max_idle_tunnels: Option<usize>,

    /// Seconds a client waits for a tunnel before it is dropped [default: 10]
    #[arg(long)]
    client_wait: Option<u64>,

    /// Read buffer size per direction [default: 1024]
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Also serve the status API on this address
    #[arg(long, env = "SPACELINK_STATUS_ADDR")]
    status_addr: Option<String>,
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// Relay tunnel address (e.g., relay.example.com:3000)
    #[arg(long, env = "SPACELINK_RELAY")]
    relay: Option<String>,

    /// Local service address (e.g., localhost:5000)
    #[arg(long, env = "SPACELINK_LOCAL")]
    local: Option<String>,

    /// Read buffer size per direction [default: 1024]
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Status API URL to send heartbeats to
    #[arg(long, env = "SPACELINK_STATUS_URL")]
    status_url: Option<String>,

    /// Seconds between heartbeats [default: 30]
    #[arg(long)]
    heartbeat_interval: Option<u64>,

    /// Dial attempts before giving up on a circuit [default: 10000]
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Initial back-off in milliseconds [default: 1000]
    #[arg(long)]
    initial_backoff: Option<u64>,

    /// Maximum back-off in milliseconds [default: 60000]
    #[arg(long)]
    max_backoff: Option<u64>,

    /// What to do when a dial runs out of attempts [default: restart]
    #[arg(long, value_enum)]
    on_exhausted: Option<OnExhausted>,

    /// Seconds to wait before restarting an exhausted circuit [default: 5]
    #[arg(long)]
    restart_cooldown: Option<u64>,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Address to serve the status API on [default: 0.0.0.0:2000]
    #[arg(long, env = "SPACELINK_STATUS_ADDR")]
    bind: Option<String>,

    /// Seconds a heartbeat keeps the space open [default: 70]
    #[arg(long)]
    freshness: Option<u64>,
}

/// Setup logging: RUST_LOG wins, then -v, then --log-level
fn setup_logging(log_level: &str, verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { log_level };

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("Invalid log level: {}", level))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

fn parse_socket_addr(addr: &str, kind: &str) -> Result<SocketAddr> {
    addr.parse()
        .with_context(|| format!("Invalid {} address '{}' (expected ip:port)", kind, addr))
}

/// Merge relay flags over the config file, giving precedence to flags
fn build_relay_config(args: &RelayArgs, file: &RelaySection) -> Result<RelayConfig> {
    let defaults = RelayConfig::default();

    let client_addr = match args.client_addr.as_ref().or(file.client_addr.as_ref()) {
        Some(addr) => parse_socket_addr(addr, "client")?,
        None => defaults.client_addr,
    };
    let tunnel_addr = match args.tunnel_addr.as_ref().or(file.tunnel_addr.as_ref()) {
        Some(addr) => parse_socket_addr(addr, "tunnel")?,
        None => defaults.tunnel_addr,
    };

    let max_idle_tunnels = args
        .max_idle_tunnels
        .or(file.max_idle_tunnels)
        .unwrap_or(defaults.max_idle_tunnels);
    if max_idle_tunnels == 0 {
        anyhow::bail!("max_idle_tunnels must be at least 1");
    }

    Ok(RelayConfig {
        client_addr,
        tunnel_addr,
        max_idle_tunnels,
        client_wait: args
            .client_wait
            .or(file.client_wait_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.client_wait),
        buffer_size: args
            .buffer_size
            .or(file.buffer_size)
            .unwrap_or(defaults.buffer_size),
    })
}

/// Merge agent flags over the config file, giving precedence to flags
fn build_agent_config(
    args: &AgentArgs,
    file: &AgentSection,
    retry: &RetrySection,
) -> Result<AgentConfig> {
    let defaults = AgentConfig::default();

    let relay_addr = args
        .relay
        .clone()
        .or_else(|| file.relay.clone())
        .ok_or_else(|| anyhow::anyhow!("Relay address is required (use --relay or config file)"))?;
    let local_addr = args
        .local
        .clone()
        .or_else(|| file.local.clone())
        .ok_or_else(|| anyhow::anyhow!("Local address is required (use --local or config file)"))?;

    let mut policy = retry.to_policy();
    if let Some(max_attempts) = args.max_attempts {
        policy.max_attempts = max_attempts;
    }
    if let Some(ms) = args.initial_backoff {
        policy.initial_backoff = Duration::from_millis(ms);
    }
    if let Some(ms) = args.max_backoff {
        policy.max_backoff = Duration::from_millis(ms);
    }
    if policy.max_attempts == 0 {
        anyhow::bail!("max_attempts must be at least 1");
    }

    let on_exhausted = match args.on_exhausted.or(file.on_exhausted) {
        Some(OnExhausted::Fail) => ExhaustionPolicy::Fail,
        Some(OnExhausted::Restart) | None => {
            match args.restart_cooldown.or(file.restart_cooldown_secs) {
                Some(secs) => ExhaustionPolicy::Restart {
                    cooldown: Duration::from_secs(secs),
                },
                None => defaults.on_exhausted,
            }
        }
    };

    let heartbeat = args
        .status_url
        .clone()
        .or_else(|| file.status_url.clone())
        .map(|url| {
            let mut heartbeat = HeartbeatConfig::new(url);
            if let Some(secs) = args.heartbeat_interval.or(file.heartbeat_interval_secs) {
                heartbeat.interval = Duration::from_secs(secs);
            }
            heartbeat
        });
    if heartbeat.as_ref().is_some_and(|hb| hb.interval.is_zero()) {
        anyhow::bail!("heartbeat interval must be at least 1 second");
    }

    Ok(AgentConfig {
        relay_addr,
        local_addr,
        retry: policy,
        buffer_size: args
            .buffer_size
            .or(file.buffer_size)
            .unwrap_or(defaults.buffer_size),
        on_exhausted,
        heartbeat,
    })
}

/// Status server settings; `bind` comes from whichever flag asked for the server
fn build_status_config(
    bind: Option<&String>,
    freshness: Option<u64>,
    file: &StatusSection,
) -> Result<StatusServerConfig> {
    let defaults = StatusServerConfig::default();

    Ok(StatusServerConfig {
        bind_addr: match bind.or(file.bind_addr.as_ref()) {
            Some(addr) => parse_socket_addr(addr, "status")?,
            None => defaults.bind_addr,
        },
        freshness: freshness
            .or(file.freshness_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.freshness),
        info: file.space.clone().unwrap_or(defaults.info),
    })
}

async fn run_relay(args: RelayArgs, file: ConfigFile, shutdown: CancellationToken) -> Result<()> {
    let config = build_relay_config(&args, &file.relay)?;
    let status_addr = args.status_addr.as_ref().or(file.relay.status_addr.as_ref());
    let status_config = match status_addr {
        Some(addr) => Some(build_status_config(Some(addr), None, &file.status)?),
        None => None,
    };

    let relay = RelayServer::bind(config)
        .await
        .context("Failed to start relay")?;

    let status_task = match status_config {
        Some(config) => {
            let server = StatusServer::bind(config)
                .await
                .context("Failed to start status server")?;
            Some(tokio::spawn(server.run(shutdown.clone())))
        }
        None => None,
    };

    let result = relay.run(shutdown.clone()).await.context("Relay failed");

    // Stop the status server too if the relay ended on its own
    shutdown.cancel();
    if let Some(task) = status_task {
        task.await
            .context("Status server task panicked")?
            .context("Status server failed")?;
    }

    result
}

async fn run_agent(args: AgentArgs, file: ConfigFile, shutdown: CancellationToken) -> Result<()> {
    let config = build_agent_config(&args, &file.agent, &file.retry)
        .context("Failed to build agent configuration")?;

    info!("Relay: {}", config.relay_addr);
    info!("Local service: {}", config.local_addr);
    if let Some(heartbeat) = &config.heartbeat {
        info!("Status URL: {}", heartbeat.url);
    }

    let agent = Agent::new(config).context("Failed to create agent")?;
    agent.run(shutdown).await.context("Agent failed")
}

async fn run_status(args: StatusArgs, file: ConfigFile, shutdown: CancellationToken) -> Result<()> {
    let config = build_status_config(args.bind.as_ref(), args.freshness, &file.status)?;
    let server = StatusServer::bind(config)
        .await
        .context("Failed to start status server")?;
    server.run(shutdown).await.context("Status server failed")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level, cli.verbose)?;

    let file = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            ConfigFile::load(path)?
        }
        None => ConfigFile::default(),
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        signal_token.cancel();
    });

    let result = match cli.command {
        Commands::Relay(args) => run_relay(args, file, shutdown).await,
        Commands::Agent(args) => run_agent(args, file, shutdown).await,
        Commands::Status(args) => run_status(args, file, shutdown).await,
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_args() -> AgentArgs {
        AgentArgs {
            relay: None,
            local: None,
            buffer_size: None,
            status_url: None,
            heartbeat_interval: None,
            max_attempts: None,
            initial_backoff: None,
            max_backoff: None,
            on_exhausted: None,
            restart_cooldown: None,
        }
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "spacelink",
            "agent",
            "--relay",
            "relay.example.com:3000",
            "--local",
            "localhost:22",
            "--on-exhausted",
            "fail",
        ])
        .unwrap();
        match cli.command {
            Commands::Agent(args) => {
                assert_eq!(args.relay.as_deref(), Some("relay.example.com:3000"));
                assert_eq!(args.on_exhausted, Some(OnExhausted::Fail));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_relay_defaults() {
        let args = RelayArgs {
            client_addr: None,
            tunnel_addr: None,
            max_idle_tunnels: None,
            client_wait: None,
            buffer_size: None,
            status_addr: None,
        };
        let config = build_relay_config(&args, &RelaySection::default()).unwrap();
        assert_eq!(config.client_addr.port(), 4000);
        assert_eq!(config.tunnel_addr.port(), 3000);
        assert_eq!(config.max_idle_tunnels, 16);
    }

    #[test]
    fn test_relay_flags_override_file() {
        let args = RelayArgs {
            client_addr: Some("127.0.0.1:8000".to_string()),
            tunnel_addr: None,
            max_idle_tunnels: None,
            client_wait: Some(3),
            buffer_size: None,
            status_addr: None,
        };
        let file = RelaySection {
            client_addr: Some("0.0.0.0:9000".to_string()),
            tunnel_addr: Some("0.0.0.0:9001".to_string()),
            ..RelaySection::default()
        };
        let config = build_relay_config(&args, &file).unwrap();
        assert_eq!(config.client_addr.port(), 8000);
        assert_eq!(config.tunnel_addr.port(), 9001);
        assert_eq!(config.client_wait, Duration::from_secs(3));
    }

    #[test]
    fn test_relay_rejects_bad_address() {
        let file = RelaySection {
            tunnel_addr: Some("localhost".to_string()),
            ..RelaySection::default()
        };
        let args = RelayArgs {
            client_addr: None,
            tunnel_addr: None,
            max_idle_tunnels: None,
            client_wait: None,
            buffer_size: None,
            status_addr: None,
        };
        assert!(build_relay_config(&args, &file).is_err());
    }

    #[test]
    fn test_agent_requires_addresses() {
        let err = build_agent_config(
            &agent_args(),
            &AgentSection::default(),
            &RetrySection::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("Relay address is required"));
    }

    #[test]
    fn test_agent_merges_file_and_flags() {
        let args = AgentArgs {
            local: Some("localhost:22".to_string()),
            max_attempts: Some(5),
            ..agent_args()
        };
        let file = AgentSection {
            relay: Some("relay.example.com:3000".to_string()),
            local: Some("localhost:5000".to_string()),
            status_url: Some("http://relay.example.com:2000/".to_string()),
            restart_cooldown_secs: Some(9),
            ..AgentSection::default()
        };
        let retry = RetrySection {
            initial_backoff_ms: Some(250),
            ..RetrySection::default()
        };

        let config = build_agent_config(&args, &file, &retry).unwrap();
        assert_eq!(config.relay_addr, "relay.example.com:3000");
        assert_eq!(config.local_addr, "localhost:22");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(250));
        assert_eq!(
            config.on_exhausted,
            ExhaustionPolicy::Restart {
                cooldown: Duration::from_secs(9)
            }
        );
        let heartbeat = config.heartbeat.unwrap();
        assert_eq!(heartbeat.url, "http://relay.example.com:2000/");
        assert_eq!(heartbeat.interval, Duration::from_secs(30));
    }

    #[test]
    fn test_status_config_uses_space_template() {
        let file = StatusSection {
            freshness_secs: Some(120),
            space: Some(spacelink_status::SpaceInfo {
                space: "CADR".to_string(),
                ..Default::default()
            }),
            ..StatusSection::default()
        };
        let config = build_status_config(None, None, &file).unwrap();
        assert_eq!(config.bind_addr.port(), 2000);
        assert_eq!(config.freshness, Duration::from_secs(120));
        assert_eq!(config.info.space, "CADR");
    }
}
