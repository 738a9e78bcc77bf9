//! Agent circuit loop

use crate::heartbeat::run_heartbeat;
use spacelink_pipe::{Pipe, DEFAULT_BUFFER_SIZE};
use spacelink_retry::{RetryError, RetryPolicy};
use spacelink_status::{HeartbeatClient, StatusError};
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Agent errors
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid {kind} address '{address}': {reason}")]
    InvalidAddress {
        kind: &'static str,
        address: String,
        reason: String,
    },

    #[error("Gave up dialing {target} at {address} after {attempts} attempts: {source}")]
    RetriesExhausted {
        target: DialTarget,
        address: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("Cannot dial {target} at {address}: {source}")]
    Dial {
        target: DialTarget,
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Heartbeat setup failed: {0}")]
    Heartbeat(#[from] StatusError),
}

/// Which end of the circuit a dial is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialTarget {
    Relay,
    Local,
}

impl DialTarget {
    fn label(self) -> &'static str {
        match self {
            DialTarget::Relay => "tunnel dial",
            DialTarget::Local => "local dial",
        }
    }
}

impl fmt::Display for DialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialTarget::Relay => write!(f, "relay"),
            DialTarget::Local => write!(f, "local service"),
        }
    }
}

/// Lifecycle of one circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Init,
    DialingTunnel,
    DialingLocal,
    Piping,
    Closing,
    Closed,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Init => "init",
            CircuitState::DialingTunnel => "dialing-tunnel",
            CircuitState::DialingLocal => "dialing-local",
            CircuitState::Piping => "piping",
            CircuitState::Closing => "closing",
            CircuitState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What to do when a dial runs out of attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    /// Log, wait `cooldown`, then start a fresh circuit
    Restart { cooldown: Duration },
    /// Stop the agent with [`AgentError::RetriesExhausted`]
    Fail,
}

impl Default for ExhaustionPolicy {
    fn default() -> Self {
        ExhaustionPolicy::Restart {
            cooldown: Duration::from_secs(5),
        }
    }
}

/// Periodic presence heartbeat
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub url: String,
    pub interval: Duration,
}

impl HeartbeatConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            interval: Duration::from_secs(30),
        }
    }
}

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Relay tunnel port (host:port)
    pub relay_addr: String,
    /// Service being exposed (host:port)
    pub local_addr: String,
    pub retry: RetryPolicy,
    pub buffer_size: usize,
    pub on_exhausted: ExhaustionPolicy,
    pub heartbeat: Option<HeartbeatConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            relay_addr: "localhost:3000".to_string(),
            local_addr: "localhost:5000".to_string(),
            retry: RetryPolicy::default(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            on_exhausted: ExhaustionPolicy::default(),
            heartbeat: None,
        }
    }
}

/// Check that `addr` looks like `host:port`
pub fn validate_address(addr: &str, kind: &'static str) -> Result<(), AgentError> {
    let invalid = |reason: &str| AgentError::InvalidAddress {
        kind,
        address: addr.to_string(),
        reason: reason.to_string(),
    };

    let Some((host, port)) = addr.rsplit_once(':') else {
        return Err(invalid("expected format host:port"));
    };
    if host.is_empty() {
        return Err(invalid("host cannot be empty"));
    }
    match port.parse::<u16>() {
        Ok(0) => Err(invalid("port cannot be 0")),
        Ok(_) => Ok(()),
        Err(_) => Err(invalid("port must be a number between 1 and 65535")),
    }
}

/// A circuit that lived this long counts as healthy even without traffic
const HEALTHY_CIRCUIT_AGE: Duration = Duration::from_secs(5);

enum CircuitEnd {
    /// Pipe ended on its own; dial again
    Broken { healthy: bool },
    Shutdown,
}

/// Tunnel agent
pub struct Agent {
    config: AgentConfig,
    heartbeat: Option<(HeartbeatClient, Duration)>,
    state_tx: watch::Sender<CircuitState>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        validate_address(&config.relay_addr, "relay")?;
        validate_address(&config.local_addr, "local")?;

        let heartbeat = match &config.heartbeat {
            Some(hb) => Some((HeartbeatClient::new(hb.url.clone())?, hb.interval)),
            None => None,
        };

        let (state_tx, _) = watch::channel(CircuitState::Init);

        Ok(Self {
            config,
            heartbeat,
            state_tx,
        })
    }

    /// Subscribe to circuit state changes
    pub fn state(&self) -> watch::Receiver<CircuitState> {
        self.state_tx.subscribe()
    }

    /// Keep a circuit up until `shutdown` fires
    ///
    /// Returns `Ok(())` on shutdown. Under [`ExhaustionPolicy::Fail`] a dial
    /// that runs out of attempts ends the agent with an error.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), AgentError> {
        info!(
            relay = %self.config.relay_addr,
            local = %self.config.local_addr,
            "🚀 Starting agent"
        );

        let heartbeat_cancel = shutdown.child_token();
        let heartbeat_task = self.heartbeat.clone().map(|(client, interval)| {
            tokio::spawn(run_heartbeat(client, interval, heartbeat_cancel.clone()))
        });

        let result = self.run_circuits(&shutdown).await;

        heartbeat_cancel.cancel();
        if let Some(task) = heartbeat_task {
            let _ = task.await;
        }

        self.set_state(CircuitState::Closed);
        info!("Agent stopped");
        result
    }

    async fn run_circuits(&self, shutdown: &CancellationToken) -> Result<(), AgentError> {
        // Spans circuits that drop straight after forming (relay pool full,
        // local service closing on accept) so redials back off
        let mut unstable = self.config.retry.backoff();

        loop {
            let err = match self.run_circuit(shutdown).await {
                Ok(CircuitEnd::Shutdown) => return Ok(()),
                Ok(CircuitEnd::Broken { healthy: true }) => {
                    unstable.reset();
                    continue;
                }
                Ok(CircuitEnd::Broken { healthy: false }) => {
                    let delay = unstable
                        .next_delay()
                        .unwrap_or(self.config.retry.max_backoff);
                    warn!(
                        attempt = unstable.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "Circuit dropped without traffic, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
                Err(e) => e,
            };

            match self.config.on_exhausted {
                ExhaustionPolicy::Fail => {
                    error!("❌ {}", err);
                    return Err(err);
                }
                ExhaustionPolicy::Restart { cooldown } => {
                    error!(
                        cooldown_ms = cooldown.as_millis() as u64,
                        "❌ {}; restarting circuit", err
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(cooldown) => {}
                    }
                }
            }
        }
    }

    async fn run_circuit(&self, shutdown: &CancellationToken) -> Result<CircuitEnd, AgentError> {
        self.set_state(CircuitState::DialingTunnel);
        info!("🔌 Connecting to relay at {}", self.config.relay_addr);
        let Some(tunnel) = self
            .dial(DialTarget::Relay, &self.config.relay_addr, shutdown)
            .await?
        else {
            return Ok(CircuitEnd::Shutdown);
        };
        info!("✅ Connected to relay");

        self.set_state(CircuitState::DialingLocal);
        // An early return drops `tunnel`, closing the relay side first
        let Some(local) = self
            .dial(DialTarget::Local, &self.config.local_addr, shutdown)
            .await?
        else {
            return Ok(CircuitEnd::Shutdown);
        };
        info!("✅ Connected to local service at {}", self.config.local_addr);

        self.set_state(CircuitState::Piping);
        let started = Instant::now();
        let report = Pipe::new(tunnel, local)
            .with_buffer_size(self.config.buffer_size)
            .run(shutdown.child_token())
            .await;
        self.set_state(CircuitState::Closing);

        if report.is_cancelled() {
            debug!("Circuit closed for shutdown");
            return Ok(CircuitEnd::Shutdown);
        }

        warn!(
            reason = %report.closed,
            bytes_from_relay = report.bytes_a_to_b,
            bytes_to_relay = report.bytes_b_to_a,
            "🔄 Disconnected, reconnecting"
        );
        let carried = report.bytes_a_to_b + report.bytes_b_to_a;
        Ok(CircuitEnd::Broken {
            healthy: carried > 0 || started.elapsed() >= HEALTHY_CIRCUIT_AGE,
        })
    }

    /// `Ok(None)` means shutdown fired while dialing
    async fn dial(
        &self,
        target: DialTarget,
        address: &str,
        shutdown: &CancellationToken,
    ) -> Result<Option<TcpStream>, AgentError> {
        let result = self
            .config
            .retry
            .run(target.label(), shutdown, || TcpStream::connect(address))
            .await;

        match result {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY on {} stream: {}", target, e);
                }
                Ok(Some(stream))
            }
            Err(RetryError::Cancelled) => Ok(None),
            Err(RetryError::Exhausted { attempts, last }) => Err(AgentError::RetriesExhausted {
                target,
                address: address.to_string(),
                attempts,
                source: last,
            }),
            Err(RetryError::Permanent(source)) => Err(AgentError::Dial {
                target,
                address: address.to_string(),
                source,
            }),
        }
    }

    fn set_state(&self, state: CircuitState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Circuit state");
        }
    }
}
