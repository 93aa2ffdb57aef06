//! High-level push client API.
//!
//! A [`PushClient`] owns one outbound connection to the push server and
//! keeps it alive: heartbeats probe the link, failures trigger automatic
//! reconnection, and an optional network-reachability probe decides how
//! aggressively to retry. All operations are posted to the session's
//! serialized command queue and return immediately.

mod connection;
mod session;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ack::Ack;
use crate::core::constants::{
    ACK_SWEEP_INTERVAL, CONNECT_TIMEOUT, HEARTBEAT_LONG, HEARTBEAT_MIN, HEARTBEAT_SHORT,
};
use crate::core::{ClientError, MsgReceiver, NetworkProbe};

use session::{Command, SessionShared};

/// Client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Server host name or IP address.
    pub address: String,

    /// Server port.
    pub port: u16,

    /// TCP connect timeout.
    pub connect_timeout: Duration,

    /// Heartbeat interval in steady state.
    pub heartbeat_long: Duration,

    /// Grace period granted to an in-flight first connect.
    pub heartbeat_short: Duration,

    /// Heartbeat interval while degraded.
    pub heartbeat_min: Duration,

    /// Interval between ack timeout sweeps.
    pub ack_sweep_interval: Duration,

    /// Network-reachability probe consulted on disconnect; `None` means
    /// "assume reachable".
    pub network_probe: Option<NetworkProbe>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 0,
            connect_timeout: CONNECT_TIMEOUT,
            heartbeat_long: HEARTBEAT_LONG,
            heartbeat_short: HEARTBEAT_SHORT,
            heartbeat_min: HEARTBEAT_MIN,
            ack_sweep_interval: ACK_SWEEP_INTERVAL,
            network_probe: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("connect_timeout", &self.connect_timeout)
            .field("heartbeat_long", &self.heartbeat_long)
            .field("heartbeat_short", &self.heartbeat_short)
            .field("heartbeat_min", &self.heartbeat_min)
            .field("ack_sweep_interval", &self.ack_sweep_interval)
            .field("network_probe", &self.network_probe.is_some())
            .finish()
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Create a builder targeting `address:port`.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            config: ClientConfig {
                address: address.into(),
                port,
                ..ClientConfig::default()
            },
        }
    }

    /// Set the TCP connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the heartbeat intervals (steady / first-connect grace /
    /// degraded).
    pub fn heartbeat_intervals(mut self, long: Duration, short: Duration, min: Duration) -> Self {
        self.config.heartbeat_long = long;
        self.config.heartbeat_short = short;
        self.config.heartbeat_min = min;
        self
    }

    /// Set the ack sweep interval.
    pub fn ack_sweep_interval(mut self, interval: Duration) -> Self {
        self.config.ack_sweep_interval = interval;
        self
    }

    /// Install a network-reachability probe.
    pub fn network_probe(mut self, probe: NetworkProbe) -> Self {
        self.config.network_probe = Some(probe);
        self
    }

    /// Build the client configuration.
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// A push client session.
///
/// Dropping the handle disconnects. Must be created from within a Tokio
/// runtime.
pub struct PushClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    _shared: Arc<SessionShared>,
}

impl PushClient {
    /// Start the session: spawns the command consumer and heartbeat
    /// tasks and initiates the first connect.
    ///
    /// Connection progress is reported through `receiver`; a failed
    /// first connect is retried by the reconnect loop, not surfaced
    /// here.
    pub fn start(
        config: ClientConfig,
        receiver: Arc<dyn MsgReceiver>,
    ) -> Result<PushClient, ClientError> {
        if config.address.is_empty() || config.port == 0 {
            return Err(ClientError::InvalidAddress(format!(
                "{}:{}",
                config.address, config.port
            )));
        }
        let (cmd_tx, shared) = session::spawn(config, receiver);
        Ok(PushClient {
            cmd_tx,
            _shared: shared,
        })
    }

    /// Register this client under `name` so the server can unicast to
    /// it. The last-known name is also re-sent automatically when the
    /// server reports the connection as unregistered.
    pub fn register(&self, name: impl Into<String>) -> Result<(), ClientError> {
        self.post(Command::Register(name.into()))
    }

    /// Push a plain business payload to the server (best effort, no
    /// confirmation).
    pub fn push(&self, payload: impl Into<String>) -> Result<(), ClientError> {
        self.post(Command::Push(payload.into()))
    }

    /// Push a payload and request a delivery acknowledgement.
    ///
    /// `id` identifies the message on the wire; a UUID is generated when
    /// omitted. `ack` resolves exactly once.
    pub fn push_with_ack(
        &self,
        id: Option<String>,
        payload: impl Into<String>,
        ack: Box<dyn Ack>,
    ) -> Result<(), ClientError> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.post(Command::PushWithAck {
            id,
            payload: payload.into(),
            ack,
        })
    }

    /// Point the session at a different server address. A changed
    /// address reconnects; the same address is a no-op.
    pub fn reset_address(&self, address: impl Into<String>) -> Result<(), ClientError> {
        self.post(Command::ResetAddress(address.into()))
    }

    /// Feed an external network-reachability change into the session as
    /// a reconnect check.
    pub fn notify_network_change(&self) -> Result<(), ClientError> {
        self.post(Command::ReconnectCheck)
    }

    /// Manually disconnect. The session will not auto-reconnect and the
    /// receiver gets no disconnect callback for this stop.
    pub fn disconnect(&self) -> Result<(), ClientError> {
        self.post(Command::Disconnect)
    }

    fn post(&self, command: Command) -> Result<(), ClientError> {
        self.cmd_tx
            .send(command)
            .map_err(|_| ClientError::Shutdown)
    }
}

impl Drop for PushClient {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }
}
