//! High-level push server API.
//!
//! A [`PushServer`] accepts client connections, tracks registrations by
//! name, reaps dead links by heartbeat age, and exposes broadcast,
//! unicast, and ack-requested sends.

mod handler;
mod registry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use crate::ack::Ack;
use crate::core::constants::{ACK_SWEEP_INTERVAL, LIVENESS_PERIOD, REBIND_DELAY};
use crate::core::MsgReceiver;

use registry::Registry;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to. Port 0 binds an ephemeral port, observable
    /// via [`PushServer::local_addr`].
    pub bind_addr: SocketAddr,

    /// Interval between liveness sweeps; a handler whose last heartbeat
    /// is older than this is reaped.
    pub liveness_period: Duration,

    /// Delay before re-binding after a bind or accept failure.
    pub rebind_delay: Duration,

    /// Interval between ack timeout sweeps.
    pub ack_sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9320"
                .parse()
                .expect("default bind address is valid"),
            liveness_period: LIVENESS_PERIOD,
            rebind_delay: REBIND_DELAY,
            ack_sweep_interval: ACK_SWEEP_INTERVAL,
        }
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Set the liveness sweep period.
    pub fn liveness_period(mut self, period: Duration) -> Self {
        self.config.liveness_period = period;
        self
    }

    /// Set the rebind delay.
    pub fn rebind_delay(mut self, delay: Duration) -> Self {
        self.config.rebind_delay = delay;
        self
    }

    /// Set the ack sweep interval.
    pub fn ack_sweep_interval(mut self, interval: Duration) -> Self {
        self.config.ack_sweep_interval = interval;
        self
    }

    /// Build the server configuration.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

/// A push server.
///
/// Dropping the handle requests shutdown; use [`finish`](Self::finish)
/// for an orderly stop. Must be created from within a Tokio runtime.
pub struct PushServer {
    registry: Arc<Registry>,
    bound: watch::Receiver<Option<SocketAddr>>,
}

impl PushServer {
    /// Start the server: spawns the accept loop and the liveness sweep.
    ///
    /// Bind failures are logged and retried with the configured rebind
    /// delay, indefinitely; they are not surfaced here.
    pub fn start(config: ServerConfig, receiver: Arc<dyn MsgReceiver>) -> PushServer {
        let ack_sweep_interval = config.ack_sweep_interval;
        let registry = Arc::new(Registry::new(config, receiver));
        registry.acks().start_sweeper(ack_sweep_interval);

        let (bound_tx, bound_rx) = watch::channel(None);
        tokio::spawn(Arc::clone(&registry).accept_loop(bound_tx));
        tokio::spawn(Arc::clone(&registry).sweep_loop());

        PushServer {
            registry,
            bound: bound_rx,
        }
    }

    /// The bound listening address, waiting for the first successful
    /// bind. Returns `None` once the server is finished without ever
    /// having bound.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let mut bound = self.bound.clone();
        bound
            .wait_for(|addr| addr.is_some())
            .await
            .ok()
            .and_then(|addr| *addr)
    }

    /// Number of currently tracked links (registered or not).
    pub fn connection_count(&self) -> usize {
        self.registry.handler_count()
    }

    /// Broadcast a business payload to every tracked link.
    pub async fn push_to_all(&self, payload: &str) {
        self.registry.push_to_all(payload).await;
    }

    /// Unicast a business payload to the client registered under
    /// `name`. A miss performs no write; it is logged and triggers the
    /// re-registration sweep.
    pub async fn push_to(&self, name: &str, payload: &str) {
        self.registry.push_to(name, payload).await;
    }

    /// Unicast with a delivery acknowledgement.
    ///
    /// `id` identifies the message on the wire; a UUID is generated
    /// when omitted. An unregistered `name` resolves `ack` as
    /// `Disconnected` immediately. `ack` resolves exactly once.
    pub async fn push_to_with_ack(
        &self,
        name: &str,
        payload: &str,
        id: Option<String>,
        ack: Box<dyn Ack>,
    ) {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.registry.push_to_with_ack(name, payload, id, ack).await;
    }

    /// Stop accepting, close every link, and resolve outstanding acks
    /// as `Disconnected`.
    pub async fn finish(&self) {
        self.registry.finish().await;
    }
}

impl Drop for PushServer {
    fn drop(&mut self) {
        self.registry.request_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides() {
        let config = ServerConfigBuilder::new()
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .liveness_period(Duration::from_millis(250))
            .rebind_delay(Duration::from_millis(50))
            .build();
        assert_eq!(config.bind_addr.port(), 0);
        assert_eq!(config.liveness_period, Duration::from_millis(250));
        assert_eq!(config.rebind_delay, Duration::from_millis(50));
        assert_eq!(config.ack_sweep_interval, ACK_SWEEP_INTERVAL);
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.liveness_period, LIVENESS_PERIOD);
        assert_eq!(config.rebind_delay, REBIND_DELAY);
    }
}
