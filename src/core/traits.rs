//! Capability interfaces between the connection engine and the embedding
//! application.

use std::sync::Arc;

/// Receiver of connection lifecycle and message events.
///
/// Implementations are invoked from the engine's internal tasks and must
/// be fast and non-blocking; hand heavy work off to the application's own
/// executor.
pub trait MsgReceiver: Send + Sync + 'static {
    /// The connection has been established.
    fn on_connected(&self) {}

    /// The connection has been lost (not reported for manual disconnects).
    fn on_disconnected(&self) {}

    /// A message arrived. `id` is `Some` when the sender requested an
    /// acknowledgement (the engine has already sent the ACK frame).
    fn on_receive(&self, id: Option<&str>, payload: &str);
}

/// Network-reachability probe consumed by the reconnect logic.
///
/// Returns `true` when the network is believed reachable. When no probe
/// is configured the client assumes reachability.
pub type NetworkProbe = Arc<dyn Fn() -> bool + Send + Sync>;
