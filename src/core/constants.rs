//! Protocol constants.
//!
//! Wire-level values are fixed by the protocol and MUST NOT be changed;
//! timing values are the defaults used by the client and server
//! configuration types.

use std::time::Duration;

// =============================================================================
// ENVELOPE GRAMMAR
// =============================================================================

/// Plain business payload, no delivery confirmation.
pub const MSG_TYPE_BIZ: &str = "1";

/// Control-plane envelope (heartbeat, registration, ack, unregistered-notice).
pub const MSG_TYPE_INNER: &str = "2";

/// Business payload requiring an application-level acknowledgement frame.
pub const MSG_TYPE_BIZ_NEED_ACK: &str = "3";

/// INNER subtype: bind a client name to the current connection.
///
/// The literal collides with [`MSG_TYPE_BIZ_NEED_ACK`]; subtype codes are
/// only ever parsed inside an already-dispatched INNER envelope, so the
/// overlap is unambiguous on the wire. Kept verbatim for compatibility.
pub const KEY_REGIST: &str = "3";

/// INNER subtype: liveness probe.
pub const KEY_HEART: &str = "4";

/// INNER subtype: delivery acknowledgement for a BIZ_NEED_ACK message.
pub const KEY_ACK: &str = "5";

/// INNER subtype: server notice that this connection carries no registration.
pub const KEY_UNREGISTERED: &str = "6";

/// Fixed delimiter between envelope fields.
pub const DELIMITER: &str = "#@%";

// =============================================================================
// FRAMING
// =============================================================================

/// Length-prefix size in bytes (big-endian u32).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Length prefixes at or above this value are treated as corrupt and
/// surfaced as a bare heartbeat instead of being allocated or read.
pub const MAX_FRAME_LEN: usize = 10_000_000;

// =============================================================================
// TIMING DEFAULTS - CLIENT
// =============================================================================

/// TCP connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Heartbeat interval in steady state.
pub const HEARTBEAT_LONG: Duration = Duration::from_secs(60);

/// Extra wait granted to an in-flight first connect before a reconnect
/// is requested.
pub const HEARTBEAT_SHORT: Duration = Duration::from_secs(20);

/// Heartbeat interval while degraded (probe failed, retrying).
pub const HEARTBEAT_MIN: Duration = Duration::from_secs(5);

// =============================================================================
// TIMING DEFAULTS - ACK TRACKING
// =============================================================================

/// Maximum number of concurrently pending ack entries per tracker.
pub const ACK_CAPACITY: usize = 40;

/// Default per-ack delivery-confirmation timeout.
pub const ACK_TIMEOUT: Duration = Duration::from_millis(5000);

/// Interval between ack timeout sweeps.
pub const ACK_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

// =============================================================================
// TIMING DEFAULTS - SERVER
// =============================================================================

/// Interval between liveness sweeps; also the staleness threshold a
/// handler's last heartbeat is measured against.
pub const LIVENESS_PERIOD: Duration = Duration::from_secs(6 * 60);

/// Delay before re-binding the listening socket after a bind or
/// accept-loop failure.
pub const REBIND_DELAY: Duration = Duration::from_secs(10);
