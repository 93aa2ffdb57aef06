//! Delivery-acknowledgement tracking.
//!
//! An ack is an application-level "received" confirmation, distinct from
//! TCP-level delivery: the sender of a BIZ_NEED_ACK envelope registers a
//! callback here and the peer's ACK frame resolves it.

mod tracker;

use std::time::Duration;

use crate::core::constants::ACK_TIMEOUT;

pub use tracker::AckTracker;

/// Outcome of one ack-requested send.
///
/// Delivered to the [`Ack`] callback exactly once per registered entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    /// The peer confirmed receipt.
    Success,
    /// The connection was not available, or closed before confirmation.
    Disconnected,
    /// No confirmation arrived within the entry's timeout.
    Timeout,
    /// The entry was evicted to bound tracker memory; the outcome is
    /// unknowable.
    Unknown,
}

impl AckStatus {
    /// Numeric wire-compatible status code.
    pub fn code(self) -> i8 {
        match self {
            AckStatus::Success => 0,
            AckStatus::Disconnected => 1,
            AckStatus::Timeout => 2,
            AckStatus::Unknown => -1,
        }
    }
}

/// Delivery-confirmation callback for one ack-requested send.
///
/// Fired exactly once, from an engine task; implementations must be fast
/// and non-blocking. Closures of shape `Fn(&str, AckStatus)` implement
/// this trait with the default timeout.
pub trait Ack: Send + 'static {
    /// How long to wait for the peer's confirmation before the entry
    /// resolves as [`AckStatus::Timeout`].
    fn timeout(&self) -> Duration {
        ACK_TIMEOUT
    }

    /// The confirmation outcome for message `id`.
    fn on_result(&self, id: &str, status: AckStatus);
}

impl<F> Ack for F
where
    F: Fn(&str, AckStatus) + Send + 'static,
{
    fn on_result(&self, id: &str, status: AckStatus) {
        self(id, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(AckStatus::Success.code(), 0);
        assert_eq!(AckStatus::Disconnected.code(), 1);
        assert_eq!(AckStatus::Timeout.code(), 2);
        assert_eq!(AckStatus::Unknown.code(), -1);
    }

    #[test]
    fn test_closure_implements_ack() {
        let ack: Box<dyn Ack> = Box::new(|_: &str, _: AckStatus| {});
        assert_eq!(ack.timeout(), ACK_TIMEOUT);
    }
}
