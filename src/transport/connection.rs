//! Connection lifecycle state.

use std::sync::Mutex;

/// Connection lifecycle phase.
///
/// Transitions are monotonic: `Idle → Connecting → Open → Closing →
/// Closed`. Once closed a connection is never reused; reconnecting
/// creates a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionPhase {
    /// Created, no socket yet.
    Idle,
    /// TCP connect in progress.
    Connecting,
    /// Established, read loop running.
    Open,
    /// Teardown started.
    Closing,
    /// Socket released; terminal.
    Closed,
}

/// Thread-safe monotonic phase cell shared between the read loop, the
/// write path, and the owner.
#[derive(Debug)]
pub(crate) struct PhaseCell(Mutex<ConnectionPhase>);

impl PhaseCell {
    pub(crate) fn new() -> Self {
        Self(Mutex::new(ConnectionPhase::Idle))
    }

    /// Advance to `next`, ignoring attempts to move backwards.
    pub(crate) fn advance(&self, next: ConnectionPhase) {
        let mut phase = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if next > *phase {
            *phase = next;
        }
    }

    pub(crate) fn get(&self) -> ConnectionPhase {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether teardown has started; sends are refused from here on.
    pub(crate) fn is_finished(&self) -> bool {
        self.get() >= ConnectionPhase::Closing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_advances_monotonically() {
        let cell = PhaseCell::new();
        assert_eq!(cell.get(), ConnectionPhase::Idle);

        cell.advance(ConnectionPhase::Connecting);
        cell.advance(ConnectionPhase::Open);
        assert_eq!(cell.get(), ConnectionPhase::Open);
        assert!(!cell.is_finished());

        // Backwards transitions are ignored.
        cell.advance(ConnectionPhase::Connecting);
        assert_eq!(cell.get(), ConnectionPhase::Open);

        cell.advance(ConnectionPhase::Closing);
        assert!(cell.is_finished());

        cell.advance(ConnectionPhase::Closed);
        cell.advance(ConnectionPhase::Open);
        assert_eq!(cell.get(), ConnectionPhase::Closed);
    }
}
