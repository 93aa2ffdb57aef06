//! Pending-acknowledgement tracker.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, info};

use super::{Ack, AckStatus};
use crate::core::constants::ACK_CAPACITY;

/// One pending confirmation.
struct Entry {
    id: String,
    created_at: Instant,
    timeout: Duration,
    ack: Box<dyn Ack>,
}

struct Inner {
    /// Access-ordered: index 0 is the least-recently-touched entry.
    ///
    /// Capacity is small and fixed, so a vector with linear search keeps
    /// insert, resolve, and eviction all trivially correct.
    entries: Vec<Entry>,
    finished: bool,
}

/// Tracks pending at-most-once delivery confirmations with timeout and
/// capacity eviction.
///
/// Each registered entry resolves exactly once with one of
/// [`AckStatus::Success`] (matching ACK received),
/// [`AckStatus::Timeout`] (swept after its timeout),
/// [`AckStatus::Unknown`] (evicted at capacity), or
/// [`AckStatus::Disconnected`] (owning connection torn down).
///
/// The internal lock is held only across map updates; callbacks always
/// fire after it is released.
pub struct AckTracker {
    inner: Arc<Mutex<Inner>>,
    capacity: usize,
    stop: Arc<Notify>,
}

impl AckTracker {
    /// Create a tracker with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(ACK_CAPACITY)
    }

    /// Create a tracker holding at most `capacity` pending entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: Vec::new(),
                finished: false,
            })),
            capacity,
            stop: Arc::new(Notify::new()),
        }
    }

    /// Register a pending confirmation for message `id`.
    ///
    /// Inserting beyond capacity evicts the least-recently-touched entry
    /// with [`AckStatus::Unknown`]. Registering an id that is already
    /// pending replaces the old entry, which also resolves `Unknown`.
    /// After [`teardown`](Self::teardown) the callback fires
    /// [`AckStatus::Disconnected`] immediately.
    pub fn add(&self, id: String, ack: Box<dyn Ack>) {
        let timeout = ack.timeout();
        let mut dropped: Vec<Entry> = Vec::new();
        {
            let mut inner = self.lock();
            if inner.finished {
                drop(inner);
                ack.on_result(&id, AckStatus::Disconnected);
                return;
            }
            if let Some(pos) = inner.entries.iter().position(|e| e.id == id) {
                dropped.push(inner.entries.remove(pos));
            }
            inner.entries.push(Entry {
                id,
                created_at: Instant::now(),
                timeout,
                ack,
            });
            while inner.entries.len() > self.capacity {
                dropped.push(inner.entries.remove(0));
            }
        }
        for entry in dropped {
            info!(id = %entry.id, "ack entry evicted, no longer awaiting confirmation");
            entry.ack.on_result(&entry.id, AckStatus::Unknown);
        }
    }

    /// Resolve a pending entry as [`AckStatus::Success`].
    ///
    /// Unknown ids are a no-op, which covers duplicate and late ACK
    /// frames.
    pub fn resolve(&self, id: &str) {
        let entry = {
            let mut inner = self.lock();
            inner
                .entries
                .iter()
                .position(|e| e.id == id)
                .map(|pos| inner.entries.remove(pos))
        };
        if let Some(entry) = entry {
            debug!(id = %entry.id, "ack confirmed");
            entry.ack.on_result(&entry.id, AckStatus::Success);
        }
    }

    /// Number of currently pending entries.
    pub fn pending_count(&self) -> usize {
        self.lock().entries.len()
    }

    /// Resolve every pending entry as [`AckStatus::Disconnected`] and
    /// refuse further registrations.
    ///
    /// Called when the owning connection closes so entries are not
    /// silently leaked until their individual timeouts.
    pub fn teardown(&self) {
        let drained = {
            let mut inner = self.lock();
            inner.finished = true;
            std::mem::take(&mut inner.entries)
        };
        self.stop.notify_waiters();
        for entry in drained {
            entry.ack.on_result(&entry.id, AckStatus::Disconnected);
        }
    }

    /// Spawn the periodic timeout sweep.
    ///
    /// Must be called from within a Tokio runtime. The task exits on
    /// [`teardown`](Self::teardown).
    pub fn start_sweeper(&self, interval: Duration) {
        let inner = Arc::clone(&self.inner);
        let stop = Arc::clone(&self.stop);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop.notified() => break,
                }
                let expired = {
                    let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
                    if guard.finished {
                        break;
                    }
                    sweep_expired(&mut guard)
                };
                for entry in expired {
                    info!(id = %entry.id, "ack entry timed out");
                    entry.ack.on_result(&entry.id, AckStatus::Timeout);
                }
            }
        });
    }

    /// Remove and resolve expired entries once; exposed for tests.
    #[cfg(test)]
    pub(crate) fn sweep_once(&self) {
        let expired = sweep_expired(&mut self.lock());
        for entry in expired {
            info!(id = %entry.id, "ack entry timed out");
            entry.ack.on_result(&entry.id, AckStatus::Timeout);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn sweep_expired(inner: &mut Inner) -> Vec<Entry> {
    let mut expired = Vec::new();
    let mut index = 0;
    while index < inner.entries.len() {
        if inner.entries[index].created_at.elapsed() >= inner.entries[index].timeout {
            expired.push(inner.entries.remove(index));
        } else {
            index += 1;
        }
    }
    expired
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every callback invocation.
    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<(String, AckStatus)>>>);

    impl Recorder {
        fn ack(&self) -> Box<dyn Ack> {
            let log = Arc::clone(&self.0);
            Box::new(move |id: &str, status: AckStatus| {
                log.lock().unwrap().push((id.to_owned(), status));
            })
        }

        fn results(&self) -> Vec<(String, AckStatus)> {
            self.0.lock().unwrap().clone()
        }
    }

    /// An ack with a caller-chosen timeout.
    struct TimedAck {
        recorder: Recorder,
        timeout: Duration,
    }

    impl Ack for TimedAck {
        fn timeout(&self) -> Duration {
            self.timeout
        }

        fn on_result(&self, id: &str, status: AckStatus) {
            self.recorder.0.lock().unwrap().push((id.to_owned(), status));
        }
    }

    #[test]
    fn test_resolve_fires_success_once() {
        let tracker = AckTracker::new();
        let recorder = Recorder::default();

        tracker.add("m1".into(), recorder.ack());
        assert_eq!(tracker.pending_count(), 1);

        tracker.resolve("m1");
        tracker.resolve("m1"); // duplicate ACK frame: no-op
        tracker.resolve("never-added"); // late/unknown ACK frame: no-op

        assert_eq!(recorder.results(), vec![("m1".into(), AckStatus::Success)]);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_capacity_eviction_fires_unknown() {
        let tracker = AckTracker::new();
        let recorder = Recorder::default();

        for i in 0..ACK_CAPACITY {
            tracker.add(format!("m{i}"), recorder.ack());
        }
        assert_eq!(tracker.pending_count(), ACK_CAPACITY);
        assert!(recorder.results().is_empty());

        // The 41st entry evicts the least-recently-touched one.
        tracker.add("m-last".into(), recorder.ack());
        assert_eq!(tracker.pending_count(), ACK_CAPACITY);
        assert_eq!(recorder.results(), vec![("m0".into(), AckStatus::Unknown)]);

        // The evicted entry can no longer resolve as Success.
        tracker.resolve("m0");
        assert_eq!(recorder.results(), vec![("m0".into(), AckStatus::Unknown)]);

        // Survivors still resolve normally.
        tracker.resolve("m1");
        assert!(recorder
            .results()
            .contains(&("m1".into(), AckStatus::Success)));
    }

    #[test]
    fn test_duplicate_id_replaces_and_resolves_old_entry() {
        let tracker = AckTracker::new();
        let recorder = Recorder::default();

        tracker.add("m1".into(), recorder.ack());
        tracker.add("m1".into(), recorder.ack());
        assert_eq!(tracker.pending_count(), 1);
        assert_eq!(recorder.results(), vec![("m1".into(), AckStatus::Unknown)]);

        tracker.resolve("m1");
        assert_eq!(
            recorder.results(),
            vec![
                ("m1".into(), AckStatus::Unknown),
                ("m1".into(), AckStatus::Success)
            ]
        );
    }

    #[test]
    fn test_sweep_times_out_only_expired_entries() {
        let tracker = AckTracker::new();
        let recorder = Recorder::default();

        tracker.add(
            "fast".into(),
            Box::new(TimedAck {
                recorder: recorder.clone(),
                timeout: Duration::ZERO,
            }),
        );
        tracker.add(
            "slow".into(),
            Box::new(TimedAck {
                recorder: recorder.clone(),
                timeout: Duration::from_secs(60),
            }),
        );

        tracker.sweep_once();
        assert_eq!(recorder.results(), vec![("fast".into(), AckStatus::Timeout)]);
        assert_eq!(tracker.pending_count(), 1);

        // A timed-out entry cannot later resolve as Success.
        tracker.resolve("fast");
        assert_eq!(recorder.results(), vec![("fast".into(), AckStatus::Timeout)]);
    }

    #[tokio::test]
    async fn test_sweeper_task_fires_timeout() {
        let tracker = AckTracker::new();
        let recorder = Recorder::default();
        tracker.start_sweeper(Duration::from_millis(20));

        tracker.add(
            "m1".into(),
            Box::new(TimedAck {
                recorder: recorder.clone(),
                timeout: Duration::from_millis(10),
            }),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.results(), vec![("m1".into(), AckStatus::Timeout)]);
        tracker.teardown();
    }

    #[test]
    fn test_teardown_resolves_remaining_as_disconnected() {
        let tracker = AckTracker::new();
        let recorder = Recorder::default();

        tracker.add("m1".into(), recorder.ack());
        tracker.add("m2".into(), recorder.ack());
        tracker.teardown();

        let mut results = recorder.results();
        results.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            results,
            vec![
                ("m1".into(), AckStatus::Disconnected),
                ("m2".into(), AckStatus::Disconnected)
            ]
        );

        // Registration after teardown resolves immediately.
        tracker.add("m3".into(), recorder.ack());
        assert!(recorder
            .results()
            .contains(&("m3".into(), AckStatus::Disconnected)));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_every_entry_resolves_exactly_once() {
        let tracker = AckTracker::with_capacity(4);
        let recorder = Recorder::default();

        for i in 0..8 {
            tracker.add(format!("m{i}"), recorder.ack());
        }
        tracker.resolve("m5");
        tracker.teardown();

        let results = recorder.results();
        assert_eq!(results.len(), 8);
        for i in 0..8 {
            let id = format!("m{i}");
            assert_eq!(
                results.iter().filter(|(rid, _)| *rid == id).count(),
                1,
                "entry {id} must resolve exactly once"
            );
        }
    }
}
