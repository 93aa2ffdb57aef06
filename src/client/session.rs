//! Client control loop.
//!
//! All mutating operations enter a single mpsc command queue with one
//! consumer task, so the current connection reference is never touched
//! from two tasks at once. A separate heartbeat task drives the
//! liveness/reconnect state machine and is woken early on connect and
//! disconnect events.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use super::connection::Connection;
use super::ClientConfig;
use crate::ack::{Ack, AckStatus};
use crate::core::MsgReceiver;
use crate::transport::Envelope;

/// A command for the session's single consumer task.
pub(crate) enum Command {
    Push(String),
    PushWithAck {
        id: String,
        payload: String,
        ack: Box<dyn Ack>,
    },
    Register(String),
    ResetAddress(String),
    /// Reconnect if no live connection exists; requests are coalesced by
    /// this check, so redundant ones are harmless.
    ReconnectCheck,
    Disconnect,
    /// From a connection's read task: the socket is open.
    Connected { conn_id: u64 },
    /// From a connection's teardown, exactly once per connection.
    Disconnected { conn_id: u64, manual: bool },
    /// From a connection's read task: an inbound message.
    Received {
        id: Option<String>,
        payload: String,
    },
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Push(payload) => f.debug_tuple("Push").field(payload).finish(),
            Command::PushWithAck { id, payload, .. } => f
                .debug_struct("PushWithAck")
                .field("id", id)
                .field("payload", payload)
                .finish_non_exhaustive(),
            Command::Register(name) => f.debug_tuple("Register").field(name).finish(),
            Command::ResetAddress(address) => {
                f.debug_tuple("ResetAddress").field(address).finish()
            }
            Command::ReconnectCheck => f.write_str("ReconnectCheck"),
            Command::Disconnect => f.write_str("Disconnect"),
            Command::Connected { conn_id } => f
                .debug_struct("Connected")
                .field("conn_id", conn_id)
                .finish(),
            Command::Disconnected { conn_id, manual } => f
                .debug_struct("Disconnected")
                .field("conn_id", conn_id)
                .field("manual", manual)
                .finish(),
            Command::Received { id, payload } => f
                .debug_struct("Received")
                .field("id", id)
                .field("payload", payload)
                .finish(),
        }
    }
}

/// The heartbeat interval state machine.
///
/// Holds the current probe interval and the wake signal that lets
/// connect/disconnect events shorten the current wait.
pub(crate) struct HeartbeatSchedule {
    interval_ms: AtomicU64,
    long: Duration,
    short: Duration,
    min: Duration,
    waker: Notify,
}

impl HeartbeatSchedule {
    pub(crate) fn new(long: Duration, short: Duration, min: Duration) -> Self {
        Self {
            interval_ms: AtomicU64::new(long.as_millis() as u64),
            long,
            short,
            min,
            waker: Notify::new(),
        }
    }

    pub(crate) fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::SeqCst))
    }

    pub(crate) fn short(&self) -> Duration {
        self.short
    }

    /// Steady state: back to the long interval, probe soon.
    pub(crate) fn on_connected(&self) {
        self.set(self.long);
        self.wake();
    }

    /// Back off hard only when the network itself is unreachable;
    /// otherwise retry quickly.
    pub(crate) fn on_disconnected(&self, network_reachable: bool) {
        self.set(if network_reachable { self.min } else { self.long });
        self.wake();
    }

    /// A probe failed: degrade to the minimum interval. Returns the
    /// delay the caller should sleep before requesting a reconnect.
    pub(crate) fn on_probe_failure(&self) -> Duration {
        self.set(self.min);
        self.min
    }

    pub(crate) fn wake(&self) {
        self.waker.notify_waiters();
    }

    pub(crate) async fn notified(&self) {
        self.waker.notified().await;
    }

    fn set(&self, interval: Duration) {
        self.interval_ms
            .store(interval.as_millis() as u64, Ordering::SeqCst);
    }
}

/// State shared between the consumer task, the heartbeat task, and the
/// public handle.
///
/// `current` is written only by the consumer task; the heartbeat task
/// reads it to probe.
pub(crate) struct SessionShared {
    pub(crate) current: StdMutex<Option<Arc<Connection>>>,
    pub(crate) schedule: HeartbeatSchedule,
    pub(crate) finished: AtomicBool,
}

impl SessionShared {
    fn current(&self) -> Option<Arc<Connection>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_current(&self, conn: Option<Arc<Connection>>) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = conn;
    }
}

/// The session consumer: owns address/name state and the current
/// connection, and processes commands one at a time.
struct Session {
    config: ClientConfig,
    address: String,
    name: String,
    receiver: Arc<dyn MsgReceiver>,
    shared: Arc<SessionShared>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    next_conn_id: u64,
}

/// Spawn the consumer and heartbeat tasks for one client session.
pub(crate) fn spawn(
    config: ClientConfig,
    receiver: Arc<dyn MsgReceiver>,
) -> (mpsc::UnboundedSender<Command>, Arc<SessionShared>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(SessionShared {
        current: StdMutex::new(None),
        schedule: HeartbeatSchedule::new(
            config.heartbeat_long,
            config.heartbeat_short,
            config.heartbeat_min,
        ),
        finished: AtomicBool::new(false),
    });

    let session = Session {
        address: config.address.clone(),
        config,
        name: String::new(),
        receiver,
        shared: Arc::clone(&shared),
        cmd_tx: cmd_tx.clone(),
        next_conn_id: 0,
    };
    tokio::spawn(session.run(cmd_rx));
    tokio::spawn(heartbeat_loop(Arc::clone(&shared), cmd_tx.clone()));

    // Kick off the first connect through the queue like any other
    // reconnect request.
    let _ = cmd_tx.send(Command::ReconnectCheck);

    (cmd_tx, shared)
}

impl Session {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = cmd_rx.recv().await {
            match command {
                Command::Push(payload) => self.handle_push(payload).await,
                Command::PushWithAck { id, payload, ack } => {
                    self.handle_push_with_ack(id, payload, ack).await
                }
                Command::Register(name) => self.handle_register(name).await,
                Command::ResetAddress(address) => self.handle_reset_address(address).await,
                Command::ReconnectCheck => self.handle_reconnect_check().await,
                Command::Connected { conn_id } => self.handle_connected(conn_id),
                Command::Disconnected { conn_id, manual } => {
                    self.handle_disconnected(conn_id, manual)
                }
                Command::Received { id, payload } => {
                    self.receiver.on_receive(id.as_deref(), &payload)
                }
                Command::Disconnect => {
                    info!("manual disconnect");
                    if let Some(conn) = self.shared.current() {
                        conn.stop();
                    }
                    self.shared.set_current(None);
                    break;
                }
            }
        }
        self.shared.finished.store(true, Ordering::SeqCst);
        self.shared.schedule.wake();
    }

    async fn handle_push(&self, payload: String) {
        match self.shared.current() {
            Some(conn) => {
                if let Err(e) = conn.send(&Envelope::biz(&payload).encode()).await {
                    warn!(error = %e, "push failed");
                }
            }
            None => warn!("push dropped, no active connection"),
        }
    }

    async fn handle_push_with_ack(&self, id: String, payload: String, ack: Box<dyn Ack>) {
        match self.shared.current() {
            Some(conn) if !conn.is_finished() => {
                // Register before writing so a fast server reply can
                // never race the entry.
                conn.acks.add(id.clone(), ack);
                if let Err(e) = conn.send(&Envelope::biz_need_ack(&id, &payload).encode()).await
                {
                    // Teardown has already resolved the entry as
                    // Disconnected.
                    warn!(%id, error = %e, "ack-requested push failed");
                }
            }
            _ => {
                warn!(%id, "ack-requested push without connection");
                ack.on_result(&id, AckStatus::Disconnected);
            }
        }
    }

    async fn handle_register(&mut self, name: String) {
        self.name = name.clone();
        match self.shared.current() {
            Some(conn) => {
                conn.set_name(&name);
                info!(%name, "registering");
                if let Err(e) = conn.send(&Envelope::regist(&name).encode()).await {
                    warn!(%name, error = %e, "register failed");
                }
            }
            None => warn!(%name, "register deferred, no active connection"),
        }
    }

    async fn handle_reset_address(&mut self, address: String) {
        if address == self.address {
            debug!(%address, "address unchanged");
            return;
        }
        info!(old = %self.address, new = %address, "server address reset");
        self.address = address;
        self.connect().await;
    }

    async fn handle_reconnect_check(&mut self) {
        let needs_connect = self
            .shared
            .current()
            .map_or(true, |conn| conn.is_finished());
        if needs_connect {
            self.connect().await;
        } else {
            debug!("reconnect check: connection alive");
        }
    }

    fn handle_connected(&self, conn_id: u64) {
        if self.is_current(conn_id) {
            self.shared.schedule.on_connected();
            self.receiver.on_connected();
        }
    }

    fn handle_disconnected(&self, conn_id: u64, manual: bool) {
        if self.is_current(conn_id) {
            self.shared.set_current(None);
        }
        if !manual {
            let reachable = self.network_reachable();
            self.shared.schedule.on_disconnected(reachable);
            self.receiver.on_disconnected();
        }
    }

    /// Tear down any prior connection and establish a fresh one.
    async fn connect(&mut self) {
        if let Some(old) = self.shared.current() {
            old.stop();
            self.shared.set_current(None);
        }
        if self.address.is_empty() || self.config.port == 0 {
            warn!(address = %self.address, port = self.config.port, "connect skipped, target not configured");
            return;
        }
        self.next_conn_id += 1;
        let conn = Arc::new(Connection::new(
            self.next_conn_id,
            self.cmd_tx.clone(),
            self.config.connect_timeout,
        ));
        conn.set_name(&self.name);
        conn.acks.start_sweeper(self.config.ack_sweep_interval);
        self.shared.set_current(Some(Arc::clone(&conn)));
        tokio::spawn(conn.run(self.address.clone(), self.config.port));
    }

    fn is_current(&self, conn_id: u64) -> bool {
        self.shared
            .current()
            .is_some_and(|conn| conn.id() == conn_id)
    }

    fn network_reachable(&self) -> bool {
        self.config
            .network_probe
            .as_ref()
            .map_or(true, |probe| probe())
    }
}

/// The heartbeat/reconnect loop.
///
/// Waits the current interval (woken early on connect/disconnect), then
/// probes: with no connection it grants one short grace period for an
/// in-flight connect before requesting a reconnect; with a connection it
/// sends a heartbeat frame and, on failure, degrades to the minimum
/// interval, sleeps it, and requests a reconnect.
async fn heartbeat_loop(shared: Arc<SessionShared>, cmd_tx: mpsc::UnboundedSender<Command>) {
    loop {
        let interval = shared.schedule.interval();
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shared.schedule.notified() => {}
        }
        if shared.finished.load(Ordering::SeqCst) {
            break;
        }

        let Some(conn) = shared.current() else {
            tokio::time::sleep(shared.schedule.short()).await;
            if shared.finished.load(Ordering::SeqCst) {
                break;
            }
            if shared.current().is_none() {
                debug!("still no connection, requesting reconnect");
                if cmd_tx.send(Command::ReconnectCheck).is_err() {
                    break;
                }
            }
            continue;
        };

        let healthy =
            !conn.is_finished() && conn.send(&Envelope::heartbeat().encode()).await.is_ok();
        if healthy {
            debug!("heartbeat ok");
        } else {
            let retry = shared.schedule.on_probe_failure();
            info!(retry_in = ?retry, "heartbeat failed, scheduling reconnect");
            tokio::time::sleep(retry).await;
            if cmd_tx.send(Command::ReconnectCheck).is_err() {
                break;
            }
        }
    }
    debug!("heartbeat loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> HeartbeatSchedule {
        HeartbeatSchedule::new(
            Duration::from_secs(60),
            Duration::from_secs(20),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_schedule_starts_long() {
        assert_eq!(schedule().interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_probe_failure_degrades_to_min() {
        let schedule = schedule();
        let retry = schedule.on_probe_failure();
        // The next probe must come within the minimum interval, not the
        // steady-state one.
        assert_eq!(retry, Duration::from_secs(5));
        assert_eq!(schedule.interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_connected_restores_long() {
        let schedule = schedule();
        schedule.on_probe_failure();
        schedule.on_connected();
        assert_eq!(schedule.interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_disconnected_backs_off_only_when_offline() {
        let schedule = schedule();
        schedule.on_disconnected(true);
        assert_eq!(schedule.interval(), Duration::from_secs(5));

        schedule.on_disconnected(false);
        assert_eq!(schedule.interval(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_wake_interrupts_wait() {
        let schedule = Arc::new(schedule());
        let waiter = {
            let schedule = Arc::clone(&schedule);
            tokio::spawn(async move { schedule.notified().await })
        };
        tokio::task::yield_now().await;
        schedule.wake();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wake must interrupt the wait")
            .unwrap();
    }
}
