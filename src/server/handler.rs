//! One accepted server-side connection.
//!
//! Mirrors the client connection's read loop and write lock, with the
//! server's subtype handling: heartbeats stamp liveness, registrations
//! upsert the name registry, ACK frames resolve the registry's tracker.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use super::registry::Registry;
use crate::core::TransportError;
use crate::transport::{read_frame, write_frame, ConnectionPhase, Envelope, InnerMsg, PhaseCell};

pub(crate) struct ConnectionHandler {
    peer: SocketAddr,
    phase: PhaseCell,
    stopped: AtomicBool,
    teardown_started: AtomicBool,
    /// Wakes the read loop out of a blocking read during stop.
    stop_signal: Notify,
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Registered client name, if any.
    name: StdMutex<Option<String>>,
    /// When the last heartbeat (or the accept itself) was observed.
    last_heartbeat: StdMutex<Instant>,
    registry: Weak<Registry>,
}

impl ConnectionHandler {
    pub(crate) fn new(peer: SocketAddr, registry: Weak<Registry>) -> Self {
        Self {
            peer,
            phase: PhaseCell::new(),
            stopped: AtomicBool::new(false),
            teardown_started: AtomicBool::new(false),
            stop_signal: Notify::new(),
            writer: Mutex::new(None),
            name: StdMutex::new(None),
            last_heartbeat: StdMutex::new(Instant::now()),
            registry,
        }
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn name(&self) -> Option<String> {
        self.name.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        let mut guard = self.name.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(name.to_owned());
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.phase.is_finished() || self.stopped.load(Ordering::SeqCst)
    }

    /// Time since the last observed heartbeat.
    pub(crate) fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    fn touch(&self) {
        let mut guard = self.last_heartbeat.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Instant::now();
    }

    /// Wake the read loop without performing teardown; used when the
    /// owner cannot await (drop paths). The read loop completes the
    /// stop.
    pub(crate) fn wake_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_signal.notify_waiters();
    }

    /// Run the read loop for an accepted socket until it closes.
    pub(crate) async fn run(self: Arc<Self>, stream: TcpStream) {
        self.phase.advance(ConnectionPhase::Open);
        let (mut reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);
        self.touch();

        // Greet the peer so it sees traffic immediately after connect.
        if let Err(e) = self.send(&Envelope::heartbeat().encode()).await {
            warn!(peer = %self.peer, error = %e, "initial heartbeat failed");
        }

        loop {
            if self.is_finished() {
                break;
            }
            let frame = tokio::select! {
                _ = self.stop_signal.notified() => break,
                frame = read_frame(&mut reader) => frame,
            };
            match frame {
                Ok(Some(raw)) => match Envelope::parse(&raw) {
                    Ok(Some(envelope)) => self.dispatch(envelope).await,
                    Ok(None) => debug!(peer = %self.peer, %raw, "ignoring unknown envelope"),
                    Err(e) => {
                        warn!(peer = %self.peer, error = %e, "stream corrupt");
                        break;
                    }
                },
                Ok(None) => {
                    debug!(peer = %self.peer, "stream closed by peer");
                    break;
                }
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "read failed");
                    break;
                }
            }
        }
        self.stop().await;
    }

    async fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        match envelope {
            Envelope::Biz(payload) => registry.receiver().on_receive(None, &payload),
            Envelope::BizNeedAck { id, body } => {
                // Confirm receipt before handing the message on.
                if let Err(e) = self.send(&Envelope::ack(&id).encode()).await {
                    warn!(peer = %self.peer, %id, error = %e, "failed to send ack");
                }
                registry.receiver().on_receive(Some(&id), &body);
            }
            Envelope::Inner(InnerMsg::Heart) => self.touch(),
            Envelope::Inner(InnerMsg::Regist(name)) => registry.register(&name, self),
            Envelope::Inner(InnerMsg::Ack(id)) => registry.acks().resolve(&id),
            // Client-bound notice; meaningless inbound.
            Envelope::Inner(InnerMsg::Unregistered) => {}
        }
    }

    /// Write one frame under the exclusive write lock.
    ///
    /// A write failure stops the handler; the error is reported to the
    /// caller but never escalated further.
    pub(crate) async fn send(&self, payload: &str) -> Result<(), TransportError> {
        if self.is_finished() {
            return Err(TransportError::Closed);
        }
        let result = {
            let mut guard = self.writer.lock().await;
            match guard.as_mut() {
                Some(writer) => write_frame(writer, payload).await,
                None => Err(TransportError::Closed),
            }
        };
        if let Err(e) = &result {
            warn!(peer = %self.peer, error = %e, "send failed, stopping link");
            self.stop().await;
        }
        result
    }

    /// Close the socket and deregister, exactly once.
    pub(crate) async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if self.teardown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.phase.advance(ConnectionPhase::Closing);
        if let Some(mut writer) = self.writer.lock().await.take() {
            use tokio::io::AsyncWriteExt;
            let _ = writer.shutdown().await;
        }
        self.phase.advance(ConnectionPhase::Closed);
        self.stop_signal.notify_waiters();
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self);
        }
        info!(peer = %self.peer, name = ?self.name(), "link closed");
    }
}
