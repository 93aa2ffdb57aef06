//! One outbound client connection.
//!
//! A `Connection` owns one TCP socket: a dedicated read task decodes and
//! dispatches inbound frames, writes are serialized under an exclusive
//! per-connection lock, and teardown runs exactly once. Connections are
//! single-use; the session creates a fresh one for every (re)connect.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, warn};

use super::session::Command;
use crate::ack::AckTracker;
use crate::core::TransportError;
use crate::transport::{read_frame, write_frame, ConnectionPhase, Envelope, InnerMsg, PhaseCell};

pub(crate) struct Connection {
    /// Identity for session-side event matching: events from a stale
    /// connection must not disturb the current one.
    id: u64,
    phase: PhaseCell,
    /// Manual stop requested; the owner must not auto-reconnect.
    manual: AtomicBool,
    /// Wakes the read loop out of a blocking read during teardown.
    stop: Notify,
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Pending confirmations for ack-requested sends on this connection.
    pub(crate) acks: AckTracker,
    /// Last-known registration name, re-sent on an UNREGISTERED notice.
    name: StdMutex<String>,
    events: mpsc::UnboundedSender<Command>,
    connect_timeout: Duration,
    disconnect_reported: AtomicBool,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        events: mpsc::UnboundedSender<Command>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            id,
            phase: PhaseCell::new(),
            manual: AtomicBool::new(false),
            stop: Notify::new(),
            writer: Mutex::new(None),
            acks: AckTracker::new(),
            name: StdMutex::new(String::new()),
            events,
            connect_timeout,
            disconnect_reported: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn set_name(&self, name: &str) {
        let mut guard = self.name.lock().unwrap_or_else(|e| e.into_inner());
        *guard = name.to_owned();
    }

    fn name(&self) -> String {
        self.name.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Whether teardown has started or a manual stop was requested.
    pub(crate) fn is_finished(&self) -> bool {
        self.phase.is_finished() || self.manual.load(Ordering::SeqCst)
    }

    /// Request a manual stop. Observed by the read loop at its next
    /// iteration; the resulting disconnect carries `manual = true`.
    pub(crate) fn stop(&self) {
        self.manual.store(true, Ordering::SeqCst);
        self.stop.notify_waiters();
    }

    /// Connect and run the read loop until the stream closes.
    pub(crate) async fn run(self: std::sync::Arc<Self>, address: String, port: u16) {
        self.phase.advance(ConnectionPhase::Connecting);
        info!(%address, port, "connecting");

        let stream = match self.open_socket(&address, port).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%address, port, error = %e, "connect failed");
                self.teardown().await;
                return;
            }
        };

        let (mut reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);
        self.phase.advance(ConnectionPhase::Open);
        info!(%address, port, "connected");
        let _ = self.events.send(Command::Connected { conn_id: self.id });

        // Put traffic on the wire right away so the peer stamps liveness.
        if let Err(e) = self.send(&Envelope::heartbeat().encode()).await {
            warn!(error = %e, "initial heartbeat failed");
        }

        self.read_loop(&mut reader).await;
        self.teardown().await;
    }

    async fn open_socket(&self, address: &str, port: u16) -> Result<TcpStream, TransportError> {
        let target: SocketAddr = lookup_host((address, port))
            .await?
            .next()
            .ok_or_else(|| {
                TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no address found for {address}:{port}"),
                ))
            })?;
        let socket = if target.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true)?;
        let stream = tokio::time::timeout(self.connect_timeout, socket.connect(target))
            .await
            .map_err(|_| {
                TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                ))
            })??;
        Ok(stream)
    }

    async fn read_loop(&self, reader: &mut OwnedReadHalf) {
        loop {
            if self.is_finished() {
                break;
            }
            let frame = tokio::select! {
                _ = self.stop.notified() => break,
                frame = read_frame(reader) => frame,
            };
            match frame {
                Ok(Some(raw)) => match Envelope::parse(&raw) {
                    Ok(Some(envelope)) => self.dispatch(envelope).await,
                    Ok(None) => debug!(%raw, "ignoring unknown envelope"),
                    Err(e) => {
                        warn!(error = %e, "stream corrupt");
                        break;
                    }
                },
                Ok(None) => {
                    debug!("stream closed by peer");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "read failed");
                    break;
                }
            }
        }
    }

    async fn dispatch(&self, envelope: Envelope) {
        match envelope {
            Envelope::Biz(payload) => {
                let _ = self.events.send(Command::Received { id: None, payload });
            }
            Envelope::BizNeedAck { id, body } => {
                // Confirm receipt before handing the message on.
                if let Err(e) = self.send(&Envelope::ack(&id).encode()).await {
                    warn!(%id, error = %e, "failed to send ack");
                }
                let _ = self.events.send(Command::Received {
                    id: Some(id),
                    payload: body,
                });
            }
            Envelope::Inner(InnerMsg::Heart) => {}
            // Echo of our own registration; nothing to do.
            Envelope::Inner(InnerMsg::Regist(_)) => {}
            Envelope::Inner(InnerMsg::Ack(id)) => self.acks.resolve(&id),
            Envelope::Inner(InnerMsg::Unregistered) => {
                let name = self.name();
                if name.is_empty() {
                    debug!("unregistered notice but no name known yet");
                } else {
                    info!(%name, "re-registering after unregistered notice");
                    if let Err(e) = self.send(&Envelope::regist(&name).encode()).await {
                        warn!(error = %e, "failed to re-register");
                    }
                }
            }
        }
    }

    /// Write one frame under the exclusive write lock.
    ///
    /// Refused once the connection has finished. A write failure tears
    /// the connection down; it is reported to the caller but must not be
    /// escalated further.
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
            warn!(error = %e, "send failed, tearing connection down");
            self.teardown().await;
        }
        result
    }

    /// Close the socket and report the disconnect, both exactly once.
    async fn teardown(&self) {
        self.phase.advance(ConnectionPhase::Closing);
        if let Some(mut writer) = self.writer.lock().await.take() {
            use tokio::io::AsyncWriteExt;
            let _ = writer.shutdown().await;
        }
        self.phase.advance(ConnectionPhase::Closed);
        self.stop.notify_waiters();
        self.acks.teardown();
        if !self.disconnect_reported.swap(true, Ordering::SeqCst) {
            let manual = self.manual.load(Ordering::SeqCst);
            info!(manual, "disconnected");
            let _ = self.events.send(Command::Disconnected {
                conn_id: self.id,
                manual,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_send_refused_before_connect_and_after_stop() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(1, tx, Duration::from_millis(100)));

        // No writer yet.
        assert!(matches!(
            conn.send("1#@%x").await,
            Err(TransportError::Closed)
        ));

        conn.stop();
        assert!(conn.is_finished());
        assert!(matches!(
            conn.send("1#@%x").await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_failed_connect_reports_disconnect_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // A port that nothing listens on; connect must fail quickly.
        let conn = Arc::new(Connection::new(7, tx, Duration::from_millis(500)));
        Arc::clone(&conn).run("127.0.0.1".to_owned(), 1).await;

        match rx.recv().await {
            Some(Command::Disconnected { conn_id: 7, manual: false }) => {}
            other => panic!("expected non-manual disconnect, got {:?}", other.map(|c| format!("{c:?}"))),
        }
        assert!(rx.try_recv().is_err());
        assert!(conn.is_finished());
    }
}
