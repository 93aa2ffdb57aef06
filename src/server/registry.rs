//! Server-side connection registry.
//!
//! Owns the listening socket and every accepted handler: an ordered
//! handler list plus a name registry for unicast, a periodic liveness
//! sweep that reaps dead links, and a re-registration sweep that prompts
//! live-but-anonymous links to register.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::handler::ConnectionHandler;
use super::ServerConfig;
use crate::ack::{Ack, AckStatus, AckTracker};
use crate::core::MsgReceiver;
use crate::transport::Envelope;

pub(crate) struct Registry {
    config: ServerConfig,
    receiver: Arc<dyn MsgReceiver>,
    /// Every live handler, in accept order.
    handlers: StdMutex<Vec<Arc<ConnectionHandler>>>,
    /// name → current handler; last registration wins.
    names: StdMutex<HashMap<String, Arc<ConnectionHandler>>>,
    /// Pending confirmations for ack-requested pushes from this server.
    acks: AckTracker,
    finished: AtomicBool,
    /// Shutdown signal for the accept and sweep loops. A watch channel
    /// so a finish racing a loop iteration is never missed.
    stop_tx: watch::Sender<bool>,
}

impl Registry {
    pub(crate) fn new(config: ServerConfig, receiver: Arc<dyn MsgReceiver>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            receiver,
            handlers: StdMutex::new(Vec::new()),
            names: StdMutex::new(HashMap::new()),
            acks: AckTracker::new(),
            finished: AtomicBool::new(false),
            stop_tx,
        }
    }

    pub(crate) fn receiver(&self) -> &Arc<dyn MsgReceiver> {
        &self.receiver
    }

    pub(crate) fn acks(&self) -> &AckTracker {
        &self.acks
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub(crate) fn handler_count(&self) -> usize {
        self.handlers().len()
    }

    /// Accept connections until finished. Bind and accept failures close
    /// the listener, wait out the rebind delay, and retry indefinitely.
    pub(crate) async fn accept_loop(
        self: Arc<Self>,
        bound_tx: watch::Sender<Option<SocketAddr>>,
    ) {
        let mut stop_rx = self.stop_tx.subscribe();
        while !self.is_finished() {
            let listener = match self.bind() {
                Ok(listener) => listener,
                Err(e) => {
                    error!(addr = %self.config.bind_addr, error = %e, "bind failed");
                    if !self.rebind_backoff().await {
                        break;
                    }
                    continue;
                }
            };
            if let Ok(addr) = listener.local_addr() {
                info!(%addr, "listening");
                let _ = bound_tx.send(Some(addr));
            }

            loop {
                let accepted = tokio::select! {
                    _ = stop_rx.wait_for(|stopped| *stopped) => return,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer),
                    Err(e) => {
                        error!(error = %e, "accept failed, re-binding");
                        break;
                    }
                }
            }

            drop(listener);
            if !self.rebind_backoff().await {
                break;
            }
        }
        debug!("accept loop stopped");
    }

    fn bind(&self) -> io::Result<TcpListener> {
        let addr = self.config.bind_addr;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(1024)
    }

    /// Wait out the rebind delay; returns `false` when finished.
    async fn rebind_backoff(&self) -> bool {
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(self.config.rebind_delay) => {}
            _ = stop_rx.wait_for(|stopped| *stopped) => {}
        }
        !self.is_finished()
    }

    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let handler = Arc::new(ConnectionHandler::new(peer, Arc::downgrade(self)));
        self.handlers_mut().push(Arc::clone(&handler));
        info!(%peer, "link accepted");
        tokio::spawn(handler.run(stream));
    }

    /// Bind `name` to `handler`; the last registration wins. A prior
    /// handler under the same name is not closed here, the liveness
    /// sweep reaps it once stale.
    pub(crate) fn register(&self, name: &str, handler: &Arc<ConnectionHandler>) {
        handler.set_name(name);
        let replaced = self
            .names_mut()
            .insert(name.to_owned(), Arc::clone(handler))
            .is_some();
        info!(%name, peer = %handler.peer(), replaced, "client registered");
    }

    /// Remove `target` from the handler list and, if it is the current
    /// holder of its name, from the name registry; an anonymous handler
    /// is searched for by value.
    pub(crate) fn unregister(&self, target: &ConnectionHandler) {
        let target_ptr: *const ConnectionHandler = target;
        self.handlers_mut()
            .retain(|h| !std::ptr::eq(Arc::as_ptr(h), target_ptr));
        let mut names = self.names_mut();
        match target.name() {
            Some(name) => {
                if names
                    .get(&name)
                    .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), target_ptr))
                {
                    names.remove(&name);
                }
            }
            None => {
                names.retain(|_, h| !std::ptr::eq(Arc::as_ptr(h), target_ptr));
            }
        }
    }

    /// Run liveness sweeps until finished.
    pub(crate) async fn sweep_loop(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.liveness_period) => {}
                _ = stop_rx.wait_for(|stopped| *stopped) => break,
            }
            if self.is_finished() {
                break;
            }
            debug!("liveness sweep");
            self.sweep_once().await;
        }
        debug!("sweep loop stopped");
    }

    /// One liveness pass: force-close finished or stale handlers and
    /// drop them from both the handler list and the name registry, then
    /// prompt unregistered survivors to register.
    pub(crate) async fn sweep_once(&self) {
        let period = self.config.liveness_period;
        for handler in self.handlers() {
            let stale = handler.heartbeat_age() > period;
            if handler.is_finished() || stale {
                info!(peer = %handler.peer(), name = ?handler.name(), stale, "reaping link");
                handler.stop().await;
                self.unregister(&handler);
            }
        }
        self.notify_unregistered().await;
    }

    /// Send an UNREGISTERED notice to every live handler with no entry
    /// under its own key, prompting re-registration.
    pub(crate) async fn notify_unregistered(&self) {
        let snapshot = self.handlers();
        if snapshot.is_empty() {
            debug!("no links, skipping registration check");
            return;
        }
        let frame = Envelope::unregistered().encode();
        for handler in snapshot {
            if handler.is_finished() {
                continue;
            }
            let registered = handler
                .name()
                .is_some_and(|name| self.names_mut().contains_key(&name));
            if !registered {
                debug!(peer = %handler.peer(), "link unregistered, prompting registration");
                let _ = handler.send(&frame).await;
            }
        }
    }

    /// Broadcast a business payload to a snapshot of live handlers.
    pub(crate) async fn push_to_all(&self, payload: &str) {
        let frame = Envelope::biz(payload).encode();
        for handler in self.handlers() {
            let _ = handler.send(&frame).await;
        }
    }

    /// Unicast a business payload. A miss performs no write; it is
    /// logged and triggers the re-registration sweep.
    pub(crate) async fn push_to(&self, name: &str, payload: &str) {
        let target = self.names_mut().get(name).cloned();
        match target {
            Some(handler) => {
                if let Err(e) = handler.send(&Envelope::biz(payload).encode()).await {
                    warn!(%name, error = %e, "push failed");
                }
            }
            None => {
                warn!(%name, "push target not registered, message dropped");
                self.notify_unregistered().await;
            }
        }
    }

    /// Unicast with a delivery acknowledgement. The tracker entry is
    /// registered before the frame is written; an unknown name resolves
    /// the ack as `Disconnected` without touching the socket.
    pub(crate) async fn push_to_with_ack(
        &self,
        name: &str,
        payload: &str,
        id: String,
        ack: Box<dyn Ack>,
    ) {
        let target = self.names_mut().get(name).cloned();
        match target {
            Some(handler) => {
                self.acks.add(id.clone(), ack);
                if let Err(e) = handler
                    .send(&Envelope::biz_need_ack(&id, payload).encode())
                    .await
                {
                    warn!(%name, %id, error = %e, "ack-requested push failed");
                }
            }
            None => {
                warn!(%name, %id, "push target not registered, resolving ack as disconnected");
                ack.on_result(&id, AckStatus::Disconnected);
                self.notify_unregistered().await;
            }
        }
    }

    /// Stop accepting, close every link, and resolve outstanding acks.
    pub(crate) async fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("server finishing");
        self.stop_tx.send_replace(true);
        let handlers = std::mem::take(&mut *self.handlers_mut());
        self.names_mut().clear();
        for handler in handlers {
            handler.stop().await;
        }
        self.acks.teardown();
    }

    /// Signal shutdown without awaiting; read loops observe their stop
    /// signals and complete the teardown. Used on drop.
    pub(crate) fn request_shutdown(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_tx.send_replace(true);
        for handler in self.handlers() {
            handler.wake_stop();
        }
    }

    fn handlers(&self) -> Vec<Arc<ConnectionHandler>> {
        self.handlers_mut().clone()
    }

    fn handlers_mut(&self) -> std::sync::MutexGuard<'_, Vec<Arc<ConnectionHandler>>> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn names_mut(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ConnectionHandler>>> {
        self.names.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    struct NullReceiver;

    impl MsgReceiver for NullReceiver {
        fn on_receive(&self, _id: Option<&str>, _payload: &str) {}
    }

    fn registry() -> Registry {
        Registry::new(ServerConfig::default(), Arc::new(NullReceiver))
    }

    fn handler(port: u16) -> Arc<ConnectionHandler> {
        Arc::new(ConnectionHandler::new(
            format!("127.0.0.1:{port}").parse().unwrap(),
            Weak::new(),
        ))
    }

    #[test]
    fn test_last_registration_wins() {
        let registry = registry();
        let first = handler(1);
        let second = handler(2);

        registry.register("a", &first);
        registry.register("a", &second);

        let current = registry.names_mut().get("a").cloned().unwrap();
        assert!(Arc::ptr_eq(&current, &second));
    }

    #[test]
    fn test_unregister_by_key_spares_a_newer_holder() {
        let registry = registry();
        let old = handler(1);
        let new = handler(2);
        registry.handlers_mut().push(Arc::clone(&old));
        registry.handlers_mut().push(Arc::clone(&new));

        registry.register("a", &old);
        registry.register("a", &new);

        // Reaping the stale handler must not drop the name's current
        // holder.
        registry.unregister(&old);
        assert_eq!(registry.handler_count(), 1);
        assert!(registry.names_mut().contains_key("a"));

        registry.unregister(&new);
        assert_eq!(registry.handler_count(), 0);
        assert!(!registry.names_mut().contains_key("a"));
    }

    #[test]
    fn test_unregister_anonymous_handler_searches_by_value() {
        let registry = registry();
        let h = handler(1);
        registry.handlers_mut().push(Arc::clone(&h));
        // Registered under a key the handler itself never learned.
        registry
            .names_mut()
            .insert("ghost".to_owned(), Arc::clone(&h));

        registry.unregister(&h);
        assert_eq!(registry.handler_count(), 0);
        assert!(!registry.names_mut().contains_key("ghost"));
    }

    #[tokio::test]
    async fn test_push_to_with_ack_miss_resolves_disconnected() {
        let registry = registry();
        let results: Arc<StdMutex<Vec<(String, AckStatus)>>> = Arc::default();
        let log = Arc::clone(&results);

        registry
            .push_to_with_ack(
                "nobody",
                "payload",
                "id1".to_owned(),
                Box::new(move |id: &str, status: AckStatus| {
                    log.lock().unwrap().push((id.to_owned(), status));
                }),
            )
            .await;

        assert_eq!(
            *results.lock().unwrap(),
            vec![("id1".to_owned(), AckStatus::Disconnected)]
        );
        assert_eq!(registry.acks().pending_count(), 0);
    }
}
