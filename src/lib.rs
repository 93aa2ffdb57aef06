//! # pushlink
//!
//! Persistent-connection push messaging over TCP: a designated server
//! and many named clients exchange framed text messages over long-lived
//! sockets, without polling. It provides:
//!
//! - **Framing**: 4-byte big-endian length prefix + UTF-8 envelope
//! - **Delivery acks**: optional per-message confirmation with timeout
//!   and capacity-bounded tracking
//! - **Liveness**: client heartbeats, server-side staleness sweeps
//! - **Recovery**: automatic reconnection with reachability-aware
//!   backoff
//!
//! Payloads are opaque text; persistence, encryption, and
//! cross-connection ordering are out of scope.
//!
//! ## Feature Flags
//!
//! - `client` (default): the [`client::PushClient`] API
//! - `server` (default): the [`server::PushServer`] API
//!
//! ## Modules
//!
//! - [`core`]: constants, error types, and capability traits
//! - [`transport`]: frame codec and envelope grammar
//! - [`ack`]: delivery-acknowledgement tracking
//! - [`client`]: outbound session with heartbeat/reconnect control loop
//! - [`server`]: connection registry with liveness sweeping
//!
//! ## Example Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use pushlink::prelude::*;
//!
//! struct Printer;
//!
//! impl MsgReceiver for Printer {
//!     fn on_receive(&self, id: Option<&str>, payload: &str) {
//!         println!("received {:?}: {}", id, payload);
//!     }
//! }
//!
//! // Server side.
//! let config = ServerConfigBuilder::new()
//!     .bind_addr("0.0.0.0:9320".parse()?)
//!     .build();
//! let server = PushServer::start(config, Arc::new(Printer));
//!
//! // Client side.
//! let config = ClientConfigBuilder::new("push.example.com", 9320).build();
//! let client = PushClient::start(config, Arc::new(Printer))?;
//! client.register("till-7")?;
//!
//! // Server-initiated unicast with delivery confirmation.
//! server
//!     .push_to_with_ack(
//!         "till-7",
//!         "order ready",
//!         None,
//!         Box::new(|id: &str, status: AckStatus| {
//!             println!("ack {}: {:?}", id, status);
//!         }),
//!     )
//!     .await;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod ack;
pub mod core;
pub mod transport;

// Client API (feature-gated)
#[cfg(feature = "client")]
pub mod client;

// Server API (feature-gated)
#[cfg(feature = "server")]
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::ack::{Ack, AckStatus, AckTracker};
    pub use crate::core::{ClientError, MsgReceiver, NetworkProbe, ProtocolError, TransportError};
    pub use crate::transport::{ConnectionPhase, Envelope, InnerMsg};

    #[cfg(feature = "client")]
    pub use crate::client::{ClientConfig, ClientConfigBuilder, PushClient};

    #[cfg(feature = "server")]
    pub use crate::server::{PushServer, ServerConfig, ServerConfigBuilder};
}

// Re-export commonly used items at crate root
pub use self::ack::{Ack, AckStatus};
pub use self::core::MsgReceiver;

#[cfg(feature = "client")]
pub use client::PushClient;

#[cfg(feature = "server")]
pub use server::PushServer;
