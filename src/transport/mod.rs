//! Wire transport: frame codec, envelope grammar, connection lifecycle.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       Client session / Server registry  │
//! ├─────────────────────────────────────────┤
//! │       Envelope grammar                  │  ← this module
//! │       msgType #@% value                 │
//! ├─────────────────────────────────────────┤
//! │       Length-prefixed frames            │  ← this module
//! │       BE32 length + UTF-8 payload       │
//! ├─────────────────────────────────────────┤
//! │       TCP                               │
//! └─────────────────────────────────────────┘
//! ```

mod connection;
mod envelope;
mod frame;

pub use connection::ConnectionPhase;
pub(crate) use connection::PhaseCell;
pub use envelope::{Envelope, InnerMsg};
pub use frame::{encode, read_frame, write_frame};
