//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection on the shared socket
//!     → mux.rs (accept loop, one task per connection)
//!     → matcher.rs (sniff prefix bytes, pick a protocol class)
//!     → connection.rs (wrap stream + sniffed prefix for replay)
//!     → listener.rs (derived listener queue for that class)
//!     → Hand off to the protocol's server
//!
//! Connection States:
//!     Accepted → Classifying → Queued → Served
//!                            ↘ Closed (unmatched + close policy, queue overflow, read error)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queues apply backpressure instead of dropping
//! - Classification never runs on the accept loop
//! - Derived listeners look like ordinary listeners to their servers

pub mod connection;
pub mod listener;
pub mod matcher;
pub mod mux;

pub use connection::{ConnectionId, MuxStream};
pub use listener::{close_unmatched, MuxListener, PeerAddr};
pub use matcher::{ProtocolClass, ProtocolMatcher, Verdict};
pub use mux::{Mux, MuxError};
