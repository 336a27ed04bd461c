//! Client-side correlation core for multiplexed RPC connections.
//!
//! This library implements the per-call half of request/response correlation:
//! a [`CallSubject`] represents one outstanding call on a shared connection
//! and defines how that call waits for, buffers, and consumes its reply(ies).
//! Routing a reply frame to the right subject is the job of an external
//! call-id registry; this crate only defines the subject's lifecycle and the
//! contract the registry and transport must honor.
//!
//! # Architecture
//!
//! The call-issuing layer constructs a subject with two closures: a send
//! continuation that frames and writes onto the connection, and a release
//! callback that removes the subject from the registry. The transport's
//! dispatch loop calls [`CallSubject::deliver`] for each correlated inbound
//! reply and [`CallSubject::disconnect`] for every still-open subject when
//! the connection dies. The awaiting side uses one of the accessor methods
//! ([`CallSubject::ack_then_close`] and friends) to consume replies.
//!
//! A reply that arrives before anyone is waiting is parked in a single
//! buffer slot and replayed to the next listener, so the usual "response
//! beat the awaiter" race is handled inside the subject.
//!
//! # Resource contract
//!
//! Every subject must reach a terminal state (a closing accessor outcome or
//! a disconnect) exactly once; that is the single point where the release
//! callback runs and the registry entry is reclaimed. A caller that stops
//! awaiting without disconnecting leaks its registry slot — compose timeouts
//! externally and disconnect on expiry.

mod error;
mod macros;
mod message;
mod subject;

// Re-export main types
pub use error::{Error, Result};
pub use message::{Kind, Reply, ACK};
pub use subject::{CallSubject, Listen};

pub(crate) use macros::{log_debug, log_error, log_warn};
