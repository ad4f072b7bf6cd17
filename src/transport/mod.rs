//! Messaging transport between masters and workers
//!
//! Layered like the rest of the system:
//! - Layer 0: servers (`InProcessServer`, HTTP via axum/reqwest)
//! - Layer 1: `TransportLayer` (peer directory host → address)
//! - Frames: JSON `Envelope`s dispatched to a `MessageHandler`

pub mod errors;
pub mod http;
pub mod in_process;
pub mod message;
pub mod transport;

pub use errors::TransportError;
pub use http::{HealthResponse, HttpMessageSender, HttpServer};
pub use in_process::{in_process_address, InProcessMessageSender, InProcessServer};
pub use message::{
    Ack, CorrelationKey, DispatchRequest, Envelope, EventType, KillRequest, Reject, RejectReason,
    ResultEvent, RunningEvent, TaskOutcome, TaskStateQuery, TaskStateReply, WireMessage,
};
pub use transport::{MessageHandler, MessageSender, Transport, TransportLayer};
