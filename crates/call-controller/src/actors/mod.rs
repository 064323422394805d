//! Actor model for the call controller.
//!
//! Two actor kinds share the work:
//!
//! ```text
//! RegistryActor (singleton per instance)
//! ├── owns the roster, the user index, and the call table
//! ├── supervises N ConnectionActors via child cancellation tokens
//! └── ConnectionActor (one per WebSocket)
//!     └── owns the outbound half of its socket
//! ```
//!
//! The registry is the single writer for shared state; connection actors
//! never touch it except through messages. Delivery from registry to socket
//! is non-blocking, so one stuck client cannot stall the event stream.

pub mod connection;
pub mod messages;
pub mod metrics;
pub mod registry;

pub use connection::{ConnectionActor, ConnectionActorHandle};
pub use messages::{
    CallRequest, CallState, CallStatus, FeedbackSubmission, ParticipantState, PeerState,
    Registration, RegistryMessage, RegistryState,
};
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use registry::{RegistryActor, RegistryActorHandle, RegistrySettings};
