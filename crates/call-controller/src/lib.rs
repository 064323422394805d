//! Brightside Call Controller Library
//!
//! This library provides the core functionality for the Brightside
//! Call Controller - a stateful WebSocket signaling server responsible for:
//!
//! - Real-time participant presence and roster broadcasting
//! - Matching a hero (billable caller) with an uplifter for 1:1 calls
//! - The full call lifecycle: request, ring, accept, end, decline, feedback
//! - A hard ceiling on call duration (7 minutes by default)
//! - At-most-once session settlement with subscription deduction
//!
//! # Architecture
//!
//! A single-writer actor owns all live state:
//!
//! ```text
//! RegistryActor (singleton per instance)
//! ├── participant roster + user index + live call table
//! └── supervises N ConnectionActors
//!     └── ConnectionActor (one per WebSocket, owns the outbound sink)
//! ```
//!
//! # Key Design Decisions
//!
//! - **One roster entry per user**: a user who reconnects gets a fresh
//!   `ConnectionId` and the stale roster entry is evicted; the old socket
//!   keeps draining broadcasts until it drops
//! - **Postgres for settlement**: session rows settle exactly once via a
//!   status-guarded update; in-memory teardown never waits on the store
//! - **Non-blocking delivery**: frames that do not fit a client's mailbox
//!   are dropped and counted rather than stalling the registry
//!
//! # Modules
//!
//! - [`actors`] - Actor model implementation
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with client-safe reason mapping
//! - [`events`] - JSON wire protocol
//! - [`gateway`] - WebSocket upgrade handling and inbound dispatch
//! - [`observability`] - Health probes and Prometheus metrics
//! - [`settlement`] - Session settlement, deduction, and rating aggregation
//! - [`store`] - Durable store traits, Postgres backends, test doubles

pub mod actors;
pub mod config;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod observability;
pub mod settlement;
pub mod store;
