//! Secret types for protecting sensitive values from accidental logging.
//!
//! This module re-exports types from the [`secrecy`] crate with Brightside-specific
//! guidance. Use these types for all sensitive values like connection URLs that
//! embed credentials, API keys, and tokens.
//!
//! # Compile-Time Safety
//!
//! `SecretBox<T>` and `SecretString` implement `Debug` with redaction, so any
//! struct that derives `Debug` while holding a secret gets safe logging behavior
//! for free. Accidentally logging a secret via `{:?}` or a tracing field is not
//! possible; reading the value requires an explicit `expose_secret()` call.
//!
//! # Memory Safety
//!
//! Secrets are zeroized when dropped, so sensitive data does not linger in
//! memory after use.
//!
//! # Example
//!
//! ```rust
//! use common::secret::SecretString;
//! use secrecy::ExposeSecret;
//!
//! #[derive(Debug)]
//! struct StoreConfig {
//!     pool_size: u32,
//!     database_url: SecretString,  // Safe: Debug shows "[REDACTED]"
//! }
//!
//! let cfg = StoreConfig {
//!     pool_size: 5,
//!     database_url: SecretString::from("postgres://cc:hunter2@db/brightside"),
//! };
//!
//! // This is safe - the URL (and its embedded password) is redacted
//! println!("{:?}", cfg);
//!
//! // To access the actual value, you must explicitly call expose_secret()
//! let url: &str = cfg.database_url.expose_secret();
//! ```
//!
//! # Brightside Usage Guidelines
//!
//! Use `SecretString` for:
//! - Database connection URLs (they embed passwords)
//! - API keys and bearer tokens
//! - Webhook signing secrets
//!
//! Use `SecretBox<T>` for:
//! - Custom secret types (e.g., `SecretBox<[u8]>` for binary keys)

// Re-export the main types from secrecy
pub use secrecy::{ExposeSecret, SecretBox, SecretString};
