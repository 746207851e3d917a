//! Shared types for blobkit storage backends.
//!
//! This crate defines the [`Backend`] contract every adapter implements,
//! along with the pieces that travel across it: blob identifiers and
//! metadata, the error taxonomy, the operation context used for
//! cancellation, serializable connection info, and the retry policy.

pub mod backend;
pub mod blob;
pub mod connection;
pub mod context;
pub mod error;
pub mod retry;

pub use backend::{delete_all, for_each_blob, list_all, Backend, BlobStream};
pub use blob::{resolve_range, BlobId, BlobMetadata};
pub use connection::ConnectionInfo;
pub use context::OpContext;
pub use error::{Error, ErrorKind, Result};
pub use retry::{Decision, Disposition, Operation, RetryPolicy};
