//! `pipedesk-core`: identifiers and errors shared by every pipedesk crate.
//!
//! Nothing in here performs I/O.

pub mod error;
pub mod id;

pub use error::DomainError;
pub use id::{TenantId, UserId};
