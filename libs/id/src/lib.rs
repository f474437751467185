//! # infravisor-id
//!
//! Stable ID types, parsing, and validation for infravisor.
//!
//! ## ID Format
//!
//! All IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `infra_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `ni_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! The prefix tells an infrastructure apart from a node instance at a glance,
//! and the ULID keeps IDs unique and time-ordered. IDs are opaque to clients:
//! the only supported operations are generation, parsing and formatting.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
