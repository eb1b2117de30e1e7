//! # lotacao-id
//!
//! Typed IDs for records the ingestion service creates itself.
//!
//! All IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `job_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `evt_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `prop_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! Identifiers that come from the HR system or from the staffing plan
//! (employee, role, cost center, position, plan) are opaque strings owned by
//! those systems and are not modelled here.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
