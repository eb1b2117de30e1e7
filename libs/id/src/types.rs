//! Typed ID definitions.
//!
//! Each ID type has a unique prefix that identifies the record type.

use crate::define_id;

// =============================================================================
// Ingestion
// =============================================================================

define_id!(WebhookEventId, "evt");
define_id!(RequestId, "req");

// =============================================================================
// Deferred work and approvals
// =============================================================================

define_id!(JobId, "job");
define_id!(ProposalId, "prop");

// =============================================================================
// Audit
// =============================================================================

define_id!(AuditId, "aud");

// =============================================================================
// Tests
// =============================================================================
