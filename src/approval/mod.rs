//! Human-approval workflow.
//!
//! A gated dispatch becomes a durable approval record with its own
//! lifecycle: pending until a human approves or rejects, with a
//! compare-and-swap in the store as the single linearization point for
//! racing decisions. Approval triggers a simplified spawn; a failed
//! spawn leaves the record retry-eligible.

mod handlers;
mod record;
mod service;

pub use handlers::{ApprovalCommand, CommandHandler, ReactionEvent, ReactionHandler};
pub use record::{ApprovalRecord, ApprovalRequest, ApprovalStatus};
pub use service::{ApprovalOutcome, ApprovalService};

/// Emoji accepted by the reaction handler.
pub const APPROVE_EMOJI: &str = "✅";
pub const REJECT_EMOJI: &str = "❌";
