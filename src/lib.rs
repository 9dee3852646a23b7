//! This crate selects the contents of the next batch of a rollup payment network.
//! It groups pending pool transactions, validates them against a speculative ledger,
//! synthesizes the account creations they need and prunes the result to the batch limits.

pub mod types; // Transactions, accounts and the selection result.
pub mod error; // Rejection reasons and pass-fatal errors.
pub mod config; // Capacity limits, coordinator identity and pipeline settings.
pub mod state; // Ledger contracts and the in-memory processor.
pub mod validation; // Admission checks shared by both selection flows.
pub mod pool; // Atomic grouping and atomic pre-filters.
pub mod scheduler; // Fee ordering for streaming passes.
pub mod batch; // Transaction groups, batch pruning and the orchestrator.
pub mod pipeline; // Streaming verification pipeline.

#[cfg(test)]
mod test_utils;

// Re-export commonly used types and configurations for easier access.
pub use types::*;
pub use config::Config;
pub use error::{RejectReason, SelectionError};
pub use batch::BatchOrchestrator;
