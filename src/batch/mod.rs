//! Batch Construction Module
//!
//! This module builds the next batch out of pending pool transactions:
//! - TransactionGroup: One atomic bundle or one sender's bundle, validated and prunable
//! - Batch: Ranks and prunes groups to the capacity limits, produces the selection
//! - BatchOrchestrator: Runs a whole selection, grouped or streaming

mod engine;
mod group;
pub mod orchestrator;


pub use engine::Batch;
pub use group::{GroupContext, TransactionGroup};
pub use orchestrator::BatchOrchestrator;
