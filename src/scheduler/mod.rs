//! Transaction Scheduling Module
//!
//! Orders the pool transactions a streaming selection pass verifies:
//! - Atomic groups ranked by the average fee of their members
//! - Independent transactions ranked by fee, then sender, then nonce
//!
//! The two rankings are merged so a group is never split.

mod policies;
mod scheduler;


pub use policies::{average_fee_by_group, compare_independent};
pub use scheduler::Scheduler;
