//! State Management Module
//!
//! This module defines the contracts the selector consumes (ledger, authorization source,
//! state-transition processor) and the in-memory implementations used by the binary and
//! the tests. The speculative ledger is owned by the processor; everything else borrows it.

mod cache;
mod ledger;
mod processor;

pub use cache::StateCache;
pub use ledger::{
    credit_accumulated_fees, AppliedTx, AuthorizationSource, Ledger, OptionalExt, StateProcessor,
};
pub use processor::LocalProcessor;
