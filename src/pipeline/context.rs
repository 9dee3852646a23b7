//! Running capacity counters of a streaming selection

use crate::config::SelectionConfig;
use serde::Serialize;

/// On-chain and pool counters carried from one verification pass to the next
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CapacityContext {
    /// On-chain transactions in the batch, fixed and synthesized
    pub l1: usize,
    /// Pool transactions forwarded for application
    pub l2: usize,
    /// Position the next synthesized on-chain transaction takes
    pub position: usize,
}

impl CapacityContext {
    pub fn new(l1: usize, l2: usize, position: usize) -> Self {
        Self { l1, l2, position }
    }

    pub fn can_add_pool_tx(&self, config: &SelectionConfig) -> bool {
        config.can_add_pool_tx(self.l1, self.l2)
    }

    pub fn can_add_creation(&self, config: &SelectionConfig) -> bool {
        config.can_add_pool_tx_needing_creation(self.l1, self.l2)
    }

    /// Takes the next on-chain slot and returns its position
    pub fn reserve_l1(&mut self) -> usize {
        let position = self.position;
        self.position += 1;
        self.l1 += 1;
        position
    }
}
