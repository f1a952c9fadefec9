use serde::{Deserialize, Serialize};

/// Configuration for the [`BranchDag`](crate::BranchDag).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchDagConfig {
    /// Capacity of per-subscriber event channels.
    pub event_channel_capacity: usize,
}

impl Default for BranchDagConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: 1024,
        }
    }
}
