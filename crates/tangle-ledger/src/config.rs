use std::path::Path;

use serde::{Deserialize, Serialize};

use tangle_branchdag::BranchDagConfig;

use crate::error::{LedgerError, LedgerResult};

/// Configuration for a [`Tangle`](crate::Tangle).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Capacity of per-subscriber ledger event channels.
    pub event_channel_capacity: usize,
    /// Branch DAG settings.
    pub branch_dag: BranchDagConfig,
    /// Fail snapshot loading on an output id that is already stored.
    pub reject_duplicate_snapshot_outputs: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: 1024,
            branch_dag: BranchDagConfig::default(),
            reject_duplicate_snapshot_outputs: true,
        }
    }
}

impl LedgerConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> LedgerResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| LedgerError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> LedgerResult<()> {
        if self.event_channel_capacity == 0 {
            return Err(LedgerError::InvalidConfig(
                "event_channel_capacity must be positive".into(),
            ));
        }
        if self.branch_dag.event_channel_capacity == 0 {
            return Err(LedgerError::InvalidConfig(
                "branch_dag.event_channel_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}
