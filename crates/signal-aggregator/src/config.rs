use consensus_core::{ConsensusError, SuccessThreshold};
use serde::{Deserialize, Serialize};

/// Parameters of the consensus computation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Trailing window, in days counted back from the as-of date, for the
    /// "recent" cohort.
    pub recent_window_days: i64,
    pub success_threshold: SuccessThreshold,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            recent_window_days: 21,
            success_threshold: SuccessThreshold::Fixed(50.0),
        }
    }
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<(), ConsensusError> {
        if self.recent_window_days < 0 {
            return Err(ConsensusError::InvalidConfig(format!(
                "recent_window_days must be >= 0, got {}",
                self.recent_window_days
            )));
        }
        Ok(())
    }
}
