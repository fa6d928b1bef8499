use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::errors::{AuraError, Result};

/// Capped exponential backoff between node attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Spread each delay by ±10%
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 250,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    /// No waiting between attempts
    pub fn immediate() -> Self {
        Self {
            base_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.multiplier >= 1.0) {
            return Err(AuraError::configuration_field(
                "retry multiplier must be >= 1.0",
                "retry.multiplier",
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(AuraError::configuration_field(
                "retry base_delay_ms cannot exceed max_delay_ms",
                "retry.base_delay_ms",
            ));
        }
        Ok(())
    }

    /// Delay to wait after `failed_attempts` failures (1-based)
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(32) as i32;
        let mut delay = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        if self.jitter {
            let jitter = (fastrand::u32(..) as f64 / u32::MAX as f64) * 0.2 - 0.1;
            delay *= 1.0 + jitter;
        }
        let capped = delay.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped.round() as u64)
    }
}
