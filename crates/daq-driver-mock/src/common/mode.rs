//! Operational modes for mock devices.
//!
//! - **Instant**: Zero delays, deterministic behavior for unit tests
//! - **Realistic**: Hardware-like timing for simulation runs

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Operational modes for mock devices
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MockMode {
    /// Zero delays, deterministic - for unit tests
    #[default]
    Instant,
    /// Hardware-like timing - for simulated experiment runs
    Realistic,
}

impl MockMode {
    /// Sleep for `duration` unless in instant mode.
    pub async fn delay(&self, duration: Duration) {
        if *self == MockMode::Realistic && !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}
