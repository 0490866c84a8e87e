//! Laser controller: an [`InsightDriver`] plus tiered background polling.
//!
//! Three independent [`PeriodicTask`]s keep the cached status fresh:
//! - status word and fault bits every ~2 s
//! - diode temperatures, currents and humidity every ~30 s
//! - fault history every ~10 min
//!
//! Each tier only writes the driver's own cache.

use crate::insight::{InsightDriver, LaserStatus};
use anyhow::Result;
use async_trait::async_trait;
use daq_core::capabilities::WavelengthTunable;
use daq_core::periodic::PeriodicTask;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Poll periods for the three status tiers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LaserPolling {
    /// Status word and fault bits.
    pub state: Duration,
    /// Temperatures, currents, humidity.
    pub stats: Duration,
    /// Fault history buffer.
    pub history: Duration,
}

impl Default for LaserPolling {
    fn default() -> Self {
        Self {
            state: Duration::from_secs(2),
            stats: Duration::from_secs(30),
            history: Duration::from_secs(600),
        }
    }
}

/// Composition of the laser driver with its status polling.
pub struct LaserController {
    driver: Arc<InsightDriver>,
    pollers: Mutex<Vec<PeriodicTask>>,
}

impl LaserController {
    /// Wrap a connected driver. Polling is not started.
    pub fn new(driver: Arc<InsightDriver>) -> Self {
        Self {
            driver,
            pollers: Mutex::new(Vec::new()),
        }
    }

    /// The underlying driver.
    pub fn driver(&self) -> &Arc<InsightDriver> {
        &self.driver
    }

    /// Cached status.
    pub fn status(&self) -> LaserStatus {
        self.driver.status()
    }

    /// Start all three polling tiers. Restarting replaces earlier polls.
    pub fn start_polling(&self, polling: LaserPolling) {
        let state = {
            let driver = self.driver.clone();
            PeriodicTask::spawn("laser state", polling.state, move || {
                let driver = driver.clone();
                async move {
                    let previous = driver.status().active_fault;
                    match driver.check_errors().await {
                        Ok(word) => debug!(run_state = %word.run_state(), "laser state refreshed"),
                        Err(fault) => {
                            // Only log a fault once per appearance.
                            let message = fault.to_string();
                            if previous.as_deref() != Some(message.as_str()) {
                                driver
                                    .log()
                                    .failure(format!("Operation error while checking errors: {message}"));
                            }
                        }
                    }
                }
            })
        };

        let stats = {
            let driver = self.driver.clone();
            PeriodicTask::spawn("laser stats", polling.stats, move || {
                let driver = driver.clone();
                async move {
                    if let Err(e) = driver.read_diagnostics().await {
                        debug!("diagnostics refresh skipped: {}", e);
                    }
                }
            })
        };

        let history = {
            let driver = self.driver.clone();
            PeriodicTask::spawn("laser fault history", polling.history, move || {
                let driver = driver.clone();
                async move {
                    if let Ok(records) = driver.read_fault_history().await {
                        for record in records.iter().filter(|r| r.code != "000") {
                            tracing::warn!("InSight fault history: {}", record);
                        }
                    }
                }
            })
        };

        *self.pollers.lock() = vec![state, stats, history];
    }

    /// Stop all polls and wait for them to exit.
    pub async fn stop_polling(&self) {
        let tasks = std::mem::take(&mut *self.pollers.lock());
        for task in tasks {
            task.shutdown().await;
        }
    }

    /// Stop polling and close the port.
    pub async fn shutdown(&self) -> daq_core::AppResult<()> {
        self.stop_polling().await;
        self.driver.close().await
    }
}

#[async_trait]
impl WavelengthTunable for LaserController {
    #[instrument(skip(self), err)]
    async fn set_wavelength(&self, wavelength_nm: u32) -> Result<u32> {
        self.driver
            .set_wavelength(wavelength_nm)
            .await
            .into_result()?;
        Ok(self.driver.status().wavelength_nm)
    }

    async fn get_wavelength(&self) -> Result<u32> {
        Ok(self.driver.wavelength().await?)
    }

    fn wavelength_range(&self) -> (u32, u32) {
        let config = self.driver.config();
        (config.min_wavelength_nm, config.max_wavelength_nm)
    }

    async fn coupled_axis_position(&self) -> Result<Option<f64>> {
        Ok(Some(self.driver.dsm_position().await?))
    }
}
