//! Stage controller: a [`DelayStage`] plus its background status poll.
//!
//! The controller owns the poll task and exposes the stage through the
//! [`Movable`] capability. Status polling only refreshes the stage's own
//! cached state; operations that need a fresh position re-query.

use crate::delay_stage::{DelayStage, StageStatus};
use anyhow::Result;
use async_trait::async_trait;
use daq_core::capabilities::Movable;
use daq_core::periodic::PeriodicTask;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Composition of a delay stage with its status polling.
pub struct StageController {
    stage: Arc<DelayStage>,
    poller: Mutex<Option<PeriodicTask>>,
}

impl StageController {
    /// Wrap a connected stage. Polling is not started.
    pub fn new(stage: Arc<DelayStage>) -> Self {
        Self {
            stage,
            poller: Mutex::new(None),
        }
    }

    /// The underlying driver.
    pub fn stage(&self) -> &Arc<DelayStage> {
        &self.stage
    }

    /// Cached status.
    pub fn status(&self) -> StageStatus {
        self.stage.status()
    }

    /// Start refreshing the controller state every `period`.
    ///
    /// Restarting replaces the previous poll.
    pub fn start_polling(&self, period: Duration) {
        let stage = self.stage.clone();
        let task = PeriodicTask::spawn("delay stage status", period, move || {
            let stage = stage.clone();
            async move {
                // Failures are already logged by the driver.
                if let Ok(reply) = stage.query_state().await {
                    debug!(
                        state = %reply.state_code,
                        error_mask = reply.error_mask,
                        "stage status refreshed"
                    );
                }
            }
        });
        *self.poller.lock() = Some(task);
    }

    /// Stop the status poll and wait for it to exit.
    pub async fn stop_polling(&self) {
        let task = self.poller.lock().take();
        if let Some(task) = task {
            task.shutdown().await;
        }
    }

    /// Stop polling and close the port.
    pub async fn shutdown(&self) -> daq_core::AppResult<()> {
        self.stop_polling().await;
        self.stage.close().await
    }
}

#[async_trait]
impl Movable for StageController {
    #[instrument(skip(self), err)]
    async fn move_abs(&self, position: f64) -> Result<f64> {
        self.stage.move_absolute(position).await.into_result()?;
        Ok(self.stage.status().position)
    }

    async fn move_rel(&self, distance: f64) -> Result<f64> {
        self.stage.move_relative(distance).await.into_result()?;
        Ok(self.stage.status().position)
    }

    async fn position(&self) -> Result<f64> {
        Ok(self.stage.position().await?)
    }

    async fn stop(&self) -> Result<()> {
        self.stage.stop_motion().await.into_result()?;
        Ok(())
    }
}
