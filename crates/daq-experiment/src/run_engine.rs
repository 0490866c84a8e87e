//! CalibrationEngine - time-zero search across wavelengths
//!
//! The engine owns the stage, laser and lock-in for the duration of a sweep
//! and keeps the calibration map in step with its JSON store.
//!
//! # State Machine
//!
//! ```text
//!             optimize()
//! ┌──────┐ ────────────────▶ ┌──────────┐
//! │ Idle │ ◀──────────────── │ Sweeping │
//! └──────┘     done          └──────────┘
//!    │  ▲                         ▲  │
//!    │  │ done / cancelled        │  │ one wavelength
//!    ▼  │                         │  ▼
//! ┌───────────────┐ ──────────────┘
//! │ RangeScanning │ ◀──────────────
//! └───────────────┘
//! ```
//!
//! Only one sweep is in flight at a time; a second request gets
//! [`DaqError::Busy`]. Cancellation is cooperative and checked between scan
//! points and between wavelengths.
//!
//! # Usage
//!
//! ```rust,ignore
//! let engine = CalibrationEngine::open(stage, laser, lockin, store, settings, poll).await?;
//! let mut state = engine.subscribe();
//!
//! let summary = engine.calibrate("700-705").await?;
//! println!("{} calibrated, {} skipped", summary.calibrated.len(), summary.skipped.len());
//! ```

use crate::calibration::{CalibrationMap, CalibrationStore};
use crate::plans::{argmax, ScanWindow, WavelengthRange};
use daq_core::action_log::ActionLog;
use daq_core::capabilities::{LockIn, Movable, PollRequest, WavelengthTunable};
use daq_core::error::{AppResult, DaqError};
use daq_core::periodic::CancelToken;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

// =============================================================================
// Settings
// =============================================================================

/// Sweep geometry and timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    /// Positions per sweep, both ends included.
    pub points: usize,
    /// Half-width of the sweep window in mm.
    pub half_width_mm: f64,
    /// Wait after each move before polling, in milliseconds.
    pub dwell_ms: u64,
    /// Offset added to the neighbouring wavelength's entry when seeding.
    pub fallback_nudge_mm: f64,
    /// Wait after tuning before sweeping, in milliseconds.
    pub tuning_settle_ms: u64,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            points: 200,
            half_width_mm: 0.1,
            dwell_ms: 200,
            fallback_nudge_mm: 0.25,
            tuning_settle_ms: 2000,
        }
    }
}

impl OptimizerSettings {
    /// Semantic validation.
    pub fn validate(&self) -> AppResult<()> {
        if self.points == 0 {
            return Err(DaqError::Configuration(
                "optimizer needs at least one scan point".into(),
            ));
        }
        if !(self.half_width_mm.is_finite() && self.half_width_mm > 0.0) {
            return Err(DaqError::Configuration(format!(
                "optimizer half width must be positive, got {}",
                self.half_width_mm
            )));
        }
        if !self.fallback_nudge_mm.is_finite() {
            return Err(DaqError::Configuration(
                "optimizer fallback nudge must be finite".into(),
            ));
        }
        Ok(())
    }

    /// Window around `hint`.
    pub fn window(&self, hint: f64) -> ScanWindow {
        ScanWindow::new(hint, self.half_width_mm, self.points)
    }
}

// =============================================================================
// State and results
// =============================================================================

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineState {
    /// No sweep running
    Idle,
    /// Walking a wavelength range
    RangeScanning {
        /// The range being calibrated.
        range: WavelengthRange,
    },
    /// Sweeping the stage at one wavelength
    Sweeping {
        /// Wavelength being optimized.
        wavelength_nm: u32,
        /// Index of the point being measured.
        point: usize,
        /// Points in the sweep.
        points: usize,
    },
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::RangeScanning { range } => write!(f, "calibrating {range} nm"),
            EngineState::Sweeping {
                wavelength_nm,
                point,
                points,
            } => write!(f, "sweeping {wavelength_nm} nm ({}/{points})", point + 1),
        }
    }
}

/// Where a sweep's hint came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedSource {
    /// Given by the caller.
    Explicit,
    /// The existing entry for this wavelength.
    Calibrated,
    /// The entry for the previous wavelength plus the fallback nudge.
    Neighbour,
    /// The stage's current position.
    CurrentPosition,
}

/// One optimization: the measured curve and where its maximum was.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepTrace {
    /// Wavelength the sweep ran at.
    pub wavelength_nm: u32,
    /// Centre of the window.
    pub hint: f64,
    /// Where the hint came from.
    pub seed: SeedSource,
    /// Stage positions in sweep order.
    pub positions: Vec<f64>,
    /// Mean lock-in magnitude per position; `None` where the move failed.
    pub magnitudes: Vec<Option<f64>>,
    /// Index of the maximum.
    pub best_index: usize,
    /// Position of the maximum, now stored in the calibration.
    pub best_position: f64,
    /// DeepSee position recorded with it.
    pub dsm_position: Option<f64>,
}

impl SweepTrace {
    /// Measured magnitude at the maximum.
    pub fn peak_magnitude(&self) -> Option<f64> {
        self.magnitudes.get(self.best_index).copied().flatten()
    }
}

/// A wavelength the calibration moved past without a result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedWavelength {
    /// The wavelength.
    pub wavelength_nm: u32,
    /// What went wrong.
    pub reason: String,
}

/// Outcome of [`CalibrationEngine::calibrate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationSummary {
    /// Requested range.
    pub range: WavelengthRange,
    /// Successful sweeps in wavelength order.
    pub calibrated: Vec<SweepTrace>,
    /// Wavelengths that produced no entry.
    pub skipped: Vec<SkippedWavelength>,
    /// True when the run stopped on request before the end of the range.
    pub cancelled: bool,
}

// =============================================================================
// Engine
// =============================================================================

/// Releases the single-sweep claim and returns the engine to idle.
struct SweepClaim<'a> {
    engine: &'a CalibrationEngine,
}

impl Drop for SweepClaim<'_> {
    fn drop(&mut self) {
        *self.engine.active.lock() = None;
        self.engine.state_tx.send_replace(EngineState::Idle);
        self.engine.busy.store(false, Ordering::Release);
    }
}

/// The calibration engine orchestrates stage, laser and lock-in.
pub struct CalibrationEngine {
    stage: Arc<dyn Movable>,
    laser: Arc<dyn WavelengthTunable>,
    lockin: Arc<dyn LockIn>,
    store: CalibrationStore,
    calibration: RwLock<CalibrationMap>,
    settings: OptimizerSettings,
    poll: PollRequest,
    state_tx: watch::Sender<EngineState>,
    busy: AtomicBool,
    active: Mutex<Option<CancelToken>>,
    log: ActionLog,
}

impl CalibrationEngine {
    /// Load the calibration from `store` and wire the instruments.
    ///
    /// # Errors
    /// [`DaqError::Configuration`] for invalid settings, [`DaqError::Storage`]
    /// when an existing calibration file cannot be read.
    pub async fn open(
        stage: Arc<dyn Movable>,
        laser: Arc<dyn WavelengthTunable>,
        lockin: Arc<dyn LockIn>,
        store: CalibrationStore,
        settings: OptimizerSettings,
        poll: PollRequest,
    ) -> AppResult<Self> {
        settings.validate()?;
        let calibration = store.load().await?;
        info!(
            entries = calibration.len(),
            path = %store.path().display(),
            "Calibration engine ready"
        );
        let (state_tx, _) = watch::channel(EngineState::Idle);
        Ok(Self {
            stage,
            laser,
            lockin,
            store,
            calibration: RwLock::new(calibration),
            settings,
            poll,
            state_tx,
            busy: AtomicBool::new(false),
            active: Mutex::new(None),
            log: ActionLog::new("Experiment"),
        })
    }

    /// Watch engine state transitions.
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_tx.borrow()
    }

    /// Snapshot of the calibration map.
    pub fn calibration(&self) -> CalibrationMap {
        self.calibration.read().clone()
    }

    /// Sweep settings.
    pub fn settings(&self) -> &OptimizerSettings {
        &self.settings
    }

    /// Experiment log: results, skips and bootstraps.
    pub fn log(&self) -> &ActionLog {
        &self.log
    }

    /// Ask the running sweep, if any, to stop at the next check.
    pub fn cancel(&self) {
        if let Some(token) = self.active.lock().as_ref() {
            info!("Cancellation requested");
            token.cancel();
        }
    }

    fn claim(&self) -> AppResult<(SweepClaim<'_>, CancelToken)> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DaqError::Busy("Calibration engine".into()));
        }
        let token = CancelToken::new();
        *self.active.lock() = Some(token.clone());
        Ok((SweepClaim { engine: self }, token))
    }

    /// Sweep the stage around `hint` at the laser's current wavelength.
    ///
    /// Without a hint the seed rule picks one: this wavelength's entry, else
    /// the previous wavelength's entry plus the nudge, else the current stage
    /// position.
    #[instrument(skip(self), err)]
    pub async fn optimize(&self, hint: Option<f64>) -> AppResult<SweepTrace> {
        let (_claim, token) = self.claim()?;
        let wavelength = self
            .laser
            .get_wavelength()
            .await
            .map_err(|e| DaqError::Instrument(format!("Wavelength unknown: {e:#}")))?;
        let (hint, seed) = match hint {
            Some(h) => (h, SeedSource::Explicit),
            None => self.seed(wavelength).await?,
        };
        self.sweep(wavelength, hint, seed, &token).await
    }

    /// Calibrate every wavelength of `range` ("min-max", inclusive).
    ///
    /// Tuning failures and lock-in errors skip the wavelength; the run
    /// continues with the next one.
    #[instrument(skip(self), err)]
    pub async fn calibrate(&self, range: &str) -> AppResult<CalibrationSummary> {
        let range: WavelengthRange = range.parse()?;
        let (_claim, token) = self.claim()?;
        self.state_tx.send_replace(EngineState::RangeScanning { range });
        self.log.success(format!("Calibration of {range} nm started"));

        let mut summary = CalibrationSummary {
            range,
            calibrated: Vec::new(),
            skipped: Vec::new(),
            cancelled: false,
        };

        for wavelength in range.iter() {
            if token.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            self.state_tx.send_replace(EngineState::RangeScanning { range });

            match self.calibrate_one(wavelength, &token).await {
                Ok(trace) => summary.calibrated.push(trace),
                Err(DaqError::Cancelled) => {
                    summary.cancelled = true;
                    break;
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.log
                        .failure(format!("Skipping {wavelength} nm: {reason}"));
                    summary.skipped.push(SkippedWavelength {
                        wavelength_nm: wavelength,
                        reason,
                    });
                }
            }
        }

        let verdict = if summary.cancelled {
            "cancelled"
        } else {
            "finished"
        };
        self.log.success(format!(
            "Calibration of {range} nm {verdict}: {} calibrated, {} skipped",
            summary.calibrated.len(),
            summary.skipped.len()
        ));
        Ok(summary)
    }

    async fn calibrate_one(&self, wavelength: u32, token: &CancelToken) -> AppResult<SweepTrace> {
        let reached = self
            .laser
            .set_wavelength(wavelength)
            .await
            .map_err(|e| DaqError::Instrument(format!("{e:#}")))?;
        if reached != wavelength {
            return Err(DaqError::Instrument(format!(
                "Laser reports {reached} nm after tuning to {wavelength} nm"
            )));
        }

        let settle = Duration::from_millis(self.settings.tuning_settle_ms);
        tokio::select! {
            _ = tokio::time::sleep(settle) => {}
            _ = token.cancelled() => return Err(DaqError::Cancelled),
        }

        let (hint, seed) = self.seed(wavelength).await?;
        self.sweep(wavelength, hint, seed, token).await
    }

    /// Exact entry, else previous wavelength + nudge, else where the stage is.
    async fn seed(&self, wavelength: u32) -> AppResult<(f64, SeedSource)> {
        let (exact, previous) = {
            let map = self.calibration.read();
            let previous = wavelength
                .checked_sub(1)
                .and_then(|w| map.stage_position(w));
            (map.stage_position(wavelength), previous)
        };
        if let Some(position) = exact {
            return Ok((position, SeedSource::Calibrated));
        }
        if let Some(position) = previous {
            return Ok((position + self.settings.fallback_nudge_mm, SeedSource::Neighbour));
        }

        let position = self
            .stage
            .position()
            .await
            .map_err(|e| DaqError::Instrument(format!("Stage position unknown: {e:#}")))?;
        self.log.success(format!(
            "No calibration near {wavelength} nm, bootstrapping from stage position {position}"
        ));
        Ok((position, SeedSource::CurrentPosition))
    }

    async fn sweep(
        &self,
        wavelength: u32,
        hint: f64,
        seed: SeedSource,
        token: &CancelToken,
    ) -> AppResult<SweepTrace> {
        let window = self.settings.window(hint);
        let positions = window.positions();
        let dwell = Duration::from_millis(self.settings.dwell_ms);
        info!(
            wavelength,
            hint,
            ?seed,
            start = window.start(),
            stop = window.stop(),
            "Optimizing time zero"
        );

        if let Err(e) = self.stage.move_abs(window.start()).await {
            warn!("Move to scan start failed: {:#}", e);
        }

        let mut magnitudes = Vec::with_capacity(positions.len());
        for (point, &position) in positions.iter().enumerate() {
            if token.is_cancelled() {
                info!(wavelength, point, "Sweep cancelled");
                return Err(DaqError::Cancelled);
            }
            self.state_tx.send_replace(EngineState::Sweeping {
                wavelength_nm: wavelength,
                point,
                points: positions.len(),
            });

            if let Err(e) = self.stage.move_abs(position).await {
                warn!(position, "Skipping scan point: {:#}", e);
                magnitudes.push(None);
                continue;
            }
            tokio::time::sleep(dwell).await;

            let samples = self
                .lockin
                .poll(self.poll)
                .await
                .map_err(|e| DaqError::LockIn(format!("{e:#}")))?;
            let magnitude = samples.mean_magnitude()?;
            debug!(position, magnitude, "scan point");
            magnitudes.push(Some(magnitude));
        }

        let measured: Vec<f64> = magnitudes
            .iter()
            .map(|m| m.unwrap_or(f64::NAN))
            .collect();
        let best_index = argmax(&measured).ok_or_else(|| {
            DaqError::Instrument(format!("No scan point could be measured at {wavelength} nm"))
        })?;
        let best_position = positions[best_index];

        let dsm_position = match self.laser.coupled_axis_position().await {
            Ok(position) => position,
            Err(e) => {
                warn!("DeepSee position unavailable: {:#}", e);
                None
            }
        };

        let snapshot = {
            let mut map = self.calibration.write();
            map.record(wavelength, best_position, dsm_position);
            map.clone()
        };
        self.store.save(&snapshot).await?;

        if let Err(e) = self.stage.move_abs(best_position).await {
            warn!("Move to signal maximum failed: {:#}", e);
        }

        self.log.success(format!(
            "Signal maximum for {wavelength} nm found at {best_position}.  Calibration updated."
        ));

        Ok(SweepTrace {
            wavelength_nm: wavelength,
            hint,
            seed,
            positions,
            magnitudes,
            best_index,
            best_position,
            dsm_position,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let settings = OptimizerSettings::default();
        settings.validate().unwrap();
        let window = settings.window(12.0);
        assert_eq!(window.points, 200);
        assert!((window.start() - 11.9).abs() < 1e-12);
    }

    #[test]
    fn invalid_settings_are_configuration_errors() {
        for settings in [
            OptimizerSettings {
                points: 0,
                ..Default::default()
            },
            OptimizerSettings {
                half_width_mm: 0.0,
                ..Default::default()
            },
            OptimizerSettings {
                fallback_nudge_mm: f64::NAN,
                ..Default::default()
            },
        ] {
            assert!(matches!(settings.validate(), Err(DaqError::Configuration(_))));
        }
    }

    #[test]
    fn state_display() {
        assert_eq!(EngineState::Idle.to_string(), "idle");
        let range = WavelengthRange::new(700, 705).unwrap();
        assert_eq!(
            EngineState::RangeScanning { range }.to_string(),
            "calibrating 700-705 nm"
        );
        assert_eq!(
            EngineState::Sweeping {
                wavelength_nm: 701,
                point: 0,
                points: 200
            }
            .to_string(),
            "sweeping 701 nm (1/200)"
        );
    }
}
