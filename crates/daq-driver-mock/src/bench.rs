//! Shared physical state for the simulated instruments.
//!
//! The stage simulator, the laser simulator and the synthetic lock-in all look
//! at one [`OpticalBench`]: moving the stage or retuning the laser changes
//! what the lock-in measures. The pump-probe overlap is modelled as a
//! Gaussian in stage position whose centre (time zero) drifts linearly with
//! wavelength.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Where the overlap peak sits and what it looks like.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeZeroModel {
    /// Wavelength at which `reference_position_mm` is time zero.
    pub reference_wavelength_nm: u32,
    /// Time-zero stage position at the reference wavelength.
    pub reference_position_mm: f64,
    /// Drift of time zero per nanometre.
    pub slope_mm_per_nm: f64,
    /// Gaussian sigma of the overlap signal in stage mm.
    pub width_mm: f64,
    /// Peak signal magnitude in volts.
    pub amplitude: f64,
    /// Magnitude far from overlap.
    pub background: f64,
    /// Per-sample noise sigma on each quadrature.
    pub noise: f64,
}

impl Default for TimeZeroModel {
    fn default() -> Self {
        Self {
            reference_wavelength_nm: 800,
            reference_position_mm: -50.0,
            slope_mm_per_nm: 0.25,
            width_mm: 0.02,
            amplitude: 1e-3,
            background: 1e-6,
            noise: 2e-6,
        }
    }
}

impl TimeZeroModel {
    /// A model whose peak is at `position_mm` for every wavelength.
    pub fn flat(position_mm: f64) -> Self {
        Self {
            reference_position_mm: position_mm,
            slope_mm_per_nm: 0.0,
            ..Self::default()
        }
    }

    /// True time-zero position at `wavelength_nm`.
    pub fn time_zero(&self, wavelength_nm: u32) -> f64 {
        let offset = f64::from(wavelength_nm) - f64::from(self.reference_wavelength_nm);
        self.reference_position_mm + self.slope_mm_per_nm * offset
    }

    /// Noise-free magnitude with the stage at `position_mm`.
    pub fn signal(&self, position_mm: f64, wavelength_nm: u32) -> f64 {
        let d = (position_mm - self.time_zero(wavelength_nm)) / self.width_mm;
        self.background + self.amplitude * (-0.5 * d * d).exp()
    }
}

#[derive(Debug, Clone, Copy)]
struct BenchState {
    stage_position_mm: f64,
    wavelength_nm: u32,
    model: TimeZeroModel,
}

/// Cloneable handle to the shared bench.
#[derive(Debug, Clone)]
pub struct OpticalBench {
    inner: Arc<RwLock<BenchState>>,
}

impl Default for OpticalBench {
    fn default() -> Self {
        Self::new(TimeZeroModel::default())
    }
}

impl OpticalBench {
    /// Stage at 0 mm, laser at the model's reference wavelength.
    pub fn new(model: TimeZeroModel) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BenchState {
                stage_position_mm: 0.0,
                wavelength_nm: model.reference_wavelength_nm,
                model,
            })),
        }
    }

    /// Current stage position.
    pub fn stage_position(&self) -> f64 {
        self.inner.read().stage_position_mm
    }

    /// Move the simulated stage.
    pub fn set_stage_position(&self, position_mm: f64) {
        self.inner.write().stage_position_mm = position_mm;
    }

    /// Current laser wavelength.
    pub fn wavelength(&self) -> u32 {
        self.inner.read().wavelength_nm
    }

    /// Retune the simulated laser.
    pub fn set_wavelength(&self, wavelength_nm: u32) {
        self.inner.write().wavelength_nm = wavelength_nm;
    }

    /// Current overlap model.
    pub fn model(&self) -> TimeZeroModel {
        self.inner.read().model
    }

    /// Replace the overlap model.
    pub fn set_model(&self, model: TimeZeroModel) {
        self.inner.write().model = model;
    }

    /// Noise-free magnitude at the current stage position and wavelength.
    pub fn signal(&self) -> f64 {
        let state = *self.inner.read();
        state
            .model
            .signal(state.stage_position_mm, state.wavelength_nm)
    }

    /// DeepSee motor position the laser settles to at `wavelength_nm`.
    pub fn dsm_position_for(wavelength_nm: u32) -> f64 {
        20.0 + 0.05 * (f64::from(wavelength_nm) - 680.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_follows_wavelength() {
        let model = TimeZeroModel::default();
        assert_eq!(model.time_zero(800), -50.0);
        assert_eq!(model.time_zero(900), -25.0);
        assert_eq!(model.time_zero(680), -80.0);
        assert_eq!(model.time_zero(1300), 75.0);

        let at_peak = model.signal(model.time_zero(900), 900);
        let off_peak = model.signal(model.time_zero(900) + 0.05, 900);
        assert!(at_peak > off_peak);
        assert!((at_peak - model.amplitude - model.background).abs() < 1e-15);
    }

    #[test]
    fn clones_share_state() {
        let bench = OpticalBench::new(TimeZeroModel::flat(3.0));
        let other = bench.clone();
        other.set_stage_position(3.0);
        other.set_wavelength(950);
        assert_eq!(bench.stage_position(), 3.0);
        assert_eq!(bench.wavelength(), 950);
        assert!(bench.signal() > 0.9e-3);
    }
}
