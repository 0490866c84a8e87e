//! Hardware Capabilities
//!
//! This module defines the small capability traits the calibration engine
//! drives. Instead of talking to a specific delay stage, laser or demodulator,
//! the engine works against whatever implements:
//!
//! - [`Movable`]: a one-axis stage that moves to an absolute position and
//!   reports where it ended up
//! - [`WavelengthTunable`]: a laser that tunes to a wavelength and reports the
//!   wavelength it actually reached
//! - [`LockIn`]: a demodulator that is polled for a window of in-phase and
//!   quadrature samples
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! Instrument faults are contained by the drivers behind these traits. An
//! `Err` coming out of a capability means "this step did not happen"; the
//! caller decides whether to skip a point, a wavelength, or give up.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn peak_at<S, L>(stage: &S, lockin: &L, positions: &[f64]) -> Result<f64>
//! where
//!     S: Movable,
//!     L: LockIn,
//! {
//!     let mut best = (f64::MIN, positions[0]);
//!     for &p in positions {
//!         stage.move_abs(p).await?;
//!         let r = lockin.poll(PollRequest::default()).await?.mean_magnitude()?;
//!         if r > best.0 {
//!             best = (r, p);
//!         }
//!     }
//!     Ok(best.1)
//! }
//! ```

use crate::error::DaqError;
use anyhow::Result;
use async_trait::async_trait;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Movable
// =============================================================================

/// Capability: Motion Control
///
/// Devices that can move along one axis (delay stages, linear actuators).
///
/// Positions are in device-native units (millimetres for the delay stage).
#[async_trait]
pub trait Movable: Send + Sync {
    /// Move to absolute position and wait for the move to complete.
    ///
    /// # Returns
    /// - Ok(position) with the freshly re-queried position after the move
    /// - Err if the controller rejected the move or reported a positioner
    ///   fault; the error carries the decoded description
    async fn move_abs(&self, position: f64) -> Result<f64>;

    /// Move relative to the current (re-queried) position.
    async fn move_rel(&self, distance: f64) -> Result<f64> {
        let current = self.position().await?;
        self.move_abs(current + distance).await
    }

    /// Get current position.
    ///
    /// Always re-queries the device. Cached values may be stale after any
    /// command that could have moved the axis.
    async fn position(&self) -> Result<f64>;

    /// Stop motion immediately
    ///
    /// # Default Implementation
    /// Returns an error indicating stop is not supported.
    async fn stop(&self) -> Result<()> {
        anyhow::bail!("Stop not supported by this device")
    }
}

// =============================================================================
// WavelengthTunable
// =============================================================================

/// Capability: Wavelength Tuning
///
/// Tunable laser sources. Wavelengths are whole nanometres.
#[async_trait]
pub trait WavelengthTunable: Send + Sync {
    /// Tune to `wavelength_nm` and confirm.
    ///
    /// Returns the wavelength the instrument reports after tuning. An error
    /// means the instrument did not reach the requested wavelength.
    async fn set_wavelength(&self, wavelength_nm: u32) -> Result<u32>;

    /// Query the current wavelength.
    async fn get_wavelength(&self) -> Result<u32>;

    /// Tunable range `(min, max)` in nm, inclusive.
    fn wavelength_range(&self) -> (u32, u32) {
        (680, 1300)
    }

    /// Position of an internal axis that moves together with the wavelength
    /// (dispersion compensation), if the laser has one.
    async fn coupled_axis_position(&self) -> Result<Option<f64>> {
        Ok(None)
    }
}

// =============================================================================
// LockIn
// =============================================================================

/// Parameters of one demodulator poll.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PollRequest {
    /// How long samples are collected.
    pub duration: Duration,
    /// How long to wait for the poll to return before giving up.
    pub timeout: Duration,
    /// Demodulator filter time constant in seconds.
    pub time_constant: f64,
}

impl Default for PollRequest {
    fn default() -> Self {
        Self {
            duration: Duration::from_millis(50),
            timeout: Duration::from_millis(500),
            time_constant: 1e-3,
        }
    }
}

/// Samples returned by one demodulator poll.
///
/// `x` and `y` are the in-phase and quadrature components and always have the
/// same length. The auxiliary inputs are only present on demodulators that
/// stream them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DemodSamples {
    /// In-phase component.
    pub x: Vec<f64>,
    /// Quadrature component.
    pub y: Vec<f64>,
    /// First auxiliary input.
    pub aux0: Option<Vec<f64>>,
    /// Second auxiliary input.
    pub aux1: Option<Vec<f64>>,
}

impl DemodSamples {
    /// In-phase/quadrature samples without auxiliary data.
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> Self {
        Self {
            x,
            y,
            aux0: None,
            aux1: None,
        }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Whether the poll returned no samples.
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// `sqrt(x² + y²)` for every sample.
    pub fn magnitudes(&self) -> impl Iterator<Item = f64> + '_ {
        self.x
            .iter()
            .zip(&self.y)
            .map(|(&re, &im)| Complex64::new(re, im).norm())
    }

    /// Mean magnitude over the poll window.
    ///
    /// # Errors
    ///
    /// [`DaqError::LockIn`] if the window is empty or `x` and `y` differ in
    /// length.
    pub fn mean_magnitude(&self) -> Result<f64, DaqError> {
        if self.x.len() != self.y.len() {
            return Err(DaqError::LockIn(format!(
                "x/y length mismatch: {} vs {}",
                self.x.len(),
                self.y.len()
            )));
        }
        if self.is_empty() {
            return Err(DaqError::LockIn("poll returned no samples".into()));
        }
        Ok(self.magnitudes().sum::<f64>() / self.len() as f64)
    }
}

/// Capability: Demodulator polling
///
/// The vendor API behind this boundary (subscriptions, sample clocks) is the
/// implementor's business; the engine only sees arrays.
#[async_trait]
pub trait LockIn: Send + Sync {
    /// Collect samples for `request.duration`.
    async fn poll(&self, request: PollRequest) -> Result<DemodSamples>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_magnitude_of_quadrature_pairs() {
        let samples = DemodSamples::new(vec![3.0, 0.0], vec![4.0, 1.0]);
        assert!((samples.mean_magnitude().unwrap() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let samples = DemodSamples::new(vec![1.0, 2.0], vec![1.0]);
        assert!(matches!(samples.mean_magnitude(), Err(DaqError::LockIn(_))));
    }

    #[test]
    fn empty_poll_is_an_error() {
        assert!(DemodSamples::default().mean_magnitude().is_err());
    }

    struct Rail {
        at: parking_lot::Mutex<f64>,
    }

    #[async_trait]
    impl Movable for Rail {
        async fn move_abs(&self, position: f64) -> Result<f64> {
            *self.at.lock() = position;
            Ok(position)
        }

        async fn position(&self) -> Result<f64> {
            Ok(*self.at.lock())
        }
    }

    #[tokio::test]
    async fn move_rel_uses_fresh_position() {
        let rail = Rail {
            at: parking_lot::Mutex::new(1.5),
        };
        assert_eq!(rail.move_rel(-0.5).await.unwrap(), 1.0);
        assert!(rail.stop().await.is_err());
    }
}
