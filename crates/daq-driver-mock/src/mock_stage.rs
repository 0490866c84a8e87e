//! Mock delay stage on the shared [`OpticalBench`].

use anyhow::{Result, bail};
use async_trait::async_trait;
use daq_core::capabilities::Movable;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::Duration;

use crate::bench::OpticalBench;
use crate::common::MockMode;

// =============================================================================
// Configuration Structs
// =============================================================================

/// Trapezoidal velocity profile for realistic motion simulation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VelocityProfile {
    /// Maximum velocity in mm/sec
    pub max_velocity: f64,
    /// Acceleration and deceleration in mm/sec²
    pub acceleration: f64,
}

impl VelocityProfile {
    /// Travel time for `distance` mm.
    ///
    /// Trapezoidal when the stage reaches `max_velocity`, triangular otherwise.
    pub fn motion_time(&self, distance: f64) -> Duration {
        let distance = distance.abs();
        if distance == 0.0 || self.max_velocity <= 0.0 || self.acceleration <= 0.0 {
            return Duration::ZERO;
        }
        let ramp_time = self.max_velocity / self.acceleration;
        let ramp_dist = self.acceleration * ramp_time * ramp_time;
        let seconds = if ramp_dist <= distance {
            2.0 * ramp_time + (distance - ramp_dist) / self.max_velocity
        } else {
            2.0 * (distance / self.acceleration).sqrt()
        };
        Duration::from_secs_f64(seconds)
    }
}

impl Default for VelocityProfile {
    fn default() -> Self {
        // SMC100 with a 25 mm screw stage: 5 mm/s, 20 mm/s²
        Self {
            max_velocity: 5.0,
            acceleration: 20.0,
        }
    }
}

// =============================================================================
// MockStage
// =============================================================================

/// Mock delay stage.
///
/// Moves are instant in [`MockMode::Instant`] and follow the velocity profile
/// in [`MockMode::Realistic`]. Targets outside `±travel_limit` are refused the
/// way the controller refuses them.
///
/// # Example
///
/// ```rust,ignore
/// let bench = OpticalBench::default();
/// let stage = MockStage::new(bench.clone());
/// stage.move_abs(10.0).await?;
/// assert_eq!(bench.stage_position(), 10.0);
/// ```
pub struct MockStage {
    bench: OpticalBench,
    travel_limit: f64,
    profile: VelocityProfile,
    mode: MockMode,
    /// Positions whose moves are refused, for fault injection.
    refused: Mutex<Vec<f64>>,
    moves: AtomicUsize,
}

impl MockStage {
    /// Instant-mode stage with ±100 mm of travel.
    pub fn new(bench: OpticalBench) -> Self {
        Self {
            bench,
            travel_limit: 100.0,
            profile: VelocityProfile::default(),
            mode: MockMode::Instant,
            refused: Mutex::new(Vec::new()),
            moves: AtomicUsize::new(0),
        }
    }

    /// Set the operational mode.
    pub fn with_mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the symmetric travel limit.
    pub fn with_travel_limit(mut self, limit: f64) -> Self {
        self.travel_limit = limit;
        self
    }

    /// Refuse any move whose target is within 1 nm of `position`.
    pub fn refuse_move_to(&self, position: f64) {
        self.refused.lock().push(position);
    }

    /// Number of accepted moves.
    pub fn move_count(&self) -> usize {
        self.moves.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Movable for MockStage {
    async fn move_abs(&self, position: f64) -> Result<f64> {
        if !position.is_finite() || position.abs() > self.travel_limit {
            bail!("Position not moved! Command Error: Displacement out of limits.");
        }
        if self
            .refused
            .lock()
            .iter()
            .any(|p| (p - position).abs() < 1e-6)
        {
            bail!("Position not moved! Positioner Error: Following error");
        }

        let distance = position - self.bench.stage_position();
        self.mode.delay(self.profile.motion_time(distance)).await;
        self.bench.set_stage_position(position);
        self.moves.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("MockStage: moved to {position:.6} mm");
        Ok(position)
    }

    async fn position(&self) -> Result<f64> {
        Ok(self.bench.stage_position())
    }

    async fn stop(&self) -> Result<()> {
        tracing::debug!("MockStage: stop");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn moves_update_the_bench() {
        let bench = OpticalBench::default();
        let stage = MockStage::new(bench.clone());
        assert_eq!(stage.move_abs(12.5).await.unwrap(), 12.5);
        assert_eq!(bench.stage_position(), 12.5);
        assert_eq!(stage.move_rel(-2.5).await.unwrap(), 10.0);
        assert_eq!(stage.move_count(), 2);
    }

    #[tokio::test]
    async fn out_of_range_is_refused_without_moving() {
        let bench = OpticalBench::default();
        let stage = MockStage::new(bench.clone());
        let err = stage.move_abs(100.5).await.unwrap_err();
        assert!(err.to_string().contains("Displacement out of limits"));
        assert_eq!(bench.stage_position(), 0.0);
        assert!(stage.move_abs(-100.0).await.is_ok());
    }

    #[tokio::test]
    async fn injected_refusal() {
        let stage = MockStage::new(OpticalBench::default());
        stage.refuse_move_to(5.0);
        assert!(stage.move_abs(5.0).await.is_err());
        assert!(stage.move_abs(5.01).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn realistic_mode_takes_travel_time() {
        let stage = MockStage::new(OpticalBench::default()).with_mode(MockMode::Realistic);
        let start = tokio::time::Instant::now();
        stage.move_abs(10.0).await.unwrap();
        // 0.25 s ramp up, 1.75 s cruise, 0.25 s ramp down
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(2250), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(2300), "{elapsed:?}");
    }

    #[test]
    fn short_moves_are_triangular() {
        let profile = VelocityProfile::default();
        let t = profile.motion_time(0.5).as_secs_f64();
        assert!((t - 2.0 * (0.5f64 / 20.0).sqrt()).abs() < 1e-9);
        assert_eq!(profile.motion_time(0.0), Duration::ZERO);
    }
}
