//! Synthetic lock-in amplifier.
//!
//! Polls return demodulated X/Y samples whose magnitude is the bench's
//! overlap signal at the current stage position and wavelength, rotated by a
//! fixed phase, plus seeded Gaussian noise on each quadrature. A longer time
//! constant lowers the noise as `sqrt(1 ms / tc)`.
//!
//! # Example
//!
//! ```rust,ignore
//! use daq_driver_mock::{MockLockIn, OpticalBench};
//!
//! let lockin = MockLockIn::new(OpticalBench::default()).with_seed(7);
//! let samples = lockin.poll(PollRequest::default()).await?;
//! let r = samples.mean_magnitude()?;
//! ```

use crate::bench::OpticalBench;
use crate::common::{MockMode, MockRng};
use anyhow::Result;
use async_trait::async_trait;
use daq_core::capabilities::{DemodSamples, LockIn, PollRequest};
use daq_core::error::DaqError;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Demodulator output rate used to size each poll.
pub const DEFAULT_SAMPLE_RATE_HZ: f64 = 1_717.0;

/// Synthetic demodulator reading the shared bench.
pub struct MockLockIn {
    bench: OpticalBench,
    rng: MockRng,
    mode: MockMode,
    sample_rate_hz: f64,
    phase: f64,
    silent_at: Mutex<BTreeSet<u32>>,
    polls: AtomicUsize,
}

impl MockLockIn {
    /// Instant-mode lock-in with an OS-seeded noise source.
    pub fn new(bench: OpticalBench) -> Self {
        Self {
            bench,
            rng: MockRng::new(None),
            mode: MockMode::Instant,
            sample_rate_hz: DEFAULT_SAMPLE_RATE_HZ,
            phase: 0.3,
            silent_at: Mutex::new(BTreeSet::new()),
            polls: AtomicUsize::new(0),
        }
    }

    /// Fix the noise seed for reproducible sweeps.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = MockRng::new(Some(seed));
        self
    }

    /// Set the operational mode. Realistic polls take `request.duration`.
    pub fn with_mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Deliver no data while the laser is at `wavelength_nm`.
    pub fn go_silent_at(&self, wavelength_nm: u32) {
        self.silent_at.lock().insert(wavelength_nm);
    }

    /// Number of polls answered.
    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LockIn for MockLockIn {
    async fn poll(&self, request: PollRequest) -> Result<DemodSamples> {
        if self.silent_at.lock().contains(&self.bench.wavelength()) {
            self.mode.delay(request.timeout).await;
            return Err(DaqError::Timeout {
                operation: "lock-in poll".to_string(),
                millis: u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX),
            }
            .into());
        }

        self.mode.delay(request.duration).await;

        let count = ((request.duration.as_secs_f64() * self.sample_rate_hz).round() as usize).max(1);
        let tc = if request.time_constant > 0.0 {
            request.time_constant
        } else {
            1e-3
        };
        let sigma = self.bench.model().noise * (1e-3 / tc).sqrt();
        let magnitude = self.bench.signal();
        let (sin, cos) = self.phase.sin_cos();

        let mut x = Vec::with_capacity(count);
        let mut y = Vec::with_capacity(count);
        for _ in 0..count {
            x.push(magnitude * cos + self.rng.gaussian(sigma));
            y.push(magnitude * sin + self.rng.gaussian(sigma));
        }
        self.polls.fetch_add(1, Ordering::Relaxed);
        Ok(DemodSamples::new(x, y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::TimeZeroModel;
    use std::time::Duration;

    #[tokio::test]
    async fn magnitude_tracks_overlap() {
        let bench = OpticalBench::new(TimeZeroModel::flat(5.0));
        let lockin = MockLockIn::new(bench.clone()).with_seed(1);

        bench.set_stage_position(5.0);
        let on_peak = lockin.poll(PollRequest::default()).await.unwrap();
        bench.set_stage_position(5.2);
        let off_peak = lockin.poll(PollRequest::default()).await.unwrap();

        let r_on = on_peak.mean_magnitude().unwrap();
        let r_off = off_peak.mean_magnitude().unwrap();
        assert!((r_on - 1e-3).abs() < 5e-5, "{r_on}");
        assert!(r_off < 1e-4, "{r_off}");
        assert_eq!(lockin.poll_count(), 2);
    }

    #[tokio::test]
    async fn sample_count_follows_duration() {
        let lockin = MockLockIn::new(OpticalBench::default()).with_seed(1);
        let samples = lockin
            .poll(PollRequest {
                duration: Duration::from_millis(100),
                ..PollRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(samples.len(), 172);
        assert_eq!(samples.x.len(), samples.y.len());
    }

    #[tokio::test]
    async fn same_seed_same_samples() {
        let a = MockLockIn::new(OpticalBench::default()).with_seed(9);
        let b = MockLockIn::new(OpticalBench::default()).with_seed(9);
        let sa = a.poll(PollRequest::default()).await.unwrap();
        let sb = b.poll(PollRequest::default()).await.unwrap();
        assert_eq!(sa, sb);
    }

    #[tokio::test]
    async fn silent_wavelength_times_out() {
        let bench = OpticalBench::default();
        let lockin = MockLockIn::new(bench.clone());
        lockin.go_silent_at(900);
        bench.set_wavelength(900);

        let err = lockin.poll(PollRequest::default()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DaqError>(),
            Some(DaqError::Timeout { .. })
        ));
        bench.set_wavelength(901);
        assert!(lockin.poll(PollRequest::default()).await.is_ok());
    }
}
