//! Mock tunable laser (InSight-like) on the shared [`OpticalBench`].

use anyhow::{Result, bail};
use async_trait::async_trait;
use daq_core::capabilities::WavelengthTunable;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::bench::OpticalBench;
use crate::common::MockMode;

/// Mock tunable laser.
///
/// Tuning inside the range moves the bench wavelength; the DeepSee position
/// follows the wavelength. Wavelengths marked unreachable are refused the way
/// the real head refuses a wavelength it cannot confirm.
pub struct MockLaser {
    bench: OpticalBench,
    range: (u32, u32),
    mode: MockMode,
    tuning_time: Duration,
    unreachable: Mutex<BTreeSet<u32>>,
    tunes: AtomicUsize,
}

impl MockLaser {
    /// Instant-mode laser covering 680-1300 nm.
    pub fn new(bench: OpticalBench) -> Self {
        Self {
            bench,
            range: (680, 1300),
            mode: MockMode::Instant,
            tuning_time: Duration::from_secs(2),
            unreachable: Mutex::new(BTreeSet::new()),
            tunes: AtomicUsize::new(0),
        }
    }

    /// Set the operational mode.
    pub fn with_mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the tuning range.
    pub fn with_range(mut self, min_nm: u32, max_nm: u32) -> Self {
        self.range = (min_nm, max_nm);
        self
    }

    /// Make `wavelength_nm` fail to tune.
    pub fn make_unreachable(&self, wavelength_nm: u32) {
        self.unreachable.lock().insert(wavelength_nm);
    }

    /// Number of successful tunes.
    pub fn tune_count(&self) -> usize {
        self.tunes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl WavelengthTunable for MockLaser {
    async fn set_wavelength(&self, wavelength_nm: u32) -> Result<u32> {
        let (min, max) = self.range;
        if !(min..=max).contains(&wavelength_nm) || self.unreachable.lock().contains(&wavelength_nm)
        {
            bail!("Wavelength not changed. Invalid wavelength.");
        }
        self.mode.delay(self.tuning_time).await;
        self.bench.set_wavelength(wavelength_nm);
        self.tunes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("MockLaser: tuned to {wavelength_nm} nm");
        Ok(wavelength_nm)
    }

    async fn get_wavelength(&self) -> Result<u32> {
        Ok(self.bench.wavelength())
    }

    fn wavelength_range(&self) -> (u32, u32) {
        self.range
    }

    async fn coupled_axis_position(&self) -> Result<Option<f64>> {
        Ok(Some(OpticalBench::dsm_position_for(self.bench.wavelength())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tuning_moves_the_bench() {
        let bench = OpticalBench::default();
        let laser = MockLaser::new(bench.clone());
        assert_eq!(laser.set_wavelength(920).await.unwrap(), 920);
        assert_eq!(bench.wavelength(), 920);
        assert_eq!(laser.get_wavelength().await.unwrap(), 920);
        assert_eq!(
            laser.coupled_axis_position().await.unwrap(),
            Some(OpticalBench::dsm_position_for(920))
        );
    }

    #[tokio::test]
    async fn out_of_range_and_unreachable_are_refused() {
        let bench = OpticalBench::default();
        let laser = MockLaser::new(bench.clone()).with_range(700, 1000);
        laser.make_unreachable(850);

        for wl in [699, 1001, 850] {
            let err = laser.set_wavelength(wl).await.unwrap_err();
            assert_eq!(err.to_string(), "Wavelength not changed. Invalid wavelength.");
        }
        assert_eq!(bench.wavelength(), 800);
        assert_eq!(laser.tune_count(), 0);
    }
}
