//! Scan plans: the stage window swept around a hint and the wavelength range
//! walked by a calibration.

use daq_core::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Evenly spaced stage positions spanning `center ± half_width`, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanWindow {
    /// Middle of the window (the hint).
    pub center: f64,
    /// Half the window width in mm.
    pub half_width: f64,
    /// Number of positions, including both ends.
    pub points: usize,
}

impl ScanWindow {
    /// Window of `points` positions around `center`.
    pub fn new(center: f64, half_width: f64, points: usize) -> Self {
        Self {
            center,
            half_width,
            points,
        }
    }

    /// First position.
    pub fn start(&self) -> f64 {
        self.center - self.half_width
    }

    /// Last position.
    pub fn stop(&self) -> f64 {
        self.center + self.half_width
    }

    /// Spacing between neighbouring positions.
    pub fn step(&self) -> f64 {
        if self.points <= 1 {
            0.0
        } else {
            (self.stop() - self.start()) / (self.points - 1) as f64
        }
    }

    /// Position of point `index`.
    pub fn position_at(&self, index: usize) -> f64 {
        if self.points <= 1 {
            self.center
        } else if index + 1 == self.points {
            // Land exactly on the end rather than on accumulated rounding.
            self.stop()
        } else {
            self.start() + self.step() * index as f64
        }
    }

    /// All positions in sweep order.
    pub fn positions(&self) -> Vec<f64> {
        (0..self.points).map(|i| self.position_at(i)).collect()
    }
}

/// Index of the largest value; the first one wins ties. NaNs never win.
pub fn argmax(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

/// Inclusive integer wavelength range written as `"min-max"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WavelengthRange {
    /// First wavelength (nm).
    pub start: u32,
    /// Last wavelength (nm), included.
    pub end: u32,
}

impl WavelengthRange {
    /// Range from `start` to `end` inclusive.
    ///
    /// # Errors
    /// [`DaqError::Configuration`] when `start > end`.
    pub fn new(start: u32, end: u32) -> AppResult<Self> {
        if start > end {
            return Err(DaqError::Configuration(format!(
                "wavelength range {start}-{end} is reversed"
            )));
        }
        Ok(Self { start, end })
    }

    /// Wavelengths in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> {
        self.start..=self.end
    }

    /// Number of wavelengths.
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    /// Always false; a range holds at least one wavelength.
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl FromStr for WavelengthRange {
    type Err = DaqError;

    fn from_str(s: &str) -> AppResult<Self> {
        let invalid = || {
            DaqError::Configuration(format!(
                "invalid wavelength range '{s}': expected 'min-max' in whole nm"
            ))
        };
        let (min, max) = s.trim().split_once('-').ok_or_else(invalid)?;
        let min: u32 = min.trim().parse().map_err(|_| invalid())?;
        let max: u32 = max.trim().parse().map_err(|_| invalid())?;
        Self::new(min, max)
    }
}

impl fmt::Display for WavelengthRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_spans_both_ends() {
        let window = ScanWindow::new(10.0, 0.1, 200);
        let positions = window.positions();
        assert_eq!(positions.len(), 200);
        assert!((positions[0] - 9.9).abs() < 1e-12);
        assert_eq!(positions[199], window.stop());
        assert!((window.step() - 0.2 / 199.0).abs() < 1e-15);
        assert!(positions.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn single_point_window_is_the_center() {
        assert_eq!(ScanWindow::new(3.0, 0.1, 1).positions(), vec![3.0]);
        assert!(ScanWindow::new(3.0, 0.1, 0).positions().is_empty());
    }

    #[test]
    fn argmax_first_tie_wins() {
        assert_eq!(argmax(&[1.0, 3.0, 2.0, 3.0]), Some(1));
        assert_eq!(argmax(&[f64::NAN, 0.5, 0.2]), Some(1));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn parses_inclusive_ranges() {
        let range: WavelengthRange = "700-705".parse().unwrap();
        assert_eq!(range.iter().collect::<Vec<_>>(), vec![700, 701, 702, 703, 704, 705]);
        assert_eq!(range.len(), 6);
        assert_eq!(range.to_string(), "700-705");

        let single: WavelengthRange = " 800 - 800 ".parse().unwrap();
        assert_eq!(single.len(), 1);
    }

    #[test]
    fn rejects_malformed_ranges() {
        for bad in ["700", "700-", "a-b", "705-700", "-5-10", "700.5-701"] {
            assert!(
                matches!(bad.parse::<WavelengthRange>(), Err(DaqError::Configuration(_))),
                "{bad} parsed"
            );
        }
    }
}
