//! Time-zero calibration map and its JSON store.
//!
//! The document on disk is
//!
//! ```json
//! { "stage": { "800": 12.004 }, "dsmpos": { "800": 26.0 } }
//! ```
//!
//! Keys are integer wavelengths in nm written as strings. Older files that
//! stored DeepSee positions as strings load as numbers.

use daq_core::error::{AppResult, DaqError};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Default location of the calibration document.
pub const DEFAULT_CALIBRATION_PATH: &str = "calibration/t0_calibration.json";

/// Wavelength → time-zero stage position, plus wavelength → DeepSee position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationMap {
    /// Stage position (mm) of the signal maximum.
    #[serde(default, deserialize_with = "numeric_map")]
    pub stage: BTreeMap<String, f64>,
    /// DeepSee motor position at the time of the optimization.
    #[serde(default, deserialize_with = "numeric_map")]
    pub dsmpos: BTreeMap<String, f64>,
}

impl CalibrationMap {
    /// Calibrated stage position for `wavelength_nm`.
    pub fn stage_position(&self, wavelength_nm: u32) -> Option<f64> {
        self.stage.get(&wavelength_nm.to_string()).copied()
    }

    /// Recorded DeepSee position for `wavelength_nm`.
    pub fn dsm_position(&self, wavelength_nm: u32) -> Option<f64> {
        self.dsmpos.get(&wavelength_nm.to_string()).copied()
    }

    /// Record an optimization result, replacing any earlier entry.
    ///
    /// Without a DeepSee reading the old one is dropped rather than kept
    /// alongside the new stage position.
    pub fn record(&mut self, wavelength_nm: u32, position_mm: f64, dsm_position: Option<f64>) {
        let key = wavelength_nm.to_string();
        match dsm_position {
            Some(dsm) => self.dsmpos.insert(key.clone(), dsm),
            None => self.dsmpos.remove(&key),
        };
        self.stage.insert(key, position_mm);
    }

    /// Calibrated wavelengths in ascending order.
    ///
    /// Keys that are not integers are skipped.
    pub fn wavelengths(&self) -> Vec<u32> {
        let mut wavelengths: Vec<u32> = self.stage.keys().filter_map(|k| k.parse().ok()).collect();
        wavelengths.sort_unstable();
        wavelengths
    }

    /// Number of stage entries.
    pub fn len(&self) -> usize {
        self.stage.len()
    }

    /// True when nothing has been calibrated.
    pub fn is_empty(&self) -> bool {
        self.stage.is_empty()
    }
}

/// Accept numbers or numeric strings as map values.
fn numeric_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Value {
        Number(f64),
        Text(String),
    }

    let raw = BTreeMap::<String, Value>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(key, value)| match value {
            Value::Number(v) => Ok((key, v)),
            Value::Text(s) => s
                .trim()
                .parse()
                .map(|v| (key.clone(), v))
                .map_err(|_| serde::de::Error::custom(format!("'{s}' for {key} is not a number"))),
        })
        .collect()
}

/// JSON file holding a [`CalibrationMap`].
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    path: PathBuf,
}

impl CalibrationStore {
    /// Store backed by `path`. Nothing is read until [`CalibrationStore::load`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File this store reads and writes.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the map. A missing file is an empty map.
    ///
    /// # Errors
    /// [`DaqError::Storage`] when the file exists but cannot be read or parsed.
    pub async fn load(&self) -> AppResult<CalibrationMap> {
        let exists = fs::try_exists(&self.path).await.map_err(|e| {
            DaqError::Storage(format!("Failed to inspect {}: {}", self.path.display(), e))
        })?;
        if !exists {
            info!(path = %self.path.display(), "No calibration file, starting empty");
            return Ok(CalibrationMap::default());
        }

        let content = fs::read(&self.path).await.map_err(|e| {
            DaqError::Storage(format!("Failed to read {}: {}", self.path.display(), e))
        })?;
        let map: CalibrationMap = serde_json::from_slice(&content).map_err(|e| {
            DaqError::Storage(format!("Failed to parse {}: {}", self.path.display(), e))
        })?;
        debug!(entries = map.len(), "Loaded calibration");
        Ok(map)
    }

    /// Write the whole map.
    ///
    /// The document goes to a sibling temporary file first and is renamed over
    /// the target, so readers never see a half-written file.
    pub async fn save(&self, map: &CalibrationMap) -> AppResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                DaqError::Storage(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        let json = serde_json::to_string_pretty(map)
            .map_err(|e| DaqError::Storage(format!("Failed to serialize calibration: {}", e)))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json.as_bytes()).await.map_err(|e| {
            DaqError::Storage(format!("Failed to write {}: {}", tmp.display(), e))
        })?;
        fs::rename(&tmp, &self.path).await.map_err(|e| {
            DaqError::Storage(format!("Failed to replace {}: {}", self.path.display(), e))
        })?;
        debug!(entries = map.len(), path = %self.path.display(), "Saved calibration");
        Ok(())
    }
}
