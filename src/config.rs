//! Layered configuration using Figment
//!
//! Configuration is assembled from, in increasing priority:
//! 1. built-in defaults ([`AppConfig::default`])
//! 2. a TOML file (`config/srs_daq.toml` unless another path is given)
//! 3. environment variables prefixed `SRS_DAQ_`, with `__` separating
//!    sections from keys
//!
//! A missing TOML file is not an error; the defaults and environment still
//! apply.
//!
//! # Example
//! ```no_run
//! use srs_daq::config::AppConfig;
//!
//! // SRS_DAQ_STAGE__PORT=/dev/ttyUSB0 overrides [stage] port
//! let config = AppConfig::load()?;
//! println!("stage on {}", config.stage.port);
//! # Ok::<(), daq_core::DaqError>(())
//! ```

use daq_core::capabilities::PollRequest;
use daq_core::error::{AppResult, DaqError};
use daq_driver_newport::StageConfig;
use daq_driver_spectra_physics::{InsightConfig, LaserPolling};
use daq_experiment::{OptimizerSettings, DEFAULT_CALIBRATION_PATH};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the TOML file.
pub const DEFAULT_CONFIG_PATH: &str = "config/srs_daq.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "SRS_DAQ_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Fallback log filter when `RUST_LOG` is unset (trace, debug, info, warn, error)
    pub log_level: String,
    /// Run against the in-process instrument simulators instead of hardware
    pub simulate: bool,
    /// Delay stage connection
    pub stage: StageConfig,
    /// Laser connection
    pub laser: InsightConfig,
    /// Demodulator polling
    pub lockin: LockInConfig,
    /// Sweep geometry and timing
    pub optimizer: OptimizerSettings,
    /// Calibration file
    pub calibration: CalibrationConfig,
    /// Background status polling
    pub polling: PollingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            simulate: false,
            stage: StageConfig::default(),
            laser: InsightConfig::default(),
            lockin: LockInConfig::default(),
            optimizer: OptimizerSettings::default(),
            calibration: CalibrationConfig::default(),
            polling: PollingConfig::default(),
        }
    }
}

/// Lock-in poll parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockInConfig {
    /// Sample collection time per point
    pub poll_duration_ms: u64,
    /// Give up on a poll after this long
    pub poll_timeout_ms: u64,
    /// Demodulator filter time constant
    pub time_constant_s: f64,
}

impl Default for LockInConfig {
    fn default() -> Self {
        let poll = PollRequest::default();
        Self {
            poll_duration_ms: duration_millis(poll.duration),
            poll_timeout_ms: duration_millis(poll.timeout),
            time_constant_s: poll.time_constant,
        }
    }
}

impl LockInConfig {
    /// The poll issued at every scan point.
    pub fn poll_request(&self) -> PollRequest {
        PollRequest {
            duration: Duration::from_millis(self.poll_duration_ms),
            timeout: Duration::from_millis(self.poll_timeout_ms),
            time_constant: self.time_constant_s,
        }
    }
}

/// Where the calibration lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// JSON calibration file
    pub path: PathBuf,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_CALIBRATION_PATH),
        }
    }
}

/// Background refresh periods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Stage state and error mask
    pub stage_status_ms: u64,
    /// Laser status word
    pub laser_state_ms: u64,
    /// Laser diode and humidity readings
    pub laser_stats_s: u64,
    /// Laser fault history
    pub laser_history_s: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        let laser = LaserPolling::default();
        Self {
            stage_status_ms: 500,
            laser_state_ms: duration_millis(laser.state),
            laser_stats_s: laser.stats.as_secs(),
            laser_history_s: laser.history.as_secs(),
        }
    }
}

impl PollingConfig {
    /// Stage status period.
    pub fn stage_period(&self) -> Duration {
        Duration::from_millis(self.stage_status_ms)
    }

    /// Laser tier periods.
    pub fn laser(&self) -> LaserPolling {
        LaserPolling {
            state: Duration::from_millis(self.laser_state_ms),
            stats: Duration::from_secs(self.laser_stats_s),
            history: Duration::from_secs(self.laser_history_s),
        }
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl AppConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific TOML file and the environment, then validate.
    ///
    /// # Errors
    /// [`DaqError::Configuration`] when a source cannot be parsed or the
    /// merged values fail [`AppConfig::validate`].
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Self::figment(path.as_ref())
            .extract()
            .map_err(|e| DaqError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// The merged provider chain, for callers that want to inspect sources.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        self.stage.validate()?;
        self.laser.validate()?;
        self.optimizer.validate()?;

        if self.lockin.poll_duration_ms == 0 {
            return Err(DaqError::Configuration(
                "lock-in poll duration must be positive".into(),
            ));
        }
        if self.lockin.poll_timeout_ms < self.lockin.poll_duration_ms {
            return Err(DaqError::Configuration(format!(
                "lock-in poll timeout {} ms is shorter than the poll duration {} ms",
                self.lockin.poll_timeout_ms, self.lockin.poll_duration_ms
            )));
        }
        if !(self.lockin.time_constant_s.is_finite() && self.lockin.time_constant_s > 0.0) {
            return Err(DaqError::Configuration(format!(
                "lock-in time constant must be positive, got {}",
                self.lockin.time_constant_s
            )));
        }

        let periods = [
            ("stage_status_ms", self.polling.stage_status_ms),
            ("laser_state_ms", self.polling.laser_state_ms),
            ("laser_stats_s", self.polling.laser_stats_s),
            ("laser_history_s", self.polling.laser_history_s),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, period)| *period == 0) {
            return Err(DaqError::Configuration(format!(
                "polling period {name} must be positive"
            )));
        }

        if self.calibration.path.as_os_str().is_empty() {
            return Err(DaqError::Configuration(
                "calibration path must not be empty".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lockin.poll_request(), PollRequest::default());
        assert_eq!(config.polling.laser(), LaserPolling::default());
        assert_eq!(
            config.calibration.path,
            PathBuf::from("calibration/t0_calibration.json")
        );
    }

    #[test]
    fn invalid_log_level() {
        let config = AppConfig {
            log_level: "loud".into(),
            ..AppConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert!(err.to_string().contains("Invalid log_level 'loud'"));
    }

    #[test]
    fn poll_timeout_shorter_than_duration() {
        let mut config = AppConfig::default();
        config.lockin.poll_duration_ms = 100;
        config.lockin.poll_timeout_ms = 50;
        assert!(matches!(
            config.validate(),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn zero_polling_period_is_named() {
        let mut config = AppConfig::default();
        config.polling.laser_stats_s = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("laser_stats_s"));
    }

    #[test]
    fn nested_validation_is_reported() {
        let mut config = AppConfig::default();
        config.laser.min_wavelength_nm = 1300;
        config.laser.max_wavelength_nm = 680;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.optimizer.points = 0;
        assert!(config.validate().is_err());
    }
}
