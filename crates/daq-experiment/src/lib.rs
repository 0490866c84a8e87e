//! Time-zero calibration for srs-daq.
//!
//! - [`calibration`]: the wavelength → stage position map and its JSON store
//! - [`plans`]: scan window, argmax and wavelength ranges
//! - [`run_engine`]: the [`CalibrationEngine`] that sweeps, records and persists

pub mod calibration;
pub mod plans;
pub mod run_engine;

pub use calibration::{CalibrationMap, CalibrationStore, DEFAULT_CALIBRATION_PATH};
pub use plans::{ScanWindow, WavelengthRange};
pub use run_engine::{
    CalibrationEngine, CalibrationSummary, EngineState, OptimizerSettings, SeedSource,
    SkippedWavelength, SweepTrace,
};
