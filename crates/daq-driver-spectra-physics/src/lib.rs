//! Spectra-Physics laser driver for srs-daq.
//!
//! This crate provides:
//! - [`status`]: status-word projections, fault bits and fault-code history
//! - [`InsightDriver`]: InSight DS+ protocol driver with contained operations
//! - [`LaserController`]: the driver plus tiered background polling, exposed as
//!   [`daq_core::capabilities::WavelengthTunable`]
//!
//! # Usage
//!
//! Add to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! daq-driver-spectra-physics = { path = "../daq-driver-spectra-physics" }
//! ```

pub mod controller;
pub mod insight;
pub mod status;

pub use controller::{LaserController, LaserPolling};
pub use insight::{Diagnostics, InsightConfig, InsightDriver, LaserFault, LaserStatus};
pub use status::{FaultRecord, OperationError, RunState, StatusWord, TuningError};
