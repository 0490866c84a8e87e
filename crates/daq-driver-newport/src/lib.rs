//! Newport delay stage driver for srs-daq.
//!
//! This crate provides:
//! - [`protocol`]: SMC-series command encoding, reply parsing, controller
//!   state table and error decoding
//! - [`DelayStage`]: the protocol driver with contained operations
//! - [`StageController`]: the driver plus background status polling, exposed
//!   as [`daq_core::capabilities::Movable`]
//!
//! # Usage
//!
//! Add to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! daq-driver-newport = { path = "../daq-driver-newport" }
//! ```

pub mod controller;
pub mod delay_stage;
pub mod protocol;

pub use controller::StageController;
pub use delay_stage::{DelayStage, StageConfig, StageFault, StageStatus, POSITION_TOLERANCE_MM};
pub use protocol::{CommandError, ControllerState, PositionerError};
