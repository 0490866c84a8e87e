//! `daq-core`
//!
//! Core trait definitions and types shared by the srs-daq instrument drivers
//! and the calibration engine.
//!
//! ## Layers
//!
//! - **Transport**: [`serial::SerialTransport`], a line-oriented
//!   command/response channel with a fixed settle time after each write
//! - **Drivers** (other crates): protocol encode/decode and state tracking per
//!   instrument, with faults contained at each operation
//! - **Capabilities**: [`capabilities::Movable`],
//!   [`capabilities::WavelengthTunable`] and [`capabilities::LockIn`], the
//!   narrow interfaces the calibration engine drives
//!
//! ## Key Types
//!
//! - [`error::DaqError`]: workspace error type
//! - [`action_log::ActionLog`]: timestamped history behind every "last action"
//! - [`periodic::PeriodicTask`] / [`periodic::CancelToken`]: background
//!   polling and cooperative cancellation

pub mod action_log;
pub mod capabilities;
pub mod error;
pub mod periodic;
pub mod serial;

pub use action_log::{ActionLog, ActionOutcome};
pub use error::{AppResult, DaqError};
pub use periodic::{CancelToken, PeriodicTask};

// Re-export commonly used types
pub use anyhow::{anyhow, Result};
