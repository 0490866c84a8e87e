//! srs-daq: time-zero calibration of an optical delay stage against a
//! tunable femtosecond laser, read out through a lock-in amplifier.
//!
//! The instrument drivers, the capability traits and the calibration engine
//! live in the workspace crates; this crate adds what the `srs-daq` binary
//! needs around them:
//!
//! - [`config`]: Figment-layered [`config::AppConfig`]
//! - [`logging`]: `tracing-subscriber` setup
//! - [`app`]: [`app::Instruments`], hardware or simulated wiring and teardown

pub mod app;
pub mod config;
pub mod logging;

pub use app::{InstrumentStatus, Instruments, Simulation};
pub use config::AppConfig;
