//! Simulated instruments for srs-daq
//!
//! This crate provides simulated hardware for running calibrations and tests
//! without a laser table. All simulated devices use async-safe operations
//! (tokio::time::sleep, not std::thread::sleep).
//!
//! Two levels of simulation share one [`OpticalBench`]:
//!
//! - Capability mocks: [`MockStage`], [`MockLaser`] and [`MockLockIn`]
//!   implement the capability traits directly. Fast, used by engine tests.
//! - Protocol simulators: [`SimulatedStage`] (SMC controller) and
//!   [`SimulatedLaser`] (InSight DS+) answer the real drivers' serial traffic
//!   over an in-memory pipe.
//!
//! The synthetic lock-in reads the bench, so a sweep over either level sees a
//! Gaussian overlap peak at the model's time zero.
//!
//! ```rust,ignore
//! use daq_driver_mock::{OpticalBench, SimulatedStage, TimeZeroModel};
//!
//! let bench = OpticalBench::new(TimeZeroModel::default());
//! let transport = SimulatedStage::new(bench.clone()).connect(config.transport());
//! let stage = DelayStage::with_transport(transport, &config).await;
//! ```

pub mod bench;
pub mod common;
mod mock_laser;
mod mock_lockin;
mod mock_stage;
mod sim_laser;
mod sim_stage;

// Re-export common types
pub use bench::{OpticalBench, TimeZeroModel};
pub use common::{MockMode, MockRng};

// Re-export device types
pub use mock_laser::MockLaser;
pub use mock_lockin::{DEFAULT_SAMPLE_RATE_HZ, MockLockIn};
pub use mock_stage::{MockStage, VelocityProfile};
pub use sim_laser::SimulatedLaser;
pub use sim_stage::SimulatedStage;
