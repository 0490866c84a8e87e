//! Common infrastructure for mock devices.
//!
//! - **mode**: Operational modes (Instant, Realistic)
//! - **rng**: Seeded random number generator

pub mod mode;
pub mod rng;

// Re-export commonly used types
pub use mode::MockMode;
pub use rng::MockRng;
