//! Experiment wiring: instruments, polling and the calibration engine.
//!
//! [`Instruments`] owns both controllers for the life of a command. It is
//! built either on the configured serial ports or on the in-process protocol
//! simulators sharing one [`OpticalBench`], and is torn down with
//! [`Instruments::shutdown`] on every exit path.

use crate::config::AppConfig;
use daq_core::capabilities::LockIn;
use daq_core::error::{AppResult, DaqError};
use daq_driver_mock::{
    MockLockIn, MockMode, OpticalBench, SimulatedLaser, SimulatedStage, TimeZeroModel,
};
use daq_driver_newport::{DelayStage, StageController};
use daq_driver_spectra_physics::{InsightDriver, LaserController};
use daq_experiment::{CalibrationEngine, CalibrationStore};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// The simulated side of a `--simulate` session.
#[derive(Clone)]
pub struct Simulation {
    /// Shared optics: stage position, wavelength and overlap signal.
    pub bench: OpticalBench,
    /// SMC controller simulator behind the stage transport.
    pub stage: SimulatedStage,
    /// InSight simulator behind the laser transport.
    pub laser: SimulatedLaser,
}

impl Simulation {
    /// A bench whose stage starts near time zero for the current wavelength,
    /// as an aligned setup would.
    pub fn aligned(model: TimeZeroModel) -> Self {
        let bench = OpticalBench::new(model);
        let t0 = model.time_zero(bench.wavelength());
        bench.set_stage_position(t0 + model.width_mm);
        Self {
            stage: SimulatedStage::new(bench.clone()),
            laser: SimulatedLaser::new(bench.clone()),
            bench,
        }
    }
}

/// Both instrument controllers plus, when simulating, their simulators.
pub struct Instruments {
    stage: Arc<StageController>,
    laser: Arc<LaserController>,
    simulation: Option<Simulation>,
}

/// One snapshot of both instruments, as printed by `srs-daq status`.
#[derive(Debug, Clone, Serialize)]
pub struct InstrumentStatus {
    /// Cached stage state.
    pub stage: daq_driver_newport::StageStatus,
    /// Last stage action.
    pub stage_last_action: String,
    /// Cached laser state.
    pub laser: daq_driver_spectra_physics::LaserStatus,
    /// Run state label.
    pub laser_run_state: String,
    /// Last laser action.
    pub laser_last_action: String,
}

impl Instruments {
    /// Connect according to `config.simulate`.
    pub async fn open(config: &AppConfig) -> AppResult<Self> {
        if config.simulate {
            Ok(Self::simulated(config, Simulation::aligned(TimeZeroModel::default())).await)
        } else {
            Self::connect(config).await
        }
    }

    /// Open both serial ports.
    ///
    /// # Errors
    /// [`DaqError::MissingPort`] or [`DaqError::Io`] from either instrument.
    /// A stage that connected is closed again when the laser fails.
    pub async fn connect(config: &AppConfig) -> AppResult<Self> {
        let stage = Arc::new(StageController::new(Arc::new(
            DelayStage::connect(&config.stage).await?,
        )));
        let laser = match InsightDriver::connect(&config.laser).await {
            Ok(driver) => Arc::new(LaserController::new(Arc::new(driver))),
            Err(e) => {
                if let Err(close) = stage.shutdown().await {
                    warn!("Closing delay stage after laser failure: {}", close);
                }
                return Err(e);
            }
        };
        info!(
            stage = %config.stage.port,
            laser = %config.laser.port,
            "Instruments connected"
        );
        Ok(Self {
            stage,
            laser,
            simulation: None,
        })
    }

    /// Wire both drivers to `simulation` over in-memory transports.
    pub async fn simulated(config: &AppConfig, simulation: Simulation) -> Self {
        let stage_transport = simulation.stage.connect(config.stage.transport());
        let laser_transport = simulation.laser.connect(config.laser.transport());
        let stage = DelayStage::with_transport(stage_transport, &config.stage).await;
        let laser = InsightDriver::with_transport(laser_transport, &config.laser).await;
        info!(
            wavelength_nm = simulation.bench.wavelength(),
            stage_mm = simulation.bench.stage_position(),
            "Simulated instruments ready"
        );
        Self {
            stage: Arc::new(StageController::new(Arc::new(stage))),
            laser: Arc::new(LaserController::new(Arc::new(laser))),
            simulation: Some(simulation),
        }
    }

    /// Stage controller.
    pub fn stage(&self) -> &Arc<StageController> {
        &self.stage
    }

    /// Laser controller.
    pub fn laser(&self) -> &Arc<LaserController> {
        &self.laser
    }

    /// The simulators, when running without hardware.
    pub fn simulation(&self) -> Option<&Simulation> {
        self.simulation.as_ref()
    }

    /// Start background status refresh on both instruments.
    pub fn start_polling(&self, config: &AppConfig) {
        self.stage.start_polling(config.polling.stage_period());
        self.laser.start_polling(config.polling.laser());
    }

    /// Current cached view of both instruments.
    pub fn status(&self) -> InstrumentStatus {
        let laser = self.laser.status();
        InstrumentStatus {
            stage: self.stage.status(),
            stage_last_action: self.stage.stage().last_action(),
            laser_run_state: laser.run_state().to_string(),
            laser,
            laser_last_action: self.laser.driver().last_action(),
        }
    }

    /// The demodulator for calibration sweeps.
    ///
    /// # Errors
    /// [`DaqError::Configuration`] on hardware: no demodulator backend is
    /// built in, so sweeps need `--simulate`.
    pub fn lock_in(&self) -> AppResult<Arc<dyn LockIn>> {
        match &self.simulation {
            Some(simulation) => Ok(Arc::new(
                MockLockIn::new(simulation.bench.clone()).with_mode(MockMode::Realistic),
            )),
            None => Err(DaqError::Configuration(
                "no lock-in backend is available for hardware sessions; run with --simulate"
                    .into(),
            )),
        }
    }

    /// Build the calibration engine over these instruments.
    pub async fn engine(&self, config: &AppConfig) -> AppResult<CalibrationEngine> {
        CalibrationEngine::open(
            self.stage.clone(),
            self.laser.clone(),
            self.lock_in()?,
            CalibrationStore::new(&config.calibration.path),
            config.optimizer.clone(),
            config.lockin.poll_request(),
        )
        .await
    }

    /// Stop polling and close both ports. Errors are logged, not returned, so
    /// the second instrument is always closed.
    pub async fn shutdown(&self) {
        if let Err(e) = self.stage.shutdown().await {
            warn!("Closing delay stage: {}", e);
        }
        if let Err(e) = self.laser.shutdown().await {
            warn!("Closing laser: {}", e);
        }
        info!("Instruments closed");
    }
}
