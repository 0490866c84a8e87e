//! Newport SMC-series optical delay stage driver.
//!
//! Protocol Overview:
//! - Format: ASCII command/response over RS-232, newline terminated
//! - Baud: 115200, 8N1, no flow control
//! - Single axis, controller address 1 by default
//!
//! Every operation that changes the stage is one unit of error containment:
//! controller rejections ([`CommandError`]), positioner faults
//! ([`PositionerError`]) and transport problems are caught at the operation
//! boundary, turned into an [`ActionOutcome`], and recorded in the stage's
//! [`ActionLog`]. Nothing an instrument reports escapes as an `Err` from those
//! methods.
//!
//! # Usage
//!
//! ```rust,ignore
//! use daq_driver_newport::{DelayStage, StageConfig};
//!
//! let config = StageConfig { port: "/dev/ttyUSB0".into(), ..Default::default() };
//! let stage = DelayStage::connect(&config).await?;
//! let outcome = stage.move_absolute(12.5).await;
//! println!("{}", outcome.message); // "Position moved to: 12.5"
//! ```

use crate::protocol::{
    parse_error_letter, parse_state, parse_value, CommandError, ControllerState,
    PositionerError, StageCommand, StateReply, NO_COMMAND_ERROR,
};
use daq_core::action_log::{ActionLog, ActionOutcome};
use daq_core::error::{AppResult, DaqError};
use daq_core::serial::{SerialTransport, TransportConfig};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{instrument, warn};

/// A move that ends further than this from its target has failed.
pub const POSITION_TOLERANCE_MM: f64 = 1e-4;

/// Pause between state polls while the stage is in motion.
const MOTION_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Slack on top of twice the travel-time estimate before a move times out.
const MOTION_WAIT_MARGIN: Duration = Duration::from_secs(2);

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the delay stage driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Controller address
    pub axis: u8,
    /// Wait after each write before reading, in milliseconds
    pub settle_ms: u64,
    /// Travel range is `-travel_limit_mm..=travel_limit_mm`
    pub travel_limit_mm: f64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 115200,
            axis: 1,
            settle_ms: 50,
            travel_limit_mm: 100.0,
        }
    }
}

impl StageConfig {
    /// Transport timing derived from this configuration.
    pub fn transport(&self) -> TransportConfig {
        TransportConfig::with_settle(Duration::from_millis(self.settle_ms))
    }

    /// Semantic validation.
    pub fn validate(&self) -> AppResult<()> {
        if !(1..=31).contains(&self.axis) {
            return Err(DaqError::Configuration(format!(
                "stage axis must be 1-31, got {}",
                self.axis
            )));
        }
        if !(self.travel_limit_mm.is_finite() && self.travel_limit_mm > 0.0) {
            return Err(DaqError::Configuration(format!(
                "stage travel limit must be positive, got {}",
                self.travel_limit_mm
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Faults and status
// =============================================================================

/// Why a stage operation did not complete.
#[derive(Debug, Error)]
pub enum StageFault {
    /// The controller rejected the command.
    #[error("Command Error: {0}")]
    Command(#[from] CommandError),
    /// The positioner reported a hardware fault.
    #[error("Positioner Error: {0}")]
    Positioner(#[from] PositionerError),
    /// Transport failure or unparsable reply.
    #[error("Unknown error. {0}")]
    Daq(#[from] DaqError),
}

/// Cached view of the controller, refreshed by queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageStatus {
    /// Last read position in mm.
    pub position: f64,
    /// False after any command that may have moved the stage, until re-queried.
    pub position_fresh: bool,
    /// Last read velocity.
    pub velocity: f64,
    /// Last read acceleration.
    pub acceleration: f64,
    /// Raw positioner error mask from the last state query.
    pub error_mask: u16,
    /// Raw state code from the last state query.
    pub state_code: String,
    /// Last recognised controller state.
    pub state: Option<ControllerState>,
    /// Description of `state`, annotated when the last code was not recognised.
    pub state_description: String,
    /// Letter from the last `TE` query.
    pub last_command_error: char,
}

impl Default for StageStatus {
    fn default() -> Self {
        let state = ControllerState::NotReferencedFromReset;
        Self {
            position: 0.0,
            position_fresh: false,
            velocity: 0.0,
            acceleration: 0.0,
            error_mask: 0,
            state_code: state.code().to_string(),
            state: Some(state),
            state_description: state.description().to_string(),
            last_command_error: NO_COMMAND_ERROR,
        }
    }
}

// =============================================================================
// DelayStage
// =============================================================================

/// Driver for a Newport SMC-series single-axis delay stage.
pub struct DelayStage {
    /// Serial connection; held for the whole of each operation
    transport: Mutex<SerialTransport>,
    axis: u8,
    travel_limit: f64,
    status: RwLock<StageStatus>,
    log: ActionLog,
}

impl std::fmt::Debug for DelayStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayStage")
            .field("axis", &self.axis)
            .field("status", &*self.status.read())
            .finish()
    }
}

impl DelayStage {
    /// Open the configured port and read the initial position, velocity and
    /// acceleration.
    ///
    /// # Errors
    /// [`DaqError::MissingPort`] when no port is configured, [`DaqError::Io`]
    /// when the port cannot be opened. Both are fatal for this instrument.
    #[instrument(skip(config), fields(port = %config.port), err)]
    pub async fn connect(config: &StageConfig) -> AppResult<Self> {
        config.validate()?;
        let transport =
            SerialTransport::connect(&config.port, config.baud_rate, "Delay stage", config.transport())
                .await?;
        Ok(Self::with_transport(transport, config).await)
    }

    /// Build on an already-open transport (hardware port or simulator).
    pub async fn with_transport(transport: SerialTransport, config: &StageConfig) -> Self {
        let stage = Self {
            transport: Mutex::new(transport),
            axis: config.axis,
            travel_limit: config.travel_limit_mm,
            status: RwLock::new(StageStatus::default()),
            log: ActionLog::new("Delay stage"),
        };
        stage.initial_read().await;
        stage
    }

    async fn initial_read(&self) {
        let mut port = self.transport.lock().await;
        if let Err(e) = self.read_position_on(&mut port).await {
            warn!("Initial position read failed: {}", e);
        }
        if let Err(e) = self.read_velocity_on(&mut port).await {
            warn!("Initial velocity read failed: {}", e);
        }
        if let Err(e) = self.read_acceleration_on(&mut port).await {
            warn!("Initial acceleration read failed: {}", e);
        }
    }

    /// Controller address.
    pub fn axis(&self) -> u8 {
        self.axis
    }

    /// Symmetric travel limit in mm.
    pub fn travel_limit(&self) -> f64 {
        self.travel_limit
    }

    /// Snapshot of the cached controller state.
    pub fn status(&self) -> StageStatus {
        self.status.read().clone()
    }

    /// Description of the current controller state.
    pub fn state_description(&self) -> String {
        self.status.read().state_description.clone()
    }

    /// Most recent action status.
    pub fn last_action(&self) -> String {
        self.log.last_action()
    }

    /// Action history shared with controllers.
    pub fn log(&self) -> &ActionLog {
        &self.log
    }

    /// Close the serial connection.
    pub async fn close(&self) -> AppResult<()> {
        self.transport.lock().await.close().await
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Query `TS` and update the cached state.
    ///
    /// Unknown state codes keep the last recognised state; the description is
    /// annotated and a warning is logged.
    #[instrument(skip(self), fields(axis = self.axis), err)]
    pub async fn query_state(&self) -> AppResult<StateReply> {
        let mut port = self.transport.lock().await;
        self.query_state_on(&mut port).await
    }

    /// Read the last command error and the positioner error mask.
    #[instrument(skip(self), fields(axis = self.axis), err)]
    pub async fn check_errors(&self) -> Result<(), StageFault> {
        let mut port = self.transport.lock().await;
        self.check_errors_on(&mut port).await
    }

    /// Re-query the position.
    #[instrument(skip(self), fields(axis = self.axis), err)]
    pub async fn position(&self) -> AppResult<f64> {
        let mut port = self.transport.lock().await;
        self.read_position_on(&mut port).await
    }

    /// Re-query the velocity.
    pub async fn velocity(&self) -> AppResult<f64> {
        let mut port = self.transport.lock().await;
        self.read_velocity_on(&mut port).await
    }

    /// Re-query the acceleration.
    pub async fn acceleration(&self) -> AppResult<f64> {
        let mut port = self.transport.lock().await;
        self.read_acceleration_on(&mut port).await
    }

    // -------------------------------------------------------------------------
    // Contained operations
    // -------------------------------------------------------------------------

    /// Move to `target` mm and re-query the position.
    ///
    /// The displacement is measured from a fresh position, re-queried when the
    /// cache is stale. After the controller's travel-time estimate the state is
    /// polled until the stage is READY again, and the final position must lie
    /// within [`POSITION_TOLERANCE_MM`] of `target`. On any fault the position
    /// is re-queried rather than assumed.
    #[instrument(skip(self), fields(axis = self.axis))]
    pub async fn move_absolute(&self, target: f64) -> ActionOutcome {
        let mut port = self.transport.lock().await;
        match self.try_move_absolute(&mut port, target).await {
            Ok(position) => self.log.success(format!("Position moved to: {position}")),
            Err(fault) => {
                if let Err(e) = self.read_position_on(&mut port).await {
                    warn!("Position re-query after failed move failed: {}", e);
                }
                self.log.failure(format!("Position not moved! {fault}"))
            }
        }
    }

    /// Move by `delta` mm from a freshly queried position.
    #[instrument(skip(self), fields(axis = self.axis))]
    pub async fn move_relative(&self, delta: f64) -> ActionOutcome {
        let current = {
            let mut port = self.transport.lock().await;
            self.read_position_on(&mut port).await
        };
        match current {
            Ok(position) => self.move_absolute(position + delta).await,
            Err(e) => self
                .log
                .failure(format!("Position not moved! {}", StageFault::from(e))),
        }
    }

    /// Start the home search.
    #[instrument(skip(self), fields(axis = self.axis))]
    pub async fn home(&self) -> ActionOutcome {
        let mut port = self.transport.lock().await;
        let result = self.try_command(&mut port, StageCommand::Home).await;
        self.status.write().position_fresh = false;
        match result {
            Ok(()) => self.log.success("Home search started"),
            Err(fault) => self.log.failure(fault.to_string()),
        }
    }

    /// Stop any motion and report where the stage stopped.
    #[instrument(skip(self), fields(axis = self.axis))]
    pub async fn stop_motion(&self) -> ActionOutcome {
        let mut port = self.transport.lock().await;
        let result = async {
            self.try_command(&mut port, StageCommand::Stop).await?;
            Ok::<_, StageFault>(self.read_position_on(&mut port).await?)
        }
        .await;
        match result {
            Ok(position) => self.log.success(format!("Motion stopped at: {position}")),
            Err(fault) => self.log.failure(fault.to_string()),
        }
    }

    /// Enter the DISABLE state.
    #[instrument(skip(self), fields(axis = self.axis))]
    pub async fn disable(&self) -> ActionOutcome {
        let mut port = self.transport.lock().await;
        match self.try_command(&mut port, StageCommand::Disable).await {
            Ok(()) => self.log.success("Entered DISABLE state"),
            Err(fault) => self.log.failure(fault.to_string()),
        }
    }

    /// Re-enter the READY state.
    #[instrument(skip(self), fields(axis = self.axis))]
    pub async fn enable(&self) -> ActionOutcome {
        let mut port = self.transport.lock().await;
        match self.try_command(&mut port, StageCommand::Enable).await {
            Ok(()) => self.log.success("Entered READY state"),
            Err(fault) => self.log.failure(fault.to_string()),
        }
    }

    /// Set velocity and read it back.
    #[instrument(skip(self), fields(axis = self.axis))]
    pub async fn set_velocity(&self, velocity: f64) -> ActionOutcome {
        let mut port = self.transport.lock().await;
        let result = async {
            self.try_command(&mut port, StageCommand::SetVelocity(velocity))
                .await?;
            Ok::<_, StageFault>(self.read_velocity_on(&mut port).await?)
        }
        .await;
        match result {
            Ok(v) => self.log.success(format!("Velocity changed to: {v}")),
            Err(fault) => self.log.failure(format!("Velocity not changed! {fault}")),
        }
    }

    /// Set acceleration and read it back.
    #[instrument(skip(self), fields(axis = self.axis))]
    pub async fn set_acceleration(&self, acceleration: f64) -> ActionOutcome {
        let mut port = self.transport.lock().await;
        let result = async {
            self.try_command(&mut port, StageCommand::SetAcceleration(acceleration))
                .await?;
            Ok::<_, StageFault>(self.read_acceleration_on(&mut port).await?)
        }
        .await;
        match result {
            Ok(a) => self.log.success(format!("Acceleration changed to: {a}")),
            Err(fault) => self
                .log
                .failure(format!("Acceleration not changed! {fault}")),
        }
    }

    // -------------------------------------------------------------------------
    // Fallible building blocks; the caller holds the port for the whole
    // operation so the status poll cannot interleave.
    // -------------------------------------------------------------------------

    async fn try_move_absolute(
        &self,
        port: &mut SerialTransport,
        target: f64,
    ) -> Result<f64, StageFault> {
        if !target.is_finite() || target.abs() > self.travel_limit {
            return Err(CommandError::displacement_out_of_limits().into());
        }

        let start = if self.status.read().position_fresh {
            self.status.read().position
        } else {
            self.read_position_on(port).await?
        };
        let command = StageCommand::MotionTime((target - start).abs()).encode(self.axis);
        let reply = port.query(&command).await?;
        let travel = parse_value(&command, &reply)?;
        if !(travel.is_finite() && travel >= 0.0) {
            return Err(DaqError::malformed(command, reply).into());
        }

        self.status.write().position_fresh = false;
        let travel = Duration::from_secs_f64(travel);
        let settle = port.config().settle + travel;
        port.write_line_settled(&StageCommand::MoveAbsolute(target).encode(self.axis), settle)
            .await?;
        self.check_errors_on(port).await?;
        self.wait_for_motion_on(port, settle + travel + MOTION_WAIT_MARGIN)
            .await?;

        let position = self.read_position_on(port).await?;
        if (position - target).abs() > POSITION_TOLERANCE_MM {
            return Err(DaqError::Instrument(format!(
                "stage stopped at {position} mm instead of {target} mm"
            ))
            .into());
        }
        Ok(position)
    }

    /// Poll the state until the stage leaves MOVING and HOMING.
    ///
    /// The travel-time estimate only decides when polling starts; the stage is
    /// done when the controller says so, or when `limit` has passed since the
    /// command went out.
    async fn wait_for_motion_on(
        &self,
        port: &mut SerialTransport,
        limit: Duration,
    ) -> Result<(), StageFault> {
        let deadline = Instant::now() + limit.saturating_sub(port.config().settle);
        loop {
            let reply = self.query_state_on(port).await?;
            if let Some(err) = PositionerError::check(reply.error_mask) {
                return Err(err.into());
            }
            match ControllerState::from_code(&reply.state_code) {
                Some(ControllerState::Moving | ControllerState::Homing) => {}
                Some(state) if !state.is_ready() => {
                    return Err(DaqError::Instrument(format!(
                        "stage ended the move in state {state}"
                    ))
                    .into());
                }
                // Unrecognised codes fall through to the position check.
                _ => return Ok(()),
            }
            if Instant::now() >= deadline {
                return Err(DaqError::Timeout {
                    operation: "Stage motion".into(),
                    millis: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                }
                .into());
            }
            sleep(MOTION_POLL_INTERVAL).await;
        }
    }

    async fn try_command(
        &self,
        port: &mut SerialTransport,
        command: StageCommand,
    ) -> Result<(), StageFault> {
        port.write_line(&command.encode(self.axis)).await?;
        self.check_errors_on(port).await
    }

    async fn check_errors_on(&self, port: &mut SerialTransport) -> Result<(), StageFault> {
        let command = StageCommand::TellError.encode(self.axis);
        let reply = port.query(&command).await?;
        let letter = parse_error_letter(&command, &reply)?;
        self.status.write().last_command_error = letter;
        if let Some(err) = CommandError::from_code(letter) {
            return Err(err.into());
        }

        let state = self.query_state_on(port).await?;
        match PositionerError::check(state.error_mask) {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    async fn query_state_on(&self, port: &mut SerialTransport) -> AppResult<StateReply> {
        let command = StageCommand::TellState.encode(self.axis);
        let reply = port.query(&command).await?;
        let parsed = parse_state(&command, &reply).map_err(|e| {
            warn!("State query failed, keeping last known state: {}", e);
            e
        })?;

        let mut status = self.status.write();
        status.error_mask = parsed.error_mask;
        if status.state_code != parsed.state_code {
            // A new state may mean the stage moved underneath the cache.
            status.position_fresh = false;
        }
        status.state_code = parsed.state_code.clone();
        match ControllerState::from_code(&parsed.state_code) {
            Some(state) => {
                status.state = Some(state);
                status.state_description = state.description().to_string();
            }
            None => {
                let known = status
                    .state
                    .map_or("unknown state", |s| s.description());
                warn!(
                    "Unrecognised state code '{}' (last state query: {:04X}{})",
                    parsed.state_code, parsed.error_mask, parsed.state_code
                );
                status.state_description = format!(
                    "{} [unrecognised state code '{}', last state query: {:04X}{}]",
                    known, parsed.state_code, parsed.error_mask, parsed.state_code
                );
            }
        }
        Ok(parsed)
    }

    async fn read_position_on(&self, port: &mut SerialTransport) -> AppResult<f64> {
        let position = self.read_value(port, StageCommand::TellPosition).await?;
        let mut status = self.status.write();
        status.position = position;
        status.position_fresh = true;
        Ok(position)
    }

    async fn read_velocity_on(&self, port: &mut SerialTransport) -> AppResult<f64> {
        let velocity = self.read_value(port, StageCommand::GetVelocity).await?;
        self.status.write().velocity = velocity;
        Ok(velocity)
    }

    async fn read_acceleration_on(&self, port: &mut SerialTransport) -> AppResult<f64> {
        let acceleration = self.read_value(port, StageCommand::GetAcceleration).await?;
        self.status.write().acceleration = acceleration;
        Ok(acceleration)
    }

    async fn read_value(&self, port: &mut SerialTransport, query: StageCommand) -> AppResult<f64> {
        let command = query.encode(self.axis);
        let reply = port.query(&command).await?;
        parse_value(&command, &reply).map_err(|e| {
            warn!("Keeping last known value: {}", e);
            e
        })
    }
}
