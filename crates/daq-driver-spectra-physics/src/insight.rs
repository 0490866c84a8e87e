//! Spectra-Physics InSight DS+ tunable femtosecond laser driver.
//!
//! Reference: InSight DS+ User's Manual, serial command reference
//!
//! Protocol Overview:
//! - Format: SCPI-like ASCII over RS-232/USB
//! - Baud: 115200, 8N1, no flow control
//! - Command terminator: LF (\n); queries answer with one bare line
//! - Commands: WAVelength <nm>, SHUTter <0|1>, IRSHUTter <0|1>, ON, OFF,
//!   CONT:DSMPOS <value>
//! - Queries: WAVelength?, *STB?, READ:AHIS?, CONT:DSMPOS?, CONT:SLMIN?,
//!   CONT:SLMAX?, READ:PLASer:DIODe{1,2}:{HOURS,TEMPerature,CURRent}?,
//!   READ:HUMidity?
//!
//! Tuning is not synchronous: after `WAVelength <nm>` the driver waits the
//! tuning settle time before confirming with `WAVelength?`.
//!
//! Like the delay stage, every state-changing operation is contained: faults
//! become an [`ActionOutcome`] and an entry in the [`ActionLog`].

use crate::status::{decode_history, FaultRecord, OperationError, RunState, StatusWord, TuningError};
use daq_core::action_log::{ActionLog, ActionOutcome};
use daq_core::error::{AppResult, DaqError};
use daq_core::serial::{SerialTransport, TransportConfig};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{instrument, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the InSight driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsightConfig {
    /// Serial port path (e.g., "/dev/ttyUSB1", "COM6")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Wait after each write before reading, in milliseconds
    pub settle_ms: u64,
    /// Extra wait after a tuning command before confirming, in milliseconds
    pub tuning_settle_ms: u64,
    /// Shortest accepted OPO wavelength (nm)
    pub min_wavelength_nm: u32,
    /// Longest accepted OPO wavelength (nm)
    pub max_wavelength_nm: u32,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 115200,
            settle_ms: 70,
            tuning_settle_ms: 2000,
            min_wavelength_nm: 680,
            max_wavelength_nm: 1300,
        }
    }
}

impl InsightConfig {
    /// Transport timing derived from this configuration.
    pub fn transport(&self) -> TransportConfig {
        TransportConfig::with_settle(Duration::from_millis(self.settle_ms))
    }

    /// Semantic validation.
    pub fn validate(&self) -> AppResult<()> {
        if self.min_wavelength_nm >= self.max_wavelength_nm {
            return Err(DaqError::Configuration(format!(
                "laser wavelength range {}..={} is empty",
                self.min_wavelength_nm, self.max_wavelength_nm
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Faults and status
// =============================================================================

/// Why a laser operation did not complete.
#[derive(Debug, Error)]
pub enum LaserFault {
    /// Interlock, warning or fault bit set.
    #[error("{0}")]
    Operation(#[from] OperationError),
    /// Requested wavelength was not confirmed.
    #[error("{0}")]
    Tuning(#[from] TuningError),
    /// DeepSee target outside the bounds for the current wavelength.
    #[error("DeepSee position {requested} outside {min}..={max}")]
    DsmOutOfRange {
        /// Requested position.
        requested: f64,
        /// Lower bound reported by the laser.
        min: f64,
        /// Upper bound reported by the laser.
        max: f64,
    },
    /// Transport failure or unparsable reply.
    #[error("{0}")]
    Daq(#[from] DaqError),
}

impl LaserFault {
    /// Status message in the form operators see, e.g.
    /// "Operation error turning on: Keyswitch interlock open. Laser forced off."
    fn describe(&self, operation: &str) -> String {
        match self {
            Self::Operation(e) => format!("Operation error {operation}: {e}"),
            Self::Tuning(e) => e.to_string(),
            other => format!("Error {operation}: {other}"),
        }
    }
}

/// Slow-changing diode and environment readings.
///
/// Fields stay `None` until the first successful read and keep their last
/// good value when a later read cannot be parsed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    /// Diode 1 operating hours.
    pub diode1_hours: Option<f64>,
    /// Diode 2 operating hours.
    pub diode2_hours: Option<f64>,
    /// Diode 1 temperature (°C).
    pub diode1_temperature: Option<f64>,
    /// Diode 2 temperature (°C).
    pub diode2_temperature: Option<f64>,
    /// Diode 1 current (A).
    pub diode1_current: Option<f64>,
    /// Diode 2 current (A).
    pub diode2_current: Option<f64>,
    /// Head humidity (%).
    pub humidity: Option<f64>,
}

/// Cached view of the laser.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LaserStatus {
    /// Last confirmed OPO wavelength (nm).
    pub wavelength_nm: u32,
    /// Last `*STB?` value.
    pub status_word: StatusWord,
    /// Last DeepSee motor position.
    pub dsm_position: f64,
    /// DeepSee lower bound at the current wavelength.
    pub dsm_min: f64,
    /// DeepSee upper bound at the current wavelength.
    pub dsm_max: f64,
    /// Diode and humidity readings.
    pub diagnostics: Diagnostics,
    /// Last decoded fault history.
    pub fault_history: Vec<FaultRecord>,
    /// Fault bit reported by the last error check, if any.
    pub active_fault: Option<String>,
}

impl LaserStatus {
    /// Run state projected from the status word.
    pub fn run_state(&self) -> RunState {
        self.status_word.run_state()
    }

    /// Main shutter projected from the status word.
    pub fn main_shutter_open(&self) -> bool {
        self.status_word.main_shutter_open()
    }

    /// Fixed shutter projected from the status word.
    pub fn fixed_shutter_open(&self) -> bool {
        self.status_word.fixed_shutter_open()
    }
}

/// Parse a bare numeric reply, tolerating a trailing unit ("800nm", "45%").
fn parse_number(command: &str, line: &str) -> AppResult<f64> {
    let value = line
        .trim()
        .trim_end_matches(|c: char| c.is_ascii_alphabetic() || c == '%' || c == ' ');
    match value.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(DaqError::malformed(command, line)),
    }
}

fn parse_wavelength(command: &str, line: &str) -> AppResult<u32> {
    let value = parse_number(command, line)?;
    if value.fract() != 0.0 || value < 0.0 || value > f64::from(u32::MAX) {
        return Err(DaqError::malformed(command, line));
    }
    // Checked integral and in range above.
    Ok(value as u32)
}

// =============================================================================
// InsightDriver
// =============================================================================

/// Driver for the Spectra-Physics InSight DS+.
pub struct InsightDriver {
    transport: Mutex<SerialTransport>,
    config: InsightConfig,
    status: RwLock<LaserStatus>,
    log: ActionLog,
}

impl std::fmt::Debug for InsightDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsightDriver")
            .field("status", &*self.status.read())
            .finish()
    }
}

impl InsightDriver {
    /// Open the configured port and read initial wavelength, DeepSee state and
    /// diagnostics.
    ///
    /// # Errors
    /// [`DaqError::MissingPort`] when no port is configured, [`DaqError::Io`]
    /// when the port cannot be opened.
    #[instrument(skip(config), fields(port = %config.port), err)]
    pub async fn connect(config: &InsightConfig) -> AppResult<Self> {
        config.validate()?;
        let transport =
            SerialTransport::connect(&config.port, config.baud_rate, "InSight laser", config.transport())
                .await?;
        Ok(Self::with_transport(transport, config).await)
    }

    /// Build on an already-open transport (hardware port or simulator).
    pub async fn with_transport(transport: SerialTransport, config: &InsightConfig) -> Self {
        let driver = Self {
            transport: Mutex::new(transport),
            config: config.clone(),
            status: RwLock::new(LaserStatus::default()),
            log: ActionLog::new("InSight laser"),
        };
        driver.initial_read().await;
        driver
    }

    async fn initial_read(&self) {
        if let Err(e) = self.wavelength().await {
            warn!("Initial wavelength read failed: {}", e);
        }
        if let Err(e) = self.dsm_position().await {
            warn!("Initial DeepSee position read failed: {}", e);
        }
        if let Err(e) = self.dsm_bounds().await {
            warn!("Initial DeepSee bounds read failed: {}", e);
        }
        if let Err(e) = self.read_diode_hours().await {
            warn!("Initial diode hours read failed: {}", e);
        }
        if let Err(e) = self.read_diagnostics().await {
            warn!("Initial diagnostics read failed: {}", e);
        }
    }

    /// Driver configuration.
    pub fn config(&self) -> &InsightConfig {
        &self.config
    }

    /// Snapshot of the cached laser state.
    pub fn status(&self) -> LaserStatus {
        self.status.read().clone()
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

    async fn ask(&self, command: &str) -> AppResult<String> {
        self.transport.lock().await.query(command).await
    }

    // -------------------------------------------------------------------------
    // State and errors
    // -------------------------------------------------------------------------

    /// Read the status word. Run state and shutter flags are derived from it.
    #[instrument(skip(self), err)]
    pub async fn query_state(&self) -> AppResult<StatusWord> {
        let mut port = self.transport.lock().await;
        self.query_state_on(&mut port).await
    }

    async fn query_state_on(&self, port: &mut SerialTransport) -> AppResult<StatusWord> {
        const COMMAND: &str = "*STB?";
        let reply = port.query(COMMAND).await?;
        let word = reply
            .trim()
            .parse::<u32>()
            .map(StatusWord)
            .map_err(|_| {
                warn!("Status word unreadable, keeping last known state: {:?}", reply);
                DaqError::malformed(COMMAND, reply.as_str())
            })?;
        self.status.write().status_word = word;
        Ok(word)
    }

    /// Re-derive state and test the fault and interlock bits.
    ///
    /// Returns the status word when no bit is set.
    pub async fn check_errors(&self) -> Result<StatusWord, LaserFault> {
        let mut port = self.transport.lock().await;
        self.check_errors_on(&mut port).await
    }

    async fn check_errors_on(&self, port: &mut SerialTransport) -> Result<StatusWord, LaserFault> {
        let word = self.query_state_on(port).await?;
        let fault = word.operation_error();
        self.status.write().active_fault = fault.as_ref().map(|e| e.message.clone());
        match fault {
            Some(err) => Err(err.into()),
            None => Ok(word),
        }
    }

    /// Read and decode the fault history buffer.
    ///
    /// Unknown codes decode to "unknown code N".
    #[instrument(skip(self), err)]
    pub async fn read_fault_history(&self) -> AppResult<Vec<FaultRecord>> {
        match self.ask("READ:AHIS?").await {
            Ok(line) => {
                let records = decode_history(&line);
                self.status.write().fault_history = records.clone();
                self.log.success("Read from history buffer.");
                Ok(records)
            }
            Err(e) => {
                self.log
                    .failure(format!("Error while reading history: {e}"));
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Wavelength
    // -------------------------------------------------------------------------

    /// Query the current OPO wavelength.
    pub async fn wavelength(&self) -> AppResult<u32> {
        const COMMAND: &str = "WAVelength?";
        let reply = self.ask(COMMAND).await?;
        let wavelength = parse_wavelength(COMMAND, &reply)?;
        self.status.write().wavelength_nm = wavelength;
        Ok(wavelength)
    }

    /// Tune the OPO to `wavelength_nm` and confirm.
    ///
    /// The DeepSee position is refreshed afterwards since it follows the
    /// wavelength.
    #[instrument(skip(self))]
    pub async fn set_wavelength(&self, wavelength_nm: u32) -> ActionOutcome {
        match self.try_set_wavelength(wavelength_nm).await {
            Ok((wavelength, dsm)) => self.log.success(format!(
                "Wavelength changed to: {wavelength}. DSM position {dsm}"
            )),
            Err(fault) => self.log.failure(fault.describe("while changing wavelength")),
        }
    }

    async fn try_set_wavelength(&self, wavelength_nm: u32) -> Result<(u32, f64), LaserFault> {
        if !(self.config.min_wavelength_nm..=self.config.max_wavelength_nm).contains(&wavelength_nm)
        {
            return Err(TuningError {
                requested: wavelength_nm,
                reported: None,
            }
            .into());
        }

        {
            let mut port = self.transport.lock().await;
            let settle = port.config().settle + Duration::from_millis(self.config.tuning_settle_ms);
            port.write_line_settled(&format!("WAVelength {wavelength_nm}"), settle)
                .await?;
            self.check_errors_on(&mut port).await?;
        }

        let reported = self.wavelength().await?;
        if reported != wavelength_nm {
            return Err(TuningError {
                requested: wavelength_nm,
                reported: Some(reported),
            }
            .into());
        }

        let dsm = self.dsm_position().await?;
        Ok((reported, dsm))
    }

    // -------------------------------------------------------------------------
    // Shutters and emission
    // -------------------------------------------------------------------------

    /// Open or close the main (tunable) shutter.
    #[instrument(skip(self))]
    pub async fn set_main_shutter(&self, open: bool) -> ActionOutcome {
        self.simple(&format!("SHUTter {}", u8::from(open)), "while operating shutter")
            .await
            .map_or_else(
                |msg| self.log.failure(msg),
                |_| self.log.success(format!("Main shutter {}", shutter_word(open))),
            )
    }

    /// Open or close the fixed (1040 nm) shutter.
    #[instrument(skip(self))]
    pub async fn set_fixed_shutter(&self, open: bool) -> ActionOutcome {
        self.simple(&format!("IRSHUTter {}", u8::from(open)), "while operating shutter")
            .await
            .map_or_else(
                |msg| self.log.failure(msg),
                |_| self.log.success(format!("Fixed shutter {}", shutter_word(open))),
            )
    }

    /// Turn emission on.
    #[instrument(skip(self))]
    pub async fn turn_on(&self) -> ActionOutcome {
        match self.simple("ON", "turning on").await {
            Ok(_) => self.log.success("Laser turning on."),
            Err(msg) => self.log.failure(msg),
        }
    }

    /// Turn emission off (hibernate).
    #[instrument(skip(self))]
    pub async fn turn_off(&self) -> ActionOutcome {
        match self.simple("OFF", "turning off").await {
            Ok(_) => self.log.success("Laser entering hibernate mode."),
            Err(msg) => self.log.failure(msg),
        }
    }

    /// Write a set command and check errors; failures come back described.
    async fn simple(&self, command: &str, operation: &str) -> Result<StatusWord, String> {
        let mut port = self.transport.lock().await;
        let result = async {
            port.write_line(command).await?;
            self.check_errors_on(&mut port).await
        }
        .await;
        result.map_err(|fault: LaserFault| fault.describe(operation))
    }

    // -------------------------------------------------------------------------
    // DeepSee
    // -------------------------------------------------------------------------

    /// Query the DeepSee motor position.
    pub async fn dsm_position(&self) -> AppResult<f64> {
        const COMMAND: &str = "CONT:DSMPOS?";
        let position = parse_number(COMMAND, &self.ask(COMMAND).await?)?;
        self.status.write().dsm_position = position;
        Ok(position)
    }

    /// Query the DeepSee bounds for the current wavelength.
    pub async fn dsm_bounds(&self) -> AppResult<(f64, f64)> {
        let min = parse_number("CONT:SLMIN?", &self.ask("CONT:SLMIN?").await?)?;
        let max = parse_number("CONT:SLMAX?", &self.ask("CONT:SLMAX?").await?)?;
        let mut status = self.status.write();
        status.dsm_min = min;
        status.dsm_max = max;
        Ok((min, max))
    }

    /// Move the DeepSee motor, refusing targets outside the current bounds.
    #[instrument(skip(self))]
    pub async fn set_dsm_position(&self, position: f64) -> ActionOutcome {
        match self.try_set_dsm_position(position).await {
            Ok(reported) => self.log.success(format!("DSMPOS set to {reported}")),
            Err(fault) => self.log.failure(fault.describe("while setting DSMPOS")),
        }
    }

    async fn try_set_dsm_position(&self, position: f64) -> Result<f64, LaserFault> {
        let (min, max) = self.dsm_bounds().await?;
        if !(min..=max).contains(&position) {
            return Err(LaserFault::DsmOutOfRange {
                requested: position,
                min,
                max,
            });
        }
        {
            let mut port = self.transport.lock().await;
            port.write_line(&format!("CONT:DSMPOS {position}")).await?;
            self.check_errors_on(&mut port).await?;
        }
        Ok(self.dsm_position().await?)
    }

    // -------------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------------

    /// Read diode operating hours.
    pub async fn read_diode_hours(&self) -> AppResult<Diagnostics> {
        let d1 = self.read_reading("READ:PLASer:DIODe1:HOURS?").await?;
        let d2 = self.read_reading("READ:PLASer:DIODe2:HOURS?").await?;
        let mut status = self.status.write();
        let diag = &mut status.diagnostics;
        diag.diode1_hours = d1.or(diag.diode1_hours);
        diag.diode2_hours = d2.or(diag.diode2_hours);
        Ok(diag.clone())
    }

    /// Read diode temperatures and currents and the head humidity.
    #[instrument(skip(self), err)]
    pub async fn read_diagnostics(&self) -> AppResult<Diagnostics> {
        let t1 = self.read_reading("READ:PLASer:DIODe1:TEMPerature?").await?;
        let t2 = self.read_reading("READ:PLASer:DIODe2:TEMPerature?").await?;
        let humidity = self.read_reading("READ:HUMidity?").await?;
        let c1 = self.read_reading("READ:PLASer:DIODe1:CURRent?").await?;
        let c2 = self.read_reading("READ:PLASer:DIODe2:CURRent?").await?;

        let mut status = self.status.write();
        let diag = &mut status.diagnostics;
        diag.diode1_temperature = t1.or(diag.diode1_temperature);
        diag.diode2_temperature = t2.or(diag.diode2_temperature);
        diag.humidity = humidity.or(diag.humidity);
        diag.diode1_current = c1.or(diag.diode1_current);
        diag.diode2_current = c2.or(diag.diode2_current);
        Ok(diag.clone())
    }

    /// One diagnostic reading; `None` if the reply could not be parsed.
    async fn read_reading(&self, command: &str) -> AppResult<Option<f64>> {
        let reply = self.ask(command).await?;
        match parse_number(command, &reply) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                warn!("Keeping last good reading: {}", e);
                Ok(None)
            }
        }
    }
}

fn shutter_word(open: bool) -> &'static str {
    if open {
        "opened."
    } else {
        "closed."
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct Head {
        wavelength: u32,
        stb: u32,
        history: &'static str,
        refuse_tuning: bool,
    }

    fn scripted(head: Arc<parking_lot::Mutex<Head>>) -> SerialTransport {
        let (host, device) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let (reader, mut writer) = tokio::io::split(host);
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let reply = {
                    let mut head = head.lock();
                    match line.trim() {
                        "WAVelength?" => Some(head.wavelength.to_string()),
                        "*STB?" => Some(head.stb.to_string()),
                        "READ:AHIS?" => Some(head.history.to_string()),
                        "CONT:DSMPOS?" => Some(format!("{}", f64::from(head.wavelength) / 20.0)),
                        "CONT:SLMIN?" => Some("10.0".to_string()),
                        "CONT:SLMAX?" => Some("90.0".to_string()),
                        "READ:HUMidity?" => Some("4.5%".to_string()),
                        l if l.starts_with("READ:PLASer") => Some("21.5".to_string()),
                        l if l.starts_with("WAVelength ") => {
                            if !head.refuse_tuning {
                                head.wavelength = l[11..].parse().unwrap_or(head.wavelength);
                            }
                            None
                        }
                        "SHUTter 1" => {
                            head.stb |= 0x4;
                            None
                        }
                        _ => None,
                    }
                };
                if let Some(reply) = reply {
                    if writer.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        });
        SerialTransport::from_stream(
            "scripted",
            Box::new(device),
            TransportConfig::with_settle(Duration::from_millis(1))
                .read_timeout(Duration::from_millis(100)),
        )
    }

    fn test_config() -> InsightConfig {
        InsightConfig {
            tuning_settle_ms: 1,
            ..Default::default()
        }
    }

    fn head(stb: u32) -> Arc<parking_lot::Mutex<Head>> {
        Arc::new(parking_lot::Mutex::new(Head {
            wavelength: 800,
            stb,
            history: "000",
            refuse_tuning: false,
        }))
    }

    #[tokio::test]
    async fn initial_read_fills_cache() {
        let driver = InsightDriver::with_transport(scripted(head(50 << 16)), &test_config()).await;
        let status = driver.status();
        assert_eq!(status.wavelength_nm, 800);
        assert_eq!(status.dsm_position, 40.0);
        assert_eq!((status.dsm_min, status.dsm_max), (10.0, 90.0));
        assert_eq!(status.diagnostics.humidity, Some(4.5));
        assert_eq!(status.diagnostics.diode2_hours, Some(21.5));
    }

    #[tokio::test]
    async fn tuning_is_confirmed() {
        let driver = InsightDriver::with_transport(scripted(head(50 << 16)), &test_config()).await;
        let outcome = driver.set_wavelength(1000).await;
        assert!(outcome.ok, "{}", outcome.message);
        assert_eq!(outcome.message, "Wavelength changed to: 1000. DSM position 50");
        assert_eq!(driver.status().wavelength_nm, 1000);
    }

    #[tokio::test]
    async fn unconfirmed_tuning_is_a_tuning_error() {
        let h = head(50 << 16);
        h.lock().refuse_tuning = true;
        let driver = InsightDriver::with_transport(scripted(h), &test_config()).await;

        let outcome = driver.set_wavelength(1000).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.message, "Wavelength not changed. Invalid wavelength.");
        assert_eq!(driver.status().wavelength_nm, 800);
    }

    #[tokio::test]
    async fn out_of_range_wavelength_is_rejected_locally() {
        let driver = InsightDriver::with_transport(scripted(head(50 << 16)), &test_config()).await;
        let outcome = driver.set_wavelength(1500).await;
        assert_eq!(outcome.message, "Wavelength not changed. Invalid wavelength.");
    }

    #[tokio::test]
    async fn interlock_is_reported_as_operation_error() {
        let driver =
            InsightDriver::with_transport(scripted(head(0x0000_0400)), &test_config()).await;
        let outcome = driver.turn_on().await;
        assert!(!outcome.ok);
        assert_eq!(
            outcome.message,
            "Operation error turning on: Keyswitch interlock open. Laser forced off."
        );
        assert_eq!(
            driver.status().active_fault.as_deref(),
            Some("Keyswitch interlock open. Laser forced off.")
        );
    }

    #[tokio::test]
    async fn shutter_flag_follows_status_word() {
        let driver = InsightDriver::with_transport(scripted(head(50 << 16)), &test_config()).await;
        assert!(!driver.status().main_shutter_open());

        let outcome = driver.set_main_shutter(true).await;
        assert_eq!(outcome.message, "Main shutter opened.");
        assert!(driver.status().main_shutter_open());
        assert_eq!(driver.status().run_state(), RunState::Run);
    }

    #[tokio::test]
    async fn unknown_fault_code_does_not_fail() {
        let h = head(50 << 16);
        h.lock().history = "000 999";
        let driver = InsightDriver::with_transport(scripted(h), &test_config()).await;

        let records = driver.read_fault_history().await.unwrap();
        assert_eq!(records[1].description, "unknown code 999");
        assert_eq!(driver.last_action(), "Read from history buffer.");
    }

    #[tokio::test]
    async fn dsm_target_outside_bounds_is_rejected() {
        let driver = InsightDriver::with_transport(scripted(head(50 << 16)), &test_config()).await;
        let outcome = driver.set_dsm_position(95.0).await;
        assert!(!outcome.ok);
        assert!(outcome.message.contains("outside 10..=90"));
    }

    #[tokio::test]
    async fn state_query_is_idempotent() {
        let driver = InsightDriver::with_transport(scripted(head(25 << 16)), &test_config()).await;
        let first = driver.query_state().await.unwrap();
        let second = driver.query_state().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.run_state(), RunState::ReadyToTurnOn);
    }

    #[test]
    fn numbers_with_units_parse() {
        assert_eq!(parse_number("WAVelength?", "800nm").unwrap(), 800.0);
        assert!(parse_number("READ:HUMidity?", "").is_err());
        assert!(parse_wavelength("WAVelength?", "800.5").is_err());
    }
}
