//! Serial Port Abstractions for Driver Crates
//!
//! This module provides the shared line-oriented command/response channel used
//! by every instrument driver in the workspace.
//!
//! # Feature Flag
//!
//! Opening real hardware ports requires the `serial` feature:
//!
//! ```toml
//! [dependencies]
//! daq-core = { path = "../daq-core", features = ["serial"] }
//! ```
//!
//! # Types
//!
//! - [`SerialPortIO`]: Trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: Type-erased boxed serial port
//! - [`TransportConfig`]: Settle time, read timeout and line terminator
//! - [`SerialTransport`]: The device connection (write + settle, bounded line read)
//!
//! # Contract
//!
//! - `write_line` appends the terminator and then waits for the settle time.
//! - `read_line` returns one trimmed line, or an empty string when nothing
//!   arrived inside the read timeout. Callers decide whether an empty line is
//!   a malformed response; the transport never retries.
//!
//! # Example
//!
//! ```rust,ignore
//! use daq_core::serial::{SerialTransport, TransportConfig};
//!
//! let config = TransportConfig::with_settle(Duration::from_millis(50));
//! let mut transport = SerialTransport::connect("/dev/ttyUSB0", 57600, "Delay stage", config).await?;
//! let reply = transport.query("1TP?").await?;
//! ```

use crate::error::{AppResult, DaqError};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace, warn};

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing and simulation)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types meeting the requirements
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

// =============================================================================
// Transport configuration
// =============================================================================

/// Timing and framing for one instrument connection.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Fixed wait after every write before a response may be read.
    pub settle: Duration,
    /// Upper bound on how long `read_line` waits for a complete line.
    pub read_timeout: Duration,
    /// Appended to every outgoing command.
    pub terminator: String,
}

impl TransportConfig {
    /// Newline-terminated transport whose read timeout equals the settle time.
    pub fn with_settle(settle: Duration) -> Self {
        Self {
            settle,
            read_timeout: settle,
            terminator: "\n".to_string(),
        }
    }

    /// Override the read timeout.
    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::with_settle(Duration::from_millis(100))
    }
}

/// Where a transport came from, so it can be reopened after `close`.
#[derive(Debug, Clone)]
struct PortSettings {
    baud_rate: u32,
    device_name: String,
}

// =============================================================================
// SerialTransport
// =============================================================================

/// Line-oriented command/response channel with a fixed settle time.
///
/// Owned exclusively by one driver; commands go out strictly in issue order.
/// The underlying stream is closed on [`SerialTransport::close`] or when the
/// transport is dropped.
pub struct SerialTransport {
    port_name: String,
    reader: Option<BufReader<DynSerial>>,
    pending: Vec<u8>,
    config: TransportConfig,
    settings: Option<PortSettings>,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port_name", &self.port_name)
            .field("open", &self.is_open())
            .field("config", &self.config)
            .finish()
    }
}

impl SerialTransport {
    /// Wrap an already-open stream.
    pub fn from_stream(
        port_name: impl Into<String>,
        stream: DynSerial,
        config: TransportConfig,
    ) -> Self {
        Self {
            port_name: port_name.into(),
            reader: Some(BufReader::new(stream)),
            pending: Vec::new(),
            config,
            settings: None,
        }
    }

    /// Open a hardware port (8N1, no flow control).
    ///
    /// # Errors
    ///
    /// [`DaqError::MissingPort`] if `port_path` is empty, [`DaqError::Io`] if
    /// the port cannot be opened.
    #[cfg(feature = "serial")]
    pub async fn connect(
        port_path: &str,
        baud_rate: u32,
        device_name: &str,
        config: TransportConfig,
    ) -> AppResult<Self> {
        if port_path.trim().is_empty() {
            return Err(DaqError::MissingPort {
                device: device_name.to_string(),
            });
        }
        let stream = open_serial_async(port_path, baud_rate, device_name).await?;
        let mut transport = Self::from_stream(port_path, Box::new(stream), config);
        transport.settings = Some(PortSettings {
            baud_rate,
            device_name: device_name.to_string(),
        });
        tracing::info!("{} port {} opened", device_name, port_path);
        Ok(transport)
    }

    /// Port identifier this transport talks to.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Timing configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Whether the stream is currently open.
    pub fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    /// Reopen a closed hardware port.
    ///
    /// Opening an already-open port is not an error: it is logged and the
    /// existing stream is kept.
    pub async fn open(&mut self) -> AppResult<()> {
        if self.is_open() {
            warn!("Serial port {} already open", self.port_name);
            return Ok(());
        }
        self.reopen().await
    }

    #[cfg(feature = "serial")]
    async fn reopen(&mut self) -> AppResult<()> {
        let settings = self
            .settings
            .clone()
            .ok_or(DaqError::SerialPortNotConnected)?;
        let stream =
            open_serial_async(&self.port_name, settings.baud_rate, &settings.device_name).await?;
        self.reader = Some(BufReader::new(Box::new(stream)));
        self.pending.clear();
        Ok(())
    }

    #[cfg(not(feature = "serial"))]
    async fn reopen(&mut self) -> AppResult<()> {
        Err(DaqError::SerialPortNotConnected)
    }

    /// Shut the stream down. Further commands fail with `SerialPortNotConnected`.
    pub async fn close(&mut self) -> AppResult<()> {
        if let Some(mut reader) = self.reader.take() {
            reader.get_mut().shutdown().await?;
            debug!("Serial port {} closed", self.port_name);
        }
        self.pending.clear();
        Ok(())
    }

    /// Write one command and wait the configured settle time.
    pub async fn write_line(&mut self, command: &str) -> AppResult<()> {
        let settle = self.config.settle;
        self.write_line_settled(command, settle).await
    }

    /// Write one command and wait `settle` instead of the configured settle time.
    ///
    /// Used when the instrument announces a longer processing time, e.g. the
    /// travel time of a stage move.
    pub async fn write_line_settled(&mut self, command: &str, settle: Duration) -> AppResult<()> {
        self.discard_stale().await;
        let line = format!("{}{}", command, self.config.terminator);
        let reader = self.reader.as_mut().ok_or(DaqError::SerialPortNotConnected)?;
        let writer = reader.get_mut();
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        trace!(port = %self.port_name, command, "serial write");
        tokio::time::sleep(settle).await;
        Ok(())
    }

    /// Read one line, trimmed. Returns an empty string if nothing complete
    /// arrived within the read timeout.
    pub async fn read_line(&mut self) -> AppResult<String> {
        let timeout = self.config.read_timeout;
        let reader = self.reader.as_mut().ok_or(DaqError::SerialPortNotConnected)?;

        let result = tokio::time::timeout(timeout, reader.read_until(b'\n', &mut self.pending)).await;
        match result {
            Ok(Ok(_)) if self.pending.ends_with(b"\n") => {
                let line = String::from_utf8_lossy(&self.pending).trim().to_string();
                self.pending.clear();
                trace!(port = %self.port_name, response = %line, "serial read");
                Ok(line)
            }
            // EOF or timeout: whatever partial data exists stays in `pending`
            // until the next write discards it.
            Ok(Ok(_)) => Ok(String::new()),
            Ok(Err(e)) => Err(DaqError::Io(e)),
            Err(_) => {
                debug!(port = %self.port_name, "no response within {:?}", timeout);
                Ok(String::new())
            }
        }
    }

    /// Write a query and read its single-line answer.
    pub async fn query(&mut self, command: &str) -> AppResult<String> {
        self.write_line(command).await?;
        self.read_line().await
    }

    /// Drop bytes that arrived after the previous exchange finished.
    async fn discard_stale(&mut self) -> usize {
        let Some(reader) = self.reader.as_mut() else {
            return 0;
        };
        let buffered = reader.buffer().len();
        Pin::new(&mut *reader).consume(buffered);
        let mut discarded = buffered + self.pending.len();
        self.pending.clear();
        discarded += drain_serial_buffer(reader.get_mut(), 0).await;
        if discarded > 0 {
            debug!(port = %self.port_name, "discarded {} stale bytes", discarded);
        }
        discarded
    }
}

// =============================================================================
// Serial Port Utilities
// =============================================================================

/// Open a serial port asynchronously using spawn_blocking.
///
/// Standard settings are applied: 8N1, no flow control.
///
/// # Errors
///
/// Returns an error if the port cannot be opened or spawn_blocking fails.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> AppResult<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                DaqError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!(
                        "Failed to open {} serial port {}: {}",
                        device_name_owned, port_path_owned, e
                    ),
                ))
            })
    })
    .await
    .map_err(|e| DaqError::Instrument(format!("spawn_blocking for serial port opening failed: {e}")))?
}

/// Drain stale data from a serial port buffer.
///
/// Reads and discards whatever is available until nothing more arrives within
/// `timeout_ms`. With `timeout_ms == 0` only data that is already buffered is
/// taken (at most one chunk).
///
/// # Returns
///
/// Total number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break, // EOF or no more data
            Ok(Ok(n)) => {
                total_discarded += n;
            }
            Ok(Err(_)) => break, // I/O error or WouldBlock, abort drain
            Err(_) => break,     // Timeout, no more immediate data
        }
        if remaining.is_zero() {
            break;
        }
    }

    total_discarded
}
