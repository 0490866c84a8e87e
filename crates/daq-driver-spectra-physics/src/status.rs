//! InSight status word, fault masks and fault-code history.
//!
//! `*STB?` returns one decimal integer. Everything the driver reports about
//! run state and shutters is a projection of that word; nothing here is ever
//! set directly.

use serde::Serialize;
use thiserror::Error;

/// Bits 16..22 of the status word hold the run-state value.
pub const STATE_MASK: u32 = 0x007F_0000;
/// Main (tunable) shutter open.
pub const MAIN_SHUTTER_BIT: u32 = 0x0000_0004;
/// Fixed (1040 nm) shutter open.
pub const FIXED_SHUTTER_BIT: u32 = 0x0000_0008;

/// Fault and interlock bits, in the order they are tested.
const OPERATION_ERRORS: [(u32, &str); 6] = [
    (0x0000_0200, "CDRH interlock open. Laser forced off."),
    (0x0000_0400, "Keyswitch interlock open. Laser forced off."),
    (0x0000_0800, "Power supply interlock open. Laser forced off."),
    (0x0000_1000, "Internal interlock open. Laser forced off."),
    (0x0000_4000, "Warning. Check history."),
    (0x0000_8000, "Fault. Check history."),
];

/// Fault codes reported by `READ:AHIS?`.
const FAULT_CODES: [(&str, &str); 17] = [
    ("000", "Normal operation."),
    ("056", "Fault: Hardware timeout. Notify S-P if it continues."),
    ("066", "Fault: Software timeout. Speak with system operator."),
    ("088", "Fault: Diode thermistor short. Contact S-P."),
    ("089", "Fault: Diode thermistor open. Contact S-P."),
    ("090", "Fault: Diodes too hot (T>30).  Check cooling system."),
    ("091", "Fault: Diodes warm (T>27).  Check cooling system."),
    ("092", "Fault: Diodes cold (T<17). Check cooling system."),
    ("117", "Fault: Internal interlock opened. Contact S-P."),
    ("118", "Fault: CDRH interlock open."),
    ("119", "Fault: Power supply interlock. Check cable."),
    ("120", "Fault: Key switch interlock. Turn key."),
    ("129", "Fault: Very high humidity. Change purge cartridge."),
    ("130", "Warning: High humidity. Change purge cartridge soon."),
    ("481", "Fault: Slow diode ramp. Contact S-P."),
    ("482", "Fault: Low fs osc power. Contact S-P."),
    ("483", "Fault: low FTO power. Try different wavelengths. Contact S-P."),
];

// =============================================================================
// Run state
// =============================================================================

/// Laser run state decoded from the 7-bit state field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RunState {
    /// Value below 25.
    Initializing,
    /// Exactly 25.
    ReadyToTurnOn,
    /// 26..50: turning on and/or optimizing.
    Optimizing,
    /// Exactly 50.
    Run,
    /// 51..60
    MovingToAlign,
    /// Exactly 60.
    Align,
    /// 61..70
    ExitingAlign,
    /// 70 and above.
    Reserved,
}

impl RunState {
    /// Decode the state field value.
    pub fn from_value(value: u8) -> Self {
        match value {
            0..=24 => Self::Initializing,
            25 => Self::ReadyToTurnOn,
            26..=49 => Self::Optimizing,
            50 => Self::Run,
            51..=59 => Self::MovingToAlign,
            60 => Self::Align,
            61..=69 => Self::ExitingAlign,
            _ => Self::Reserved,
        }
    }

    /// Operator-facing label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::ReadyToTurnOn => "Ready to turn on",
            Self::Optimizing => "Turning on and/or optimizing",
            Self::Run => "RUN",
            Self::MovingToAlign => "Moving to Align mode",
            Self::Align => "Align mode",
            Self::ExitingAlign => "Exiting Align mode",
            Self::Reserved => "Reserved",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// =============================================================================
// Status word
// =============================================================================

/// Raw `*STB?` value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusWord(pub u32);

impl StatusWord {
    /// The 7-bit state field.
    pub fn state_value(&self) -> u8 {
        // Masked to 7 bits, so the cast cannot truncate.
        ((self.0 & STATE_MASK) >> 16) as u8
    }

    /// Decoded run state.
    pub fn run_state(&self) -> RunState {
        RunState::from_value(self.state_value())
    }

    /// Main shutter open.
    pub fn main_shutter_open(&self) -> bool {
        self.0 & MAIN_SHUTTER_BIT != 0
    }

    /// Fixed shutter open.
    pub fn fixed_shutter_open(&self) -> bool {
        self.0 & FIXED_SHUTTER_BIT != 0
    }

    /// First fault or interlock bit that is set, if any.
    pub fn operation_error(&self) -> Option<OperationError> {
        OPERATION_ERRORS
            .iter()
            .find(|(mask, _)| self.0 & mask != 0)
            .map(|(mask, message)| OperationError {
                mask: *mask,
                message: (*message).to_string(),
            })
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Interlock, warning or fault bit set in the status word.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct OperationError {
    /// The bit that matched.
    pub mask: u32,
    /// Description of that bit.
    pub message: String,
}

impl OperationError {
    /// Whether the condition forced emission off.
    pub fn is_interlock(&self) -> bool {
        self.mask <= 0x0000_1000
    }
}

/// The laser did not confirm the requested wavelength.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Wavelength not changed. Invalid wavelength.")]
pub struct TuningError {
    /// Wavelength asked for.
    pub requested: u32,
    /// Wavelength the laser reported afterwards, if it was read.
    pub reported: Option<u32>,
}

// =============================================================================
// Fault history
// =============================================================================

/// One decoded entry of the fault history buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultRecord {
    /// Code as reported.
    pub code: String,
    /// Table description, or "unknown code N".
    pub description: String,
}

impl std::fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.description)
    }
}

/// Describe a single fault code.
pub fn describe_fault(code: &str) -> String {
    FAULT_CODES
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, text)| (*text).to_string())
        .unwrap_or_else(|| format!("unknown code {code}"))
}

/// Decode a space-separated `READ:AHIS?` reply.
pub fn decode_history(line: &str) -> Vec<FaultRecord> {
    line.split_whitespace()
        .map(|code| FaultRecord {
            code: code.to_string(),
            description: describe_fault(code),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_state_thresholds() {
        assert_eq!(RunState::from_value(0), RunState::Initializing);
        assert_eq!(RunState::from_value(24), RunState::Initializing);
        assert_eq!(RunState::from_value(25), RunState::ReadyToTurnOn);
        assert_eq!(RunState::from_value(30), RunState::Optimizing);
        assert_eq!(RunState::from_value(50), RunState::Run);
        assert_eq!(RunState::from_value(55), RunState::MovingToAlign);
        assert_eq!(RunState::from_value(60), RunState::Align);
        assert_eq!(RunState::from_value(65), RunState::ExitingAlign);
        assert_eq!(RunState::from_value(70), RunState::Reserved);
        assert_eq!(RunState::from_value(127), RunState::Reserved);
    }

    #[test]
    fn status_word_projections() {
        let word = StatusWord((50 << 16) | MAIN_SHUTTER_BIT);
        assert_eq!(word.state_value(), 50);
        assert_eq!(word.run_state(), RunState::Run);
        assert!(word.main_shutter_open());
        assert!(!word.fixed_shutter_open());
        assert!(word.operation_error().is_none());
    }

    #[test]
    fn first_fault_bit_wins() {
        let word = StatusWord(0x0000_0400 | 0x0000_8000);
        let err = word.operation_error().unwrap();
        assert_eq!(err.message, "Keyswitch interlock open. Laser forced off.");
        assert!(err.is_interlock());

        let warning = StatusWord(0x0000_4000).operation_error().unwrap();
        assert_eq!(warning.to_string(), "Warning. Check history.");
        assert!(!warning.is_interlock());
    }

    #[test]
    fn every_fault_bit_is_decoded() {
        for (mask, message) in OPERATION_ERRORS {
            assert_eq!(StatusWord(mask).operation_error().unwrap().message, message);
        }
    }

    #[test]
    fn history_decodes_known_and_unknown_codes() {
        let records = decode_history("000 118 777");
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].description, "Normal operation.");
        assert_eq!(records[1].description, "Fault: CDRH interlock open.");
        assert_eq!(records[2].description, "unknown code 777");
        assert_eq!(records[2].to_string(), "777: unknown code 777");
    }

    #[test]
    fn empty_history_is_empty() {
        assert!(decode_history("").is_empty());
    }
}
