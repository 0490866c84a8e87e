//! Newport SMC-series single-axis controller protocol.
//!
//! Reference: SMC100 Single-Axis Motion Controller/Driver User's Manual
//!
//! Protocol Overview:
//! - Format: ASCII command/response over RS-232
//! - Commands: {Address}{Command}{Value}, e.g. "1PA5.000000"
//! - Queries are answered with the 3-character command prefix echoed in
//!   front of the value: "1TP?" -> "1TP5.000000"
//! - Set commands produce no response
//!
//! This module is pure encode/decode; nothing here touches a port.

use daq_core::error::{AppResult, DaqError};
use serde::Serialize;
use thiserror::Error;

/// Bits of the positioner error mask that are checked after a command.
///
/// Bit 4 is reserved by Newport and toggles during normal operation.
pub const POSITIONER_CHECK_MASK: u16 = 0b1111_1111_1110_1111;

/// Positioner error descriptions, most significant bit first.
const POSITIONER_ERRORS: [&str; 16] = [
    "Not used",
    "Not used",
    "Not used",
    "Not used",
    "Driver overheating",
    "Driver fault",
    "Not used",
    "Not used",
    "No parameters in memory",
    "Homing time out",
    "Not used",
    "Newport reserved",
    "RMS current limit",
    "Not used",
    "Positive end of run",
    "Negative end",
];

/// Letter reported by `TE` when the last command succeeded.
pub const NO_COMMAND_ERROR: char = '@';

// =============================================================================
// Commands
// =============================================================================

/// One controller command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StageCommand {
    /// `TS`: error mask and controller state.
    TellState,
    /// `TP?`: current position.
    TellPosition,
    /// `TE`: error letter of the last command.
    TellError,
    /// `PT<d>`: estimated travel time for a displacement of `d`.
    MotionTime(f64),
    /// `PA<x>`: move to absolute position `x`.
    MoveAbsolute(f64),
    /// `VA?`
    GetVelocity,
    /// `VA<v>`
    SetVelocity(f64),
    /// `AC?`
    GetAcceleration,
    /// `AC<a>`
    SetAcceleration(f64),
    /// `OR`: start the home search.
    Home,
    /// `ST`: stop motion.
    Stop,
    /// `MM0`: enter DISABLE.
    Disable,
    /// `MM1`: leave DISABLE.
    Enable,
}

impl StageCommand {
    /// Encode for controller address `axis` (without terminator).
    pub fn encode(&self, axis: u8) -> String {
        match self {
            Self::TellState => format!("{axis}TS"),
            Self::TellPosition => format!("{axis}TP?"),
            Self::TellError => format!("{axis}TE"),
            Self::MotionTime(d) => format!("{axis}PT{d:.6}"),
            Self::MoveAbsolute(x) => format!("{axis}PA{x:.6}"),
            Self::GetVelocity => format!("{axis}VA?"),
            Self::SetVelocity(v) => format!("{axis}VA{v:.6}"),
            Self::GetAcceleration => format!("{axis}AC?"),
            Self::SetAcceleration(a) => format!("{axis}AC{a:.6}"),
            Self::Home => format!("{axis}OR"),
            Self::Stop => format!("{axis}ST"),
            Self::Disable => format!("{axis}MM0"),
            Self::Enable => format!("{axis}MM1"),
        }
    }

    /// Whether the controller answers this command with a line.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            Self::TellState
                | Self::TellPosition
                | Self::TellError
                | Self::MotionTime(_)
                | Self::GetVelocity
                | Self::GetAcceleration
        )
    }
}

// =============================================================================
// Response parsing
// =============================================================================

/// Strip the echoed 3-character prefix from a reply.
pub fn payload<'a>(command: &str, line: &'a str) -> AppResult<&'a str> {
    match line.get(3..) {
        Some(rest) if !rest.trim().is_empty() => Ok(rest.trim()),
        _ => Err(DaqError::malformed(command, line)),
    }
}

/// Parse a numeric reply such as `1TP12.500000`.
pub fn parse_value(command: &str, line: &str) -> AppResult<f64> {
    let value: f64 = payload(command, line)?
        .parse()
        .map_err(|_| DaqError::malformed(command, line))?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(DaqError::malformed(command, line))
    }
}

/// Parse the reply to `TE` into its error letter.
pub fn parse_error_letter(command: &str, line: &str) -> AppResult<char> {
    let rest = payload(command, line)?;
    let mut chars = rest.chars();
    match (chars.next(), chars.next()) {
        (Some(letter), None) => Ok(letter),
        _ => Err(DaqError::malformed(command, line)),
    }
}

/// Decoded `TS` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateReply {
    /// Raw 16-bit positioner error mask.
    pub error_mask: u16,
    /// Two-character controller state code.
    pub state_code: String,
}

/// Parse the reply to `TS`: 4 hex characters of error mask, then 2 of state.
pub fn parse_state(command: &str, line: &str) -> AppResult<StateReply> {
    let rest = payload(command, line)?;
    let (mask, code) = match (rest.get(..4), rest.get(4..6)) {
        (Some(mask), Some(code)) if rest.len() == 6 => (mask, code),
        _ => return Err(DaqError::malformed(command, line)),
    };
    let error_mask =
        u16::from_str_radix(mask, 16).map_err(|_| DaqError::malformed(command, line))?;
    Ok(StateReply {
        error_mask,
        state_code: code.to_ascii_uppercase(),
    })
}

// =============================================================================
// Controller state
// =============================================================================

/// Controller state as reported by `TS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[allow(missing_docs)]
pub enum ControllerState {
    NotReferencedFromReset,
    NotReferencedFromHoming,
    NotReferencedFromConfiguration,
    NotReferencedFromDisable,
    NotReferencedFromReady,
    NotReferencedFromMoving,
    NotReferencedNoParameters,
    Configuration,
    Homing,
    Moving,
    ReadyFromHoming,
    ReadyFromMoving,
    ReadyFromDisable,
    DisableFromReady,
    DisableFromMoving,
}

impl ControllerState {
    /// Every state, in code order.
    pub const ALL: [ControllerState; 15] = [
        Self::NotReferencedFromReset,
        Self::NotReferencedFromHoming,
        Self::NotReferencedFromConfiguration,
        Self::NotReferencedFromDisable,
        Self::NotReferencedFromReady,
        Self::NotReferencedFromMoving,
        Self::NotReferencedNoParameters,
        Self::Configuration,
        Self::Homing,
        Self::Moving,
        Self::ReadyFromHoming,
        Self::ReadyFromMoving,
        Self::ReadyFromDisable,
        Self::DisableFromReady,
        Self::DisableFromMoving,
    ];

    /// Look up a two-character state code.
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.code().eq_ignore_ascii_case(code))
    }

    /// Two-character state code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotReferencedFromReset => "0A",
            Self::NotReferencedFromHoming => "0B",
            Self::NotReferencedFromConfiguration => "0C",
            Self::NotReferencedFromDisable => "0D",
            Self::NotReferencedFromReady => "0E",
            Self::NotReferencedFromMoving => "0F",
            Self::NotReferencedNoParameters => "10",
            Self::Configuration => "14",
            Self::Homing => "1E",
            Self::Moving => "28",
            Self::ReadyFromHoming => "32",
            Self::ReadyFromMoving => "33",
            Self::ReadyFromDisable => "34",
            Self::DisableFromReady => "3C",
            Self::DisableFromMoving => "3D",
        }
    }

    /// Manual description of the state.
    pub fn description(&self) -> &'static str {
        match self {
            Self::NotReferencedFromReset => "NOT REFERENCED from RESET.",
            Self::NotReferencedFromHoming => "NOT REFERENCED from HOMING.",
            Self::NotReferencedFromConfiguration => "NOT REFERENCED from CONFIGURATION.",
            Self::NotReferencedFromDisable => "NOT REFERENCED from DISABLE.",
            Self::NotReferencedFromReady => "NOT REFERENCED from READY.",
            Self::NotReferencedFromMoving => "NOT REFERENCED from MOVING.",
            Self::NotReferencedNoParameters => "NOT REFERENCED - NO PARAMETERS IN MEMORY.",
            Self::Configuration => "CONFIGURATION.",
            Self::Homing => "HOMING.",
            Self::Moving => "MOVING.",
            Self::ReadyFromHoming => "READY from HOMING.",
            Self::ReadyFromMoving => "READY from MOVING.",
            Self::ReadyFromDisable => "READY from DISABLE.",
            Self::DisableFromReady => "DISABLE from READY.",
            Self::DisableFromMoving => "DISABLE from MOVING.",
        }
    }

    /// Whether the stage will accept a move.
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            Self::ReadyFromHoming | Self::ReadyFromMoving | Self::ReadyFromDisable
        )
    }

    /// Whether the stage has lost its reference.
    pub fn is_not_referenced(&self) -> bool {
        self.code().starts_with('0') || *self == Self::NotReferencedNoParameters
    }
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

// =============================================================================
// Errors
// =============================================================================

/// The controller rejected the last command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CommandError {
    /// Letter reported by `TE`.
    pub code: char,
    /// Manual description of the letter.
    pub message: String,
}

impl CommandError {
    /// Decode a `TE` letter. Returns `None` for [`NO_COMMAND_ERROR`].
    pub fn from_code(code: char) -> Option<Self> {
        if code == NO_COMMAND_ERROR {
            return None;
        }
        let message = match code {
            'A' => "Unknown message code or floating point controller address",
            'B' => "Controller address not correct",
            'C' => "Parameter missing or out of range",
            'D' => "Command not allowed",
            'E' => "Home sequence already started.",
            'G' => "Displacement out of limits.",
            'H' => "Command not allowed in NOT REFERENCED state.",
            'I' => "Command not allowed in CONFIGURATION state.",
            'J' => "Command not allowed in DISABLE state.",
            'K' => "Command not allowed in READY state.",
            'L' => "Command not allowed in HOMING state.",
            'M' => "Command not allowed in MOVING state.",
            'N' => "Current position out of software limit.",
            'S' => "Communication Time Out.",
            'U' => "Error during EEPROM access.",
            'V' => "Error during command execution.",
            other => {
                return Some(Self {
                    code: other,
                    message: format!("Unknown command error code '{other}'"),
                })
            }
        };
        Some(Self {
            code,
            message: message.to_string(),
        })
    }

    /// Rejection raised locally for a target outside the travel range.
    pub fn displacement_out_of_limits() -> Self {
        Self {
            code: 'G',
            message: "Displacement out of limits.".to_string(),
        }
    }
}

/// The positioner reported one or more hardware faults.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct PositionerError {
    /// Bits that were decoded.
    pub bits: u16,
    /// Description of every set bit, most significant first, joined by ", ".
    pub message: String,
}

impl PositionerError {
    /// Decode every set bit of `bits`.
    pub fn from_bits(bits: u16) -> Self {
        let message = POSITIONER_ERRORS
            .iter()
            .enumerate()
            .filter(|(i, _)| bits & (1 << (15 - i)) != 0)
            .map(|(_, text)| *text)
            .collect::<Vec<_>>()
            .join(", ");
        Self { bits, message }
    }

    /// The fault carried by a raw `TS` mask, if any bit survives
    /// [`POSITIONER_CHECK_MASK`].
    pub fn check(error_mask: u16) -> Option<Self> {
        let masked = error_mask & POSITIONER_CHECK_MASK;
        (masked != 0).then(|| Self::from_bits(masked))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_encode_with_six_decimals() {
        assert_eq!(StageCommand::MoveAbsolute(12.5).encode(1), "1PA12.500000");
        assert_eq!(StageCommand::MotionTime(0.1).encode(1), "1PT0.100000");
        assert_eq!(StageCommand::TellState.encode(1), "1TS");
        assert_eq!(StageCommand::Enable.encode(1), "1MM1");
        assert_eq!(StageCommand::Disable.encode(1), "1MM0");
        assert!(!StageCommand::MoveAbsolute(0.0).expects_reply());
        assert!(StageCommand::TellPosition.expects_reply());
    }

    #[test]
    fn every_positioner_bit_decodes_alone() {
        for (i, expected) in POSITIONER_ERRORS.iter().enumerate() {
            let bit = 1u16 << (15 - i);
            let err = PositionerError::from_bits(bit);
            assert_eq!(err.message, *expected, "bit {}", 15 - i);
        }
    }

    #[test]
    fn positioner_bits_by_position() {
        assert_eq!(PositionerError::from_bits(1 << 11).message, "Driver overheating");
        assert_eq!(PositionerError::from_bits(1 << 6).message, "Homing time out");
        assert_eq!(PositionerError::from_bits(1 << 0).message, "Negative end");
    }

    #[test]
    fn multiple_positioner_bits_are_joined() {
        let err = PositionerError::from_bits((1 << 11) | (1 << 1));
        assert_eq!(err.message, "Driver overheating, Positive end of run");
    }

    #[test]
    fn reserved_bit_is_ignored_by_check() {
        assert!(PositionerError::check(0x0010).is_none());
        let err = PositionerError::check(0x0012).unwrap();
        assert_eq!(err.bits, 0x0002);
        assert_eq!(err.message, "Positive end of run");
    }

    #[test]
    fn every_command_code_decodes() {
        let table = [
            ('A', "Unknown message code or floating point controller address"),
            ('B', "Controller address not correct"),
            ('C', "Parameter missing or out of range"),
            ('D', "Command not allowed"),
            ('E', "Home sequence already started."),
            ('G', "Displacement out of limits."),
            ('H', "Command not allowed in NOT REFERENCED state."),
            ('I', "Command not allowed in CONFIGURATION state."),
            ('J', "Command not allowed in DISABLE state."),
            ('K', "Command not allowed in READY state."),
            ('L', "Command not allowed in HOMING state."),
            ('M', "Command not allowed in MOVING state."),
            ('N', "Current position out of software limit."),
            ('S', "Communication Time Out."),
            ('U', "Error during EEPROM access."),
            ('V', "Error during command execution."),
        ];
        for (code, message) in table {
            let err = CommandError::from_code(code).unwrap();
            assert_eq!(err.message, message);
            assert_eq!(err.to_string(), message);
        }
        assert!(CommandError::from_code(NO_COMMAND_ERROR).is_none());
    }

    #[test]
    fn unknown_command_code_does_not_panic() {
        let err = CommandError::from_code('Z').unwrap();
        assert_eq!(err.message, "Unknown command error code 'Z'");
    }

    #[test]
    fn state_reply_is_parsed() {
        let reply = parse_state("1TS", "1TS000033").unwrap();
        assert_eq!(reply.error_mask, 0);
        assert_eq!(reply.state_code, "33");
        assert_eq!(
            ControllerState::from_code(&reply.state_code),
            Some(ControllerState::ReadyFromMoving)
        );

        let reply = parse_state("1TS", "1TS08000A").unwrap();
        assert_eq!(reply.error_mask, 0x0800);
        assert_eq!(reply.state_code, "0A");
    }

    #[test]
    fn short_or_empty_replies_are_malformed() {
        assert!(matches!(
            parse_state("1TS", ""),
            Err(DaqError::MalformedResponse { .. })
        ));
        assert!(parse_state("1TS", "1TS0000").is_err());
        assert!(parse_state("1TS", "1TSZZZZ33").is_err());
        assert!(parse_value("1TP?", "1TP").is_err());
        assert!(parse_value("1TP?", "1TPabc").is_err());
        assert!(parse_error_letter("1TE", "1TE").is_err());
    }

    #[test]
    fn values_and_letters_are_parsed() {
        assert_eq!(parse_value("1TP?", "1TP-12.500000").unwrap(), -12.5);
        assert_eq!(parse_error_letter("1TE", "1TE@").unwrap(), '@');
        assert_eq!(parse_error_letter("1TE", "1TEG").unwrap(), 'G');
    }

    #[test]
    fn state_table_round_trips_codes() {
        for state in ControllerState::ALL {
            assert_eq!(ControllerState::from_code(state.code()), Some(state));
        }
        assert_eq!(ControllerState::from_code("99"), None);
        assert!(ControllerState::ReadyFromHoming.is_ready());
        assert!(ControllerState::NotReferencedFromReset.is_not_referenced());
        assert!(!ControllerState::Moving.is_not_referenced());
    }
}
