//! SMC controller simulator speaking the ASCII protocol over an in-memory pipe.
//!
//! Queries are answered with the usual `<axis><command><value>` echo; set
//! commands produce no reply. Rejected commands leave their letter for the
//! next `TE`, exactly like the controller, and `TE` clears it.
//!
//! Moves and home searches take the time the velocity profile gives them:
//! `TS` reports MOVING (`28`) or HOMING (`1E`) and `TP` the interpolated
//! position until the motion ends.

use crate::bench::OpticalBench;
use crate::mock_stage::VelocityProfile;
use daq_core::serial::{SerialTransport, TransportConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::Instant;

const READY_FROM_HOMING: &str = "32";
const READY_FROM_MOVING: &str = "33";
const READY_FROM_DISABLE: &str = "34";
const DISABLE_FROM_READY: &str = "3C";
const NOT_REFERENCED_FROM_RESET: &str = "0A";
const NOT_REFERENCED_FROM_HOMING: &str = "0B";
const HOMING: &str = "1E";
const MOVING: &str = "28";

/// Motion in progress.
#[derive(Debug, Clone, Copy)]
struct Motion {
    from: f64,
    to: f64,
    began: Instant,
    duration: Duration,
    homing: bool,
}

impl Motion {
    fn finished(&self, now: Instant) -> bool {
        now.duration_since(self.began) >= self.duration
    }

    fn position(&self, now: Instant) -> f64 {
        if self.finished(now) {
            return self.to;
        }
        let fraction = now.duration_since(self.began).as_secs_f64() / self.duration.as_secs_f64();
        self.from + (self.to - self.from) * fraction
    }
}

#[derive(Debug)]
struct SmcState {
    state_code: String,
    profile: VelocityProfile,
    motion: Option<Motion>,
    estimate_scale: f64,
    error_letter: char,
    positioner_mask: u16,
    travel_limit: f64,
    commands: Vec<String>,
}

/// Simulated SMC controller sharing the stage axis of an [`OpticalBench`].
#[derive(Debug, Clone)]
pub struct SimulatedStage {
    bench: OpticalBench,
    state: Arc<Mutex<SmcState>>,
}

impl SimulatedStage {
    /// A referenced controller in READY with ±100 mm of travel.
    pub fn new(bench: OpticalBench) -> Self {
        Self {
            bench,
            state: Arc::new(Mutex::new(SmcState {
                state_code: READY_FROM_HOMING.to_string(),
                profile: VelocityProfile::default(),
                motion: None,
                estimate_scale: 1.0,
                error_letter: '@',
                positioner_mask: 0,
                travel_limit: 100.0,
                commands: Vec::new(),
            })),
        }
    }

    /// Start NOT REFERENCED, as after power-up.
    pub fn unreferenced(self) -> Self {
        self.state.lock().state_code = NOT_REFERENCED_FROM_RESET.to_string();
        self
    }

    /// Replace the motion profile used for `PT` estimates and `VA?`/`AC?`.
    pub fn with_profile(self, profile: VelocityProfile) -> Self {
        self.state.lock().profile = profile;
        self
    }

    /// Answer `PT` with `scale` times the real travel time.
    pub fn with_travel_estimate(self, scale: f64) -> Self {
        self.state.lock().estimate_scale = scale;
        self
    }

    /// Report `mask` in the positioner error field of `TS` from now on.
    pub fn inject_positioner_fault(&self, mask: u16) {
        self.state.lock().positioner_mask = mask;
    }

    /// Force the reported state code, including codes the driver does not know.
    pub fn set_state_code(&self, code: &str) {
        self.state.lock().state_code = code.to_string();
    }

    /// Current state code.
    pub fn state_code(&self) -> String {
        let mut s = self.state.lock();
        self.advance(&mut s);
        s.state_code.clone()
    }

    /// Whether a move or home search is still under way.
    pub fn in_motion(&self) -> bool {
        let mut s = self.state.lock();
        self.advance(&mut s);
        s.motion.is_some()
    }

    /// Bring the bench and state code up to date with the motion in progress.
    fn advance(&self, s: &mut SmcState) {
        let Some(motion) = s.motion else {
            return;
        };
        let now = Instant::now();
        self.bench.set_stage_position(motion.position(now));
        if motion.finished(now) {
            s.motion = None;
            s.state_code = if motion.homing {
                READY_FROM_HOMING
            } else {
                READY_FROM_MOVING
            }
            .to_string();
        }
    }

    fn start_motion(&self, s: &mut SmcState, to: f64, homing: bool) {
        let from = self.bench.stage_position();
        s.motion = Some(Motion {
            from,
            to,
            began: Instant::now(),
            duration: s.profile.motion_time(to - from),
            homing,
        });
        s.state_code = if homing { HOMING } else { MOVING }.to_string();
        self.advance(s);
    }

    /// Every line received so far.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Spawn the simulator task and return the host end as a transport.
    ///
    /// The task ends when the transport is closed or dropped.
    pub fn connect(&self, config: TransportConfig) -> SerialTransport {
        let (host, device) = tokio::io::duplex(4096);
        let sim = self.clone();
        tokio::spawn(async move {
            let (reader, mut writer) = tokio::io::split(device);
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(reply) = sim.handle(line.trim()) {
                    if writer.write_all(format!("{reply}\r\n").as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        });
        SerialTransport::from_stream("sim:smc", Box::new(host), config)
    }

    /// Process one command line; returns the reply, if the command has one.
    pub fn handle(&self, line: &str) -> Option<String> {
        let split = line.find(|c: char| !c.is_ascii_digit())?;
        let (axis, rest) = line.split_at(split);
        let cut = rest.char_indices().nth(2).map_or(rest.len(), |(i, _)| i);
        let (mnemonic, arg) = rest.split_at(cut);
        let prefix = format!("{axis}{mnemonic}");

        let mut s = self.state.lock();
        s.commands.push(line.to_string());
        self.advance(&mut s);
        let ready = matches!(
            s.state_code.as_str(),
            READY_FROM_HOMING | READY_FROM_MOVING | READY_FROM_DISABLE
        );
        let value = || arg.parse::<f64>().ok().filter(|v| v.is_finite());

        match (mnemonic, arg) {
            ("TS", "") => Some(format!("{prefix}{:04X}{}", s.positioner_mask, s.state_code)),
            ("TE", "") => {
                let letter = std::mem::replace(&mut s.error_letter, '@');
                Some(format!("{prefix}{letter}"))
            }
            ("TP", "?") => Some(format!("{prefix}{:.6}", self.bench.stage_position())),
            ("VA", "?") => Some(format!("{prefix}{:.6}", s.profile.max_velocity)),
            ("AC", "?") => Some(format!("{prefix}{:.6}", s.profile.acceleration)),
            ("PT", _) => match value() {
                Some(d) => Some(format!(
                    "{prefix}{:.6}",
                    s.estimate_scale * s.profile.motion_time(d).as_secs_f64()
                )),
                None => {
                    s.error_letter = 'C';
                    None
                }
            },
            ("PA", _) => {
                match value() {
                    None => s.error_letter = 'C',
                    Some(_) if !ready => s.error_letter = not_allowed(&s.state_code),
                    Some(x) if x.abs() > s.travel_limit => s.error_letter = 'G',
                    Some(x) => self.start_motion(&mut s, x, false),
                }
                None
            }
            ("VA", _) | ("AC", _) => {
                match value() {
                    Some(v) if v > 0.0 => {
                        if mnemonic == "VA" {
                            s.profile.max_velocity = v;
                        } else {
                            s.profile.acceleration = v;
                        }
                    }
                    _ => s.error_letter = 'C',
                }
                None
            }
            ("OR", "") => {
                if s.state_code.starts_with('0') || s.state_code == "10" {
                    self.start_motion(&mut s, 0.0, true);
                } else {
                    s.error_letter = not_allowed(&s.state_code);
                }
                None
            }
            ("ST", "") => {
                if let Some(motion) = s.motion.take() {
                    s.state_code = if motion.homing {
                        NOT_REFERENCED_FROM_HOMING
                    } else {
                        READY_FROM_MOVING
                    }
                    .to_string();
                }
                None
            }
            ("MM", "0") => {
                if ready {
                    s.state_code = DISABLE_FROM_READY.to_string();
                } else {
                    s.error_letter = not_allowed(&s.state_code);
                }
                None
            }
            ("MM", "1") => {
                if s.state_code.starts_with("3C") || s.state_code.starts_with("3D") {
                    s.state_code = READY_FROM_DISABLE.to_string();
                } else {
                    s.error_letter = not_allowed(&s.state_code);
                }
                None
            }
            _ => {
                s.error_letter = 'A';
                None
            }
        }
    }
}

/// Error letter for a command refused in `state_code`.
fn not_allowed(state_code: &str) -> char {
    match state_code {
        c if c.starts_with('0') || c == "10" => 'H',
        "14" => 'I',
        "3C" | "3D" => 'J',
        "32" | "33" | "34" => 'K',
        "1E" => 'L',
        "28" => 'M',
        _ => 'D',
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queries_echo_their_prefix() {
        let bench = OpticalBench::default();
        bench.set_stage_position(1.5);
        let sim = SimulatedStage::new(bench);
        assert_eq!(sim.handle("1TS").as_deref(), Some("1TS000032"));
        assert_eq!(sim.handle("1TP?").as_deref(), Some("1TP1.500000"));
        assert_eq!(sim.handle("1VA?").as_deref(), Some("1VA5.000000"));
        assert_eq!(sim.handle("1TE").as_deref(), Some("1TE@"));
    }

    #[tokio::test(start_paused = true)]
    async fn move_takes_the_profile_travel_time() {
        let bench = OpticalBench::default();
        let sim = SimulatedStage::new(bench.clone());
        // 5 mm/s, 20 mm/s^2: 10 mm takes 2.25 s
        assert_eq!(sim.handle("1PT10.0").as_deref(), Some("1PT2.250000"));
        assert_eq!(sim.handle("1PA-10.000000"), None);
        assert_eq!(sim.handle("1TS").as_deref(), Some("1TS000028"));

        tokio::time::advance(Duration::from_millis(1125)).await;
        assert_eq!(sim.handle("1TP?").as_deref(), Some("1TP-5.000000"));
        assert!(sim.in_motion());

        // A second move is refused while the first is running.
        sim.handle("1PA3.0");
        assert_eq!(sim.handle("1TE").as_deref(), Some("1TEM"));

        tokio::time::advance(Duration::from_millis(1125)).await;
        assert_eq!(sim.state_code(), "33");
        assert_eq!(bench.stage_position(), -10.0);
        assert!(!sim.in_motion());
    }

    #[tokio::test(start_paused = true)]
    async fn travel_estimate_can_be_short() {
        let sim = SimulatedStage::new(OpticalBench::default()).with_travel_estimate(0.5);
        assert_eq!(sim.handle("1PT10.0").as_deref(), Some("1PT1.125000"));
        sim.handle("1PA10.0");

        tokio::time::advance(Duration::from_millis(1125)).await;
        assert_eq!(sim.state_code(), "28");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_freezes_the_stage() {
        let bench = OpticalBench::default();
        let sim = SimulatedStage::new(bench.clone());
        sim.handle("1PA10.0");
        tokio::time::advance(Duration::from_millis(1125)).await;
        sim.handle("1ST");

        assert_eq!(sim.state_code(), "33");
        assert_eq!(bench.stage_position(), 5.0);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(sim.handle("1TP?").as_deref(), Some("1TP5.000000"));
    }

    #[test]
    fn refused_commands_leave_a_letter_until_read() {
        let bench = OpticalBench::default();
        let sim = SimulatedStage::new(bench.clone());
        sim.handle("1PA150.0");
        assert_eq!(sim.handle("1TE").as_deref(), Some("1TEG"));
        assert_eq!(sim.handle("1TE").as_deref(), Some("1TE@"));
        assert_eq!(bench.stage_position(), 0.0);

        sim.handle("1XX");
        assert_eq!(sim.handle("1TE").as_deref(), Some("1TEA"));
    }

    #[tokio::test(start_paused = true)]
    async fn unreferenced_controller_needs_homing() {
        let bench = OpticalBench::default();
        bench.set_stage_position(7.0);
        let sim = SimulatedStage::new(bench.clone()).unreferenced();
        sim.handle("1PA1.0");
        assert_eq!(sim.handle("1TE").as_deref(), Some("1TEH"));

        sim.handle("1OR");
        assert_eq!(sim.state_code(), "1E");
        sim.handle("1PA1.0");
        assert_eq!(sim.handle("1TE").as_deref(), Some("1TEL"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(sim.state_code(), "32");
        assert_eq!(bench.stage_position(), 0.0);
    }

    #[test]
    fn disable_and_enable() {
        let sim = SimulatedStage::new(OpticalBench::default());
        sim.handle("1MM0");
        assert_eq!(sim.state_code(), "3C");
        sim.handle("1PA1.0");
        assert_eq!(sim.handle("1TE").as_deref(), Some("1TEJ"));
        sim.handle("1MM1");
        assert_eq!(sim.state_code(), "34");
    }

    #[test]
    fn positioner_fault_is_reported_in_ts() {
        let sim = SimulatedStage::new(OpticalBench::default());
        sim.inject_positioner_fault(0x0020);
        assert_eq!(sim.handle("1TS").as_deref(), Some("1TS002032"));
    }

    #[tokio::test]
    async fn serves_a_transport() {
        let sim = SimulatedStage::new(OpticalBench::default());
        let mut port = sim.connect(TransportConfig::with_settle(std::time::Duration::from_millis(5)));
        assert_eq!(port.query("1TS").await.unwrap(), "1TS000032");
        assert_eq!(sim.commands(), vec!["1TS".to_string()]);
    }
}
