//! InSight DS+ simulator speaking the SCPI-like protocol over an in-memory pipe.
//!
//! Tuning changes the bench wavelength and moves the DeepSee motor to its
//! position for that wavelength. Set commands produce no reply; a refused set
//! simply leaves the head unchanged, which is what the driver sees on the
//! real laser too.

use crate::bench::OpticalBench;
use daq_core::serial::{SerialTransport, TransportConfig};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const RUN: u32 = 50;
const READY_TO_TURN_ON: u32 = 25;
const MAIN_SHUTTER: u32 = 0x4;
const FIXED_SHUTTER: u32 = 0x8;
/// Half-width of the DeepSee window around the wavelength's nominal position.
const DSM_WINDOW: f64 = 10.0;

#[derive(Debug)]
struct HeadState {
    run_state: u32,
    shutters: u32,
    fault_bits: u32,
    dsm_position: f64,
    range: (u32, u32),
    unreachable: BTreeSet<u32>,
    history: String,
    commands: Vec<String>,
}

/// Simulated InSight head sharing the wavelength of an [`OpticalBench`].
#[derive(Debug, Clone)]
pub struct SimulatedLaser {
    bench: OpticalBench,
    state: Arc<Mutex<HeadState>>,
}

impl SimulatedLaser {
    /// A head in RUN with both shutters closed and a clean history.
    pub fn new(bench: OpticalBench) -> Self {
        let dsm_position = OpticalBench::dsm_position_for(bench.wavelength());
        Self {
            bench,
            state: Arc::new(Mutex::new(HeadState {
                run_state: RUN,
                shutters: 0,
                fault_bits: 0,
                dsm_position,
                range: (680, 1300),
                unreachable: BTreeSet::new(),
                history: "000".to_string(),
                commands: Vec::new(),
            })),
        }
    }

    /// Start in hibernate (ready to turn on).
    pub fn hibernating(self) -> Self {
        self.state.lock().run_state = READY_TO_TURN_ON;
        self
    }

    /// Refuse to tune to `wavelength_nm`.
    pub fn make_unreachable(&self, wavelength_nm: u32) {
        self.state.lock().unreachable.insert(wavelength_nm);
    }

    /// OR `bits` into the fault and interlock bits of the status word.
    pub fn set_fault_bits(&self, bits: u32) {
        self.state.lock().fault_bits = bits;
    }

    /// Replace the `READ:AHIS?` reply.
    pub fn set_history(&self, codes: &str) {
        self.state.lock().history = codes.to_string();
    }

    /// Current status word.
    pub fn status_word(&self) -> u32 {
        let s = self.state.lock();
        (s.run_state << 16) | s.shutters | s.fault_bits
    }

    /// Every line received so far.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Spawn the simulator task and return the host end as a transport.
    pub fn connect(&self, config: TransportConfig) -> SerialTransport {
        let (host, device) = tokio::io::duplex(4096);
        let sim = self.clone();
        tokio::spawn(async move {
            let (reader, mut writer) = tokio::io::split(device);
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(reply) = sim.handle(line.trim()) {
                    if writer.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        });
        SerialTransport::from_stream("sim:insight", Box::new(host), config)
    }

    /// Process one command line; returns the reply, if the command has one.
    pub fn handle(&self, line: &str) -> Option<String> {
        let status_word = self.status_word();
        let mut s = self.state.lock();
        s.commands.push(line.to_string());
        let (command, arg) = match line.split_once(' ') {
            Some((c, a)) => (c, a.trim()),
            None => (line, ""),
        };

        match (command, arg) {
            ("*STB?", _) => Some(status_word.to_string()),
            ("WAVelength?", _) => Some(self.bench.wavelength().to_string()),
            ("WAVelength", a) => {
                if let Ok(wl) = a.parse::<u32>() {
                    let (min, max) = s.range;
                    if (min..=max).contains(&wl) && !s.unreachable.contains(&wl) {
                        self.bench.set_wavelength(wl);
                        s.dsm_position = OpticalBench::dsm_position_for(wl);
                    }
                }
                None
            }
            ("CONT:DSMPOS?", _) => Some(format!("{:.2}", s.dsm_position)),
            ("CONT:DSMPOS", a) => {
                let nominal = OpticalBench::dsm_position_for(self.bench.wavelength());
                if let Ok(p) = a.parse::<f64>() {
                    if (p - nominal).abs() <= DSM_WINDOW {
                        s.dsm_position = p;
                    }
                }
                None
            }
            ("CONT:SLMIN?", _) => Some(format!(
                "{:.2}",
                OpticalBench::dsm_position_for(self.bench.wavelength()) - DSM_WINDOW
            )),
            ("CONT:SLMAX?", _) => Some(format!(
                "{:.2}",
                OpticalBench::dsm_position_for(self.bench.wavelength()) + DSM_WINDOW
            )),
            ("READ:AHIS?", _) => Some(s.history.clone()),
            ("READ:HUMidity?", _) => Some("3.2%".to_string()),
            ("READ:PLASer:DIODe1:HOURS?", _) | ("READ:PLASer:DIODe2:HOURS?", _) => {
                Some("1520.5".to_string())
            }
            ("READ:PLASer:DIODe1:TEMPerature?", _) => Some("24.1".to_string()),
            ("READ:PLASer:DIODe2:TEMPerature?", _) => Some("24.3".to_string()),
            ("READ:PLASer:DIODe1:CURRent?", _) | ("READ:PLASer:DIODe2:CURRent?", _) => {
                if s.run_state == RUN {
                    Some("10.25%".to_string())
                } else {
                    Some("0.00%".to_string())
                }
            }
            ("SHUTter", a) => {
                set_bit(&mut s.shutters, MAIN_SHUTTER, a == "1");
                None
            }
            ("IRSHUTter", a) => {
                set_bit(&mut s.shutters, FIXED_SHUTTER, a == "1");
                None
            }
            ("ON", _) => {
                s.run_state = RUN;
                None
            }
            ("OFF", _) => {
                s.run_state = READY_TO_TURN_ON;
                s.shutters = 0;
                None
            }
            _ => None,
        }
    }
}

fn set_bit(word: &mut u32, bit: u32, on: bool) {
    if on {
        *word |= bit;
    } else {
        *word &= !bit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuning_moves_wavelength_and_deepsee() {
        let bench = OpticalBench::default();
        let sim = SimulatedLaser::new(bench.clone());
        assert_eq!(sim.handle("WAVelength 950"), None);
        assert_eq!(bench.wavelength(), 950);
        assert_eq!(sim.handle("WAVelength?").as_deref(), Some("950"));
        assert_eq!(sim.handle("CONT:DSMPOS?").as_deref(), Some("33.50"));
    }

    #[test]
    fn refused_tuning_leaves_head_unchanged() {
        let bench = OpticalBench::default();
        let sim = SimulatedLaser::new(bench.clone());
        sim.make_unreachable(900);
        sim.handle("WAVelength 900");
        sim.handle("WAVelength 1400");
        assert_eq!(bench.wavelength(), 800);
    }

    #[test]
    fn status_word_carries_state_shutters_and_faults() {
        let sim = SimulatedLaser::new(OpticalBench::default());
        sim.handle("SHUTter 1");
        assert_eq!(sim.handle("*STB?"), Some(((50u32 << 16) | 0x4).to_string()));

        sim.set_fault_bits(0x0400);
        assert_eq!(sim.status_word() & 0x0400, 0x0400);

        sim.handle("OFF");
        assert_eq!(sim.status_word() >> 16, 25);
        assert_eq!(sim.status_word() & 0x4, 0);
    }

    #[test]
    fn deepsee_moves_only_inside_window() {
        let sim = SimulatedLaser::new(OpticalBench::default());
        sim.handle("CONT:DSMPOS 30.5");
        assert_eq!(sim.handle("CONT:DSMPOS?").as_deref(), Some("30.50"));
        sim.handle("CONT:DSMPOS 90");
        assert_eq!(sim.handle("CONT:DSMPOS?").as_deref(), Some("30.50"));
        assert_eq!(sim.handle("CONT:SLMIN?").as_deref(), Some("16.00"));
        assert_eq!(sim.handle("CONT:SLMAX?").as_deref(), Some("36.00"));
    }
}
