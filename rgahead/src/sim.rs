//! Simulated analyzer head behind a [`MemoryPort`].
//!
//! [`SimulatedRga`] answers the command set built by
//! [`Catalog::rga`](crate::catalog::Catalog::rga) and streams a synthetic
//! spectrum on `SC`. It can be told to stay silent for chosen opcodes, to
//! report a non-zero status byte, or to stall part way through a scan.
//!
//! ```rust
//! use rgahead::sim::{SimConfig, SimulatedRga};
//!
//! let (port, sim) = SimulatedRga::connect("sim", SimConfig::default());
//! # drop(port);
//! sim.stop();
//! ```

use {
    crate::{
        catalog::{MAX_AMU, MAX_POINTS_PER_AMU},
        channel::{DEFAULT_TRIM_CHARS, LineFramer},
        port::{MemoryPort, Port},
    },
    byteorder::{ByteOrder, LittleEndian},
    log::{debug, trace, warn},
    parking_lot::Mutex,
    std::{
        collections::{HashMap, HashSet, VecDeque},
        io::{ErrorKind, Read},
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread::{self, JoinHandle},
        time::Duration,
    },
};

/// Peaks of the synthetic spectrum as (AMU, relative height).
const PEAKS: &[(f64, f64)] = &[
    (2.0, 0.15),
    (16.0, 0.08),
    (17.0, 0.25),
    (18.0, 1.0),
    (28.0, 0.6),
    (32.0, 0.12),
    (40.0, 0.04),
    (44.0, 0.07),
];

const IDLE_POLL: Duration = Duration::from_millis(20);

/// Most recent commands kept by [`SimulatedRga::received`].
pub const RECEIVED_LOG_CAPACITY: usize = 512;

/// Behaviour of a [`SimulatedRga`].
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Identification string answered to `ID?`.
    pub id: String,
    /// Calibrated multiplier voltage answered to `MV?`.
    pub cdem_voltage: f64,
    /// Trailing total-pressure word of every scan.
    pub total_pressure: u32,
    /// Peak height of the synthetic spectrum in counts.
    pub peak_counts: u32,
    /// Scan bytes written per chunk.
    pub chunk_size: usize,
    /// Pause between scan chunks.
    pub chunk_interval: Duration,
    /// Opcodes (`"ID?"`, `"HV"`, ...) that never get an answer.
    pub silent: HashSet<String>,
    /// Status byte reported for an opcode instead of `0`.
    pub status: HashMap<String, u8>,
    /// Stop streaming after this many scan values.
    pub stall_after: Option<usize>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            id: "SRSRGA200VER0.24SN19288".to_string(),
            cdem_voltage: 1285.0,
            total_pressure: 250_000,
            peak_counts: 40_000,
            chunk_size: 64,
            chunk_interval: Duration::from_millis(1),
            silent: HashSet::new(),
            status: HashMap::new(),
            stall_after: None,
        }
    }
}

impl SimConfig {
    /// Never answer `opcode`.
    #[must_use]
    pub fn silent_on(mut self, opcode: &str) -> Self {
        self.silent.insert(opcode.to_string());
        self
    }

    /// Report `status` for `opcode`.
    #[must_use]
    pub fn with_status(mut self, opcode: &str, status: u8) -> Self {
        self.status.insert(opcode.to_string(), status);
        self
    }

    /// Stop a scan after `values` values.
    #[must_use]
    pub fn stall_after(mut self, values: usize) -> Self {
        self.stall_after = Some(values);
        self
    }

    /// Set the total-pressure word.
    #[must_use]
    pub fn with_total_pressure(mut self, pressure: u32) -> Self {
        self.total_pressure = pressure;
        self
    }

    /// Set the scan chunk size.
    #[must_use]
    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes.max(1);
        self
    }
}

/// Synthetic counts at `amu`.
pub fn synthetic_counts(amu: f64, peak_counts: u32) -> u32 {
    let height: f64 = PEAKS
        .iter()
        .map(|(center, rel)| rel * (-((amu - center) / 0.18).powi(2)).exp())
        .sum();
    (f64::from(peak_counts) * height) as u32 + 12
}

/// A simulated head running on its own thread.
pub struct SimulatedRga {
    stop: Arc<AtomicBool>,
    received: Arc<Mutex<VecDeque<String>>>,
    worker: Option<JoinHandle<()>>,
}

impl SimulatedRga {
    /// Create a connected pair and return the host end.
    pub fn connect(name: &str, config: SimConfig) -> (MemoryPort, Self) {
        let (host, device) = MemoryPort::pair(name);
        (host, Self::spawn(device, config))
    }

    /// Serve `port` until stopped or the port closes.
    pub fn spawn(port: MemoryPort, config: SimConfig) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let received = Arc::new(Mutex::new(VecDeque::new()));
        let mut device = Device {
            port,
            config,
            framer: LineFramer::new(DEFAULT_TRIM_CHARS),
            registers: Registers::default(),
            outgoing: VecDeque::new(),
            emitted: 0,
            received: Arc::clone(&received),
        };
        let worker_stop = Arc::clone(&stop);
        let worker = thread::Builder::new()
            .name("rga-sim".to_string())
            .spawn(move || device.run(&worker_stop))
            .map_err(|e| warn!("Failed to spawn simulator thread: {e}"))
            .ok();

        Self {
            stop,
            received,
            worker,
        }
    }

    /// The last [`RECEIVED_LOG_CAPACITY`] commands received, oldest first,
    /// without terminators.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().iter().cloned().collect()
    }

    /// Stop the simulator thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for SimulatedRga {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug)]
struct Registers {
    start_amu: u32,
    end_amu: u32,
    points_per_amu: u32,
}

impl Default for Registers {
    fn default() -> Self {
        Self {
            start_amu: 1,
            end_amu: 65,
            points_per_amu: 10,
        }
    }
}

impl Registers {
    fn scan_points(&self) -> u32 {
        self.end_amu
            .saturating_sub(self.start_amu)
            .saturating_mul(self.points_per_amu)
            .saturating_add(1)
    }
}

struct Device {
    port: MemoryPort,
    config: SimConfig,
    framer: LineFramer,
    registers: Registers,
    outgoing: VecDeque<u8>,
    emitted: usize,
    received: Arc<Mutex<VecDeque<String>>>,
}

impl Device {
    fn run(&mut self, stop: &AtomicBool) {
        let mut buf = [0u8; 256];
        while !stop.load(Ordering::Acquire) {
            let timeout = if self.outgoing.is_empty() {
                IDLE_POLL
            } else {
                self.config.chunk_interval
            };
            if self.port.set_timeout(timeout).is_err() {
                break;
            }
            match self.port.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for line in self.framer.push(&buf[..n]) {
                        self.handle(&line);
                    }
                },
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {},
                Err(e) => {
                    debug!("Simulator read failed: {e}");
                    break;
                },
            }
            if !self.outgoing.is_empty() && !self.stream_chunk() {
                break;
            }
        }
        trace!("Simulator exiting");
    }

    fn stream_chunk(&mut self) -> bool {
        let n = self.config.chunk_size.min(self.outgoing.len());
        let chunk: Vec<u8> = self.outgoing.drain(..n).collect();
        self.port.write_all_bytes(&chunk).is_ok()
    }

    fn reply(&mut self, text: &str) {
        if let Err(e) = self.port.write_all_bytes(format!("{text}\n\r").as_bytes()) {
            debug!("Simulator reply failed: {e}");
        }
    }

    fn status_for(&self, opcode: &str) -> String {
        self.config.status.get(opcode).copied().unwrap_or(0).to_string()
    }

    fn handle(&mut self, line: &str) {
        {
            let mut received = self.received.lock();
            if received.len() == RECEIVED_LOG_CAPACITY {
                received.pop_front();
            }
            received.push_back(line.to_string());
        }

        let split = line
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(line.len());
        let (letters, rest) = line.split_at(split);
        let (opcode, query, argument) = match rest.strip_prefix('?') {
            Some(rest) => (format!("{letters}?"), true, rest),
            None => (letters.to_string(), false, rest),
        };

        if self.config.silent.contains(&opcode) {
            trace!("Simulator staying silent on {opcode}");
            return;
        }

        match (letters, query) {
            ("ID", true) => {
                let id = self.config.id.clone();
                self.reply(&id);
            },
            ("IN" | "FL" | "HV", false) => {
                let status = self.status_for(&opcode);
                self.reply(&status);
            },
            ("MV", true) => {
                let volts = format!("{:.0}", self.config.cdem_voltage);
                self.reply(&volts);
            },
            ("MI", false) => self.store(argument, MAX_AMU, |r| &mut r.start_amu),
            ("MF", false) => self.store(argument, MAX_AMU, |r| &mut r.end_amu),
            ("SA", false) => self.store(argument, MAX_POINTS_PER_AMU, |r| &mut r.points_per_amu),
            ("MI", true) => self.reply(&self.registers.start_amu.to_string()),
            ("MF", true) => self.reply(&self.registers.end_amu.to_string()),
            ("SA", true) => self.reply(&self.registers.points_per_amu.to_string()),
            ("AP", true) => self.reply(&self.registers.scan_points().to_string()),
            ("SC", false) => self.begin_scan(),
            ("MR", false) => {
                debug!("Simulator scan aborted after {} values", self.emitted);
                self.outgoing.clear();
            },
            _ => debug!("Simulator ignoring {line:?}"),
        }
    }

    fn store(&mut self, argument: &str, max: u32, field: fn(&mut Registers) -> &mut u32) {
        match argument.trim().parse::<u32>() {
            Ok(value) if value > max => debug!("Simulator rejected {value}, above {max}"),
            Ok(value) => *field(&mut self.registers) = value,
            Err(e) => debug!("Simulator rejected argument {argument:?}: {e}"),
        }
    }

    fn begin_scan(&mut self) {
        let points = self.registers.scan_points() as usize;
        let ppa = f64::from(self.registers.points_per_amu.max(1));
        let start = f64::from(self.registers.start_amu);

        let mut values: Vec<u32> = (0..points)
            .map(|i| synthetic_counts(start + i as f64 / ppa, self.config.peak_counts))
            .collect();
        values.push(self.config.total_pressure);
        if let Some(limit) = self.config.stall_after {
            values.truncate(limit);
        }

        let mut bytes = vec![0u8; values.len() * 4];
        LittleEndian::write_u32_into(&values, &mut bytes);
        debug!("Simulator streaming {} values", values.len());
        self.emitted = values.len();
        self.outgoing = bytes.into();
    }
}
