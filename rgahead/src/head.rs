//! Device state machine for an analyzer head.
//!
//! The [`Head`] owns the current [`DeviceState`], runs command sequences
//! against the [`Channel`], reassembles binary scan data, and guards scans
//! with a [`Watchdog`].
//!
//! ## Locking
//!
//! One device lock protects the state and the scan assembler. Sequence
//! execution, scan-byte handling, abort and watchdog recovery all hold it, so
//! only one of them runs at a time per head. Validators run on the line
//! dispatch thread while a sequence holds the device lock, and therefore only
//! touch [`DeviceInfo`], which has its own lock.
//!
//! The watchdog takes the device lock with a bound. When that bound expires
//! it forces `PowerDown` without the lock; `PowerDown` is never left again.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rgahead::{Catalog, DeviceState, Head, HeadConfig, ScanSettings, SerialConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let catalog = Arc::new(Catalog::rga(ScanSettings::new(1, 50, 10))?);
//!     let head = Head::open(&SerialConfig::new("/dev/ttyUSB0", 28800), catalog.clone(), HeadConfig::default())?;
//!
//!     while head.state() != DeviceState::ReadyToScan {
//!         if let Some(sequence) = catalog.sequence_for(head.state()) {
//!             head.execute_sequence(sequence);
//!         }
//!     }
//!     head.dispose();
//!     Ok(())
//! }
//! ```

use {
    crate::{
        catalog::Catalog,
        channel::{Channel, ChannelConfig, ChannelHandlers, ChannelMode, ModeCell, QueueDepths},
        command::{CommandSequence, Exchange, ValidationContext},
        device::{DeviceInfo, DeviceState},
        error::{Error, Result},
        events::{EventBus, HeadEvent},
        port::Port,
        scan::{ScanAssembler, ScanResult},
        watchdog::Watchdog,
    },
    log::{debug, error, info, trace, warn},
    parking_lot::{Mutex, MutexGuard},
    std::{
        sync::{
            Arc, OnceLock, Weak,
            atomic::{AtomicBool, AtomicU8, Ordering},
            mpsc::Receiver,
        },
        thread,
        time::Duration,
    },
};

/// Default wait for a command's response.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default scan watchdog timeout.
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(20);

/// Default bound on the watchdog's device-lock acquisition.
pub const DEFAULT_WATCHDOG_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default pause after switching the mass filter off.
pub const DEFAULT_ABORT_SETTLE: Duration = Duration::from_secs(1);

/// Head timing and channel settings.
#[derive(Debug, Clone)]
pub struct HeadConfig {
    /// Wait for each command's response.
    pub command_timeout: Duration,
    /// Time a scan may take before the watchdog recovers.
    pub watchdog_timeout: Duration,
    /// Bound on the watchdog's device-lock acquisition.
    pub watchdog_lock_timeout: Duration,
    /// Pause after the abort command.
    pub abort_settle: Duration,
    /// Framing layer settings.
    pub channel: ChannelConfig,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            watchdog_timeout: DEFAULT_WATCHDOG_TIMEOUT,
            watchdog_lock_timeout: DEFAULT_WATCHDOG_LOCK_TIMEOUT,
            abort_settle: DEFAULT_ABORT_SETTLE,
            channel: ChannelConfig::default(),
        }
    }
}

impl HeadConfig {
    /// Set the command timeout.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the scan watchdog timeout.
    #[must_use]
    pub fn with_watchdog_timeout(mut self, timeout: Duration) -> Self {
        self.watchdog_timeout = timeout;
        self
    }

    /// Set the watchdog's lock bound.
    #[must_use]
    pub fn with_watchdog_lock_timeout(mut self, timeout: Duration) -> Self {
        self.watchdog_lock_timeout = timeout;
        self
    }

    /// Set the abort settle delay.
    #[must_use]
    pub fn with_abort_settle(mut self, settle: Duration) -> Self {
        self.abort_settle = settle;
        self
    }

    /// Set the channel configuration.
    #[must_use]
    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }
}

/// Snapshot of the scan assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanProgress {
    /// Bytes waiting to form a value.
    pub buffered_bytes: usize,
    /// Values assembled so far.
    pub values: usize,
    /// Values the scan should produce.
    pub expected: usize,
}

/// Framing mode the channel uses in `state`.
pub fn channel_mode_for(state: DeviceState) -> ChannelMode {
    if state.is_scanning() {
        ChannelMode::Bytes
    } else {
        ChannelMode::String
    }
}

/// Data behind the device lock.
#[derive(Debug, Default)]
struct Core {
    scan: ScanAssembler,
}

struct Shared {
    name: String,
    core: Mutex<Core>,
    state: AtomicU8,
    mode: ModeCell,
    info: Mutex<DeviceInfo>,
    pending: Mutex<Option<Arc<Exchange>>>,
    last_scan: Mutex<Option<ScanResult>>,
    busy: AtomicBool,
    events: EventBus,
    catalog: Arc<Catalog>,
    depths: OnceLock<QueueDepths>,
    watchdog: Watchdog,
    watchdog_lock_timeout: Duration,
}

impl Shared {
    fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Change state while holding the device lock.
    fn set_state(&self, _core: &mut MutexGuard<'_, Core>, to: DeviceState) {
        self.transition(to);
    }

    fn transition(&self, to: DeviceState) {
        let from = self.state();
        if from == DeviceState::PowerDown && to != DeviceState::PowerDown {
            warn!("{}: refusing {from} -> {to}, head is powered down", self.name);
            return;
        }
        self.state.store(to as u8, Ordering::Release);
        self.mode.set(channel_mode_for(to));
        if !to.is_scanning() {
            self.watchdog.stop();
        }
        if from != to {
            self.events.publish(HeadEvent::StateChanged { from, to });
        }
    }

    fn on_line(&self, line: String) {
        if self.state() == DeviceState::Scanning {
            trace!("{}: ignoring line while scanning: {line:?}", self.name);
            return;
        }
        let Some(exchange) = self.pending.lock().clone() else {
            debug!("{}: unsolicited line {line:?}", self.name);
            return;
        };
        if exchange.is_completed() {
            debug!(
                "{}: line {line:?} after {} already completed",
                self.name,
                exchange.wire()
            );
            return;
        }

        let verdict = {
            let mut info = self.info.lock();
            let mut ctx = ValidationContext {
                info: &mut info,
                calibration: self.catalog.calibration(),
            };
            exchange.command().validate(&mut ctx, Some(&line))
        };
        match verdict {
            Ok(success) => {
                trace!("{}: {} -> {line:?} ({success})", self.name, exchange.wire());
                exchange.complete(success, Some(line));
            },
            Err(e) => {
                self.events
                    .exception(&e, format!("validating response to {}", exchange.wire()));
                exchange.fail(Some(line), e.to_string());
            },
        }
    }

    fn on_bytes(&self, chunk: Vec<u8>) {
        let left_scanning = {
            let mut core = self.core.lock();
            if self.state() != DeviceState::Scanning {
                trace!("{}: dropping {} bytes outside a scan", self.name, chunk.len());
                return;
            }
            if core.scan.push(&chunk) {
                let values = core.scan.take();
                let (start, ppa) = {
                    let info = self.info.lock();
                    let settings = self.catalog.scan_settings();
                    (
                        info.start_amu.unwrap_or(settings.start_amu),
                        info.points_per_amu.unwrap_or(settings.points_per_amu),
                    )
                };
                debug!("{}: scan complete, {} values", self.name, values.len());
                *self.last_scan.lock() = Some(ScanResult::new(values, start, ppa));
                self.set_state(&mut core, DeviceState::ReadyToScan);
            }
            self.state() != DeviceState::Scanning
        };

        if left_scanning {
            self.watchdog.stop();
            self.events.publish(HeadEvent::ScanCompleted);
        }
    }

    fn on_watchdog(&self) {
        if !self.state().is_scanning() {
            trace!("{}: watchdog fired outside a scan", self.name);
            return;
        }

        let Some(mut core) = self.core.try_lock_for(self.watchdog_lock_timeout) else {
            let err = Error::ScanDeadlock(self.watchdog_lock_timeout);
            error!(
                "{}: scan watchdog could not take the device lock within {:?}; forcing PowerDown",
                self.name, self.watchdog_lock_timeout
            );
            self.transition(DeviceState::PowerDown);
            self.events.exception(&err, "scan watchdog");
            return;
        };

        if !self.state().is_scanning() {
            return;
        }

        let err = Error::ScanTimeout {
            expected: core.scan.expected(),
            received: core.scan.values().len(),
        };
        let (head, tail) = core.scan.buffered().as_slices();
        let (line_depth, byte_depth) = self
            .depths
            .get()
            .map_or((0, 0), |d| (d.lines(), d.bytes()));
        warn!(
            "{}: scan watchdog fired after {:?} in {}: expected {} values, got {}; buffered bytes [{}{}]; values {:?}; queue depths lines={} bytes={}",
            self.name,
            self.watchdog.timeout(),
            self.state(),
            core.scan.expected(),
            core.scan.values().len(),
            hex::encode(head),
            hex::encode(tail),
            core.scan.values(),
            line_depth,
            byte_depth,
        );
        core.scan.clear();
        self.set_state(&mut core, DeviceState::ReadyToScan);
        self.events.exception(&err, "scan watchdog");
    }
}

/// An analyzer head attached to a channel.
pub struct Head {
    channel: Channel,
    shared: Arc<Shared>,
    config: HeadConfig,
    disposed: AtomicBool,
}

impl Head {
    /// Attach to `port` and start the channel.
    pub fn new(port: Box<dyn Port>, catalog: Arc<Catalog>, config: HeadConfig) -> Result<Self> {
        let name = port.name().to_string();
        let mode = ModeCell::new();

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak = weak.clone();
            Shared {
                name: name.clone(),
                core: Mutex::new(Core::default()),
                state: AtomicU8::new(DeviceState::PowerUp as u8),
                mode: mode.clone(),
                info: Mutex::new(DeviceInfo::default()),
                pending: Mutex::new(None),
                last_scan: Mutex::new(None),
                busy: AtomicBool::new(false),
                events: EventBus::new(),
                catalog,
                depths: OnceLock::new(),
                watchdog: Watchdog::new(&name, config.watchdog_timeout, move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.on_watchdog();
                    }
                }),
                watchdog_lock_timeout: config.watchdog_lock_timeout,
            }
        });

        let handlers = {
            let (lines, bytes, sent, faults) = (
                Arc::downgrade(&shared),
                Arc::downgrade(&shared),
                Arc::downgrade(&shared),
                Arc::downgrade(&shared),
            );
            ChannelHandlers {
                on_line: Arc::new(move |line| {
                    if let Some(shared) = lines.upgrade() {
                        shared.on_line(line);
                    }
                }),
                on_bytes: Arc::new(move |chunk| {
                    if let Some(shared) = bytes.upgrade() {
                        shared.on_bytes(chunk);
                    }
                }),
                on_transmit: Arc::new(move |text| {
                    if let Some(shared) = sent.upgrade() {
                        shared
                            .events
                            .publish(HeadEvent::TerminalLog(text.to_string()));
                    }
                }),
                on_fault: Arc::new(move |err| {
                    if let Some(shared) = faults.upgrade() {
                        shared.events.exception(&err, "channel reader");
                    }
                }),
            }
        };

        let channel = Channel::open(port, mode, handlers, &config.channel)?;
        let _ = shared.depths.set(channel.depths());
        info!(
            "Head on {name} using the {} catalog",
            shared.catalog.name()
        );

        Ok(Self {
            channel,
            shared,
            config,
            disposed: AtomicBool::new(false),
        })
    }

    /// Open a native serial port and attach to it.
    #[cfg(feature = "native")]
    pub fn open(
        serial: &crate::port::SerialConfig,
        catalog: Arc<Catalog>,
        config: HeadConfig,
    ) -> Result<Self> {
        let port = crate::port::NativePort::open(serial)?;
        Self::new(Box::new(port), catalog, config)
    }

    /// Port name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current state.
    pub fn state(&self) -> DeviceState {
        self.shared.state()
    }

    /// Whether a sequence or abort is running.
    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
    }

    /// Most recent completed scan.
    pub fn last_scan_result(&self) -> Option<ScanResult> {
        self.shared.last_scan.lock().clone()
    }

    /// Values reported by the head so far.
    pub fn device_info(&self) -> DeviceInfo {
        self.shared.info.lock().clone()
    }

    /// Wire text of the last issued command.
    pub fn last_issued(&self) -> Option<String> {
        self.shared
            .pending
            .lock()
            .as_ref()
            .map(|e| e.wire().to_string())
    }

    /// Current channel framing mode.
    pub fn channel_mode(&self) -> ChannelMode {
        self.channel.mode()
    }

    /// Scan assembler snapshot. Takes the device lock.
    pub fn scan_progress(&self) -> ScanProgress {
        let core = self.shared.core.lock();
        ScanProgress {
            buffered_bytes: core.scan.buffered().len(),
            values: core.scan.values().len(),
            expected: core.scan.expected(),
        }
    }

    /// The injected catalog.
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.shared.catalog
    }

    /// Timing configuration.
    pub fn config(&self) -> &HeadConfig {
        &self.config
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> Receiver<HeadEvent> {
        self.shared.events.subscribe()
    }

    /// Run `sequence` and move to its success or error-reset state.
    ///
    /// Never fails: every error is reported as an exception event and turns
    /// into a transition to the sequence's error-reset state.
    pub fn execute_sequence(&self, sequence: &CommandSequence) {
        let mut core = self.shared.core.lock();
        self.shared.busy.store(true, Ordering::Release);
        debug!("{}: running sequence {}", self.name(), sequence.name());

        let target = match self.run_sequence(sequence) {
            Ok(()) => sequence.success_next_state(),
            Err(e) => {
                self.shared
                    .events
                    .exception(&e, format!("sequence {}", sequence.name()));
                sequence.error_reset_state()
            },
        };
        self.shared.set_state(&mut core, target);
        self.shared.busy.store(false, Ordering::Release);
    }

    fn run_sequence(&self, sequence: &CommandSequence) -> Result<()> {
        let calibration = self.shared.catalog.calibration();
        for command in sequence.commands() {
            let wire = command.wire_text(calibration);
            let exchange = Arc::new(Exchange::new(command.clone(), wire.clone()));
            *self.shared.pending.lock() = Some(Arc::clone(&exchange));

            self.channel.send(&wire)?;

            if !command.expects_response() {
                let mut info = self.shared.info.lock();
                let mut ctx = ValidationContext {
                    info: &mut info,
                    calibration,
                };
                if let Err(e) = command.validate(&mut ctx, None) {
                    debug!("{}: validator for {wire} failed without response: {e}", self.name());
                }
                exchange.complete(true, None);
                continue;
            }

            exchange.outcome(self.config.command_timeout)?;
        }
        Ok(())
    }

    /// Force `StartScan` and arm the scan watchdog.
    ///
    /// The caller runs the catalog's `StartScan` sequence next.
    pub fn start_scan(&self) {
        let mut core = self.shared.core.lock();
        let expected = self
            .shared
            .info
            .lock()
            .total_scan_points()
            .unwrap_or_else(|| self.shared.catalog.scan_settings().total_scan_points());
        core.scan.reset(expected);
        self.shared.set_state(&mut core, DeviceState::StartScan);
        self.shared.watchdog.start();
        debug!("{}: scan started, expecting {expected} values", self.name());
    }

    /// Switch the mass filter off and return to `DetectorOn`.
    pub fn abort_scan(&self) {
        self.shared.watchdog.stop();
        let mut core = self.shared.core.lock();
        self.shared.busy.store(true, Ordering::Release);

        let abort = self.shared.catalog.abort_command();
        let wire = abort.wire_text(self.shared.catalog.calibration());
        if let Err(e) = self.channel.send(&wire) {
            self.shared.events.exception(&e, "abort scan");
        }
        thread::sleep(self.config.abort_settle);
        if let Err(e) = self.channel.clear_input() {
            debug!("{}: could not discard scan bytes after abort: {e}", self.name());
        }

        core.scan.clear();
        self.shared.set_state(&mut core, DeviceState::DetectorOn);
        self.shared.busy.store(false, Ordering::Release);
    }

    /// Power the head down and close the channel. Errors are reported, not
    /// returned. Later calls do nothing.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("{}: disposing", self.name());
        if self.state().is_scanning() {
            self.abort_scan();
        }
        self.shared.watchdog.stop();

        if self.channel.is_open() {
            if let Some(sequence) = self.shared.catalog.sequence_for(DeviceState::PowerDown) {
                self.execute_sequence(sequence);
            }
        }
        {
            let mut core = self.shared.core.lock();
            self.shared.set_state(&mut core, DeviceState::PowerDown);
        }

        if let Err(e) = self.channel.close() {
            self.shared.events.exception(&e, "closing channel");
        }
    }
}
