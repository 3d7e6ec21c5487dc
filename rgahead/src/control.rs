//! Poll-driven control loop.
//!
//! Each poll runs the catalog sequence for the head's current state, so
//! repeated polling walks the head from `PowerUp` to `ReadyToScan`. With
//! auto-scan enabled a poll in `ReadyToScan` starts the next scan.

use {
    crate::{device::DeviceState, head::Head},
    log::{debug, trace},
    std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread,
        time::Duration,
    },
};

/// Default pause between polls that had nothing to do.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What a single poll did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A sequence ran and moved the head from one state to another.
    Ran {
        /// State the sequence ran in.
        from: DeviceState,
        /// State after the sequence.
        to: DeviceState,
    },
    /// A scan was started.
    ScanStarted,
    /// A scan is in progress.
    Scanning,
    /// Nothing to do in this state.
    Idle,
    /// The head is powered down.
    Halted,
}

/// Drives a [`Head`] through its catalog.
pub struct ControlLoop {
    head: Arc<Head>,
    auto_scan: bool,
    poll_interval: Duration,
}

impl ControlLoop {
    /// Create a loop that starts scans automatically.
    pub fn new(head: Arc<Head>) -> Self {
        Self {
            head,
            auto_scan: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Enable or disable automatic scans.
    #[must_use]
    pub fn with_auto_scan(mut self, auto_scan: bool) -> Self {
        self.auto_scan = auto_scan;
        self
    }

    /// Set the idle poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The driven head.
    pub fn head(&self) -> &Arc<Head> {
        &self.head
    }

    /// Run one poll cycle.
    pub fn poll_once(&self) -> PollOutcome {
        let state = self.head.state();
        match state {
            DeviceState::PowerDown => PollOutcome::Halted,
            DeviceState::Scanning => PollOutcome::Scanning,
            DeviceState::ReadyToScan if self.auto_scan => {
                self.head.start_scan();
                PollOutcome::ScanStarted
            },
            _ => match self.head.catalog().sequence_for(state) {
                Some(sequence) => {
                    self.head.execute_sequence(sequence);
                    let to = self.head.state();
                    trace!("Poll ran {} ({state} -> {to})", sequence.name());
                    PollOutcome::Ran { from: state, to }
                },
                None => PollOutcome::Idle,
            },
        }
    }

    /// Poll until `stop` is set or the head halts.
    pub fn run(&self, stop: &AtomicBool) -> PollOutcome {
        let mut last = PollOutcome::Idle;
        while !stop.load(Ordering::Acquire) {
            last = self.poll_once();
            match last {
                PollOutcome::Halted => break,
                PollOutcome::Idle | PollOutcome::Scanning => thread::sleep(self.poll_interval),
                PollOutcome::Ran { from, to } if from == to => {
                    debug!("Sequence in {from} did not advance; retrying");
                    thread::sleep(self.poll_interval);
                },
                PollOutcome::Ran { .. } | PollOutcome::ScanStarted => {},
            }
        }
        last
    }
}
