//! # rgahead
//!
//! Serial-line driver for quadrupole residual gas analyzer heads.
//!
//! The crate walks a head through its lifecycle (filament, multiplier, scan
//! setup), runs analog scans, and hands completed scans to consumers:
//!
//! - [`Channel`]: CTS-gated transmit, line or byte-chunk framing on receive
//! - [`Head`]: state machine, command sequencing, scan reassembly, watchdog
//! - [`Catalog`]: per-state command sequences and response validators
//! - [`ControlLoop`]: poll-driven lifecycle driver
//! - [`Spectrum`]: AMU/intensity export of a [`ScanResult`]
//!
//! ## Features
//!
//! - `native` (default): serial ports via the `serialport` crate
//! - `serde`: serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rgahead::{Catalog, ControlLoop, Head, HeadConfig, HeadEvent, ScanSettings, Spectrum};
//! use rgahead::sim::{SimConfig, SimulatedRga};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (port, _sim) = SimulatedRga::connect("sim", SimConfig::default());
//!     let catalog = Arc::new(Catalog::rga(ScanSettings::new(1, 50, 10))?);
//!     let head = Arc::new(Head::new(Box::new(port), catalog, HeadConfig::default())?);
//!     let events = head.subscribe();
//!
//!     let control = ControlLoop::new(Arc::clone(&head));
//!     loop {
//!         control.poll_once();
//!         if let Ok(HeadEvent::ScanCompleted) = events.try_recv() {
//!             break;
//!         }
//!     }
//!
//!     if let Some(scan) = head.last_scan_result() {
//!         Spectrum::from_scan(&scan).write_tsv(std::io::stdout())?;
//!     }
//!     head.dispose();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod channel;
pub mod command;
pub mod control;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod export;
pub mod head;
pub mod port;
pub mod scan;
pub mod sim;
pub mod watchdog;

#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator, list_ports};
pub use {
    catalog::{CalibrationCache, Catalog, ScanSettings},
    channel::{Channel, ChannelConfig, ChannelMode},
    command::{Command, CommandSequence, Exchange, ResponseKind},
    control::{ControlLoop, PollOutcome},
    device::{DeviceInfo, DeviceState, StatusBits},
    error::{Error, FailureKind, Result},
    events::{EventBus, HeadEvent},
    export::{Spectrum, SpectrumPoint},
    head::{Head, HeadConfig, ScanProgress},
    port::{MemoryPort, Port, PortEnumerator, PortInfo, SerialConfig},
    scan::ScanResult,
};
