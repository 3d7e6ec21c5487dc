//! Device-side state: lifecycle states, status bits, and values reported by
//! the head during sequences.

use bitflags::bitflags;
use std::fmt;

/// Lifecycle state of the analyzer head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum DeviceState {
    /// Just connected; identity unknown.
    #[default]
    PowerUp = 0,
    /// Communication initialised.
    Initialized = 1,
    /// Filament emitting.
    IonizerOn = 2,
    /// Electron multiplier high voltage on.
    DetectorOn = 3,
    /// Scan parameters programmed.
    ReadyToScan = 4,
    /// Scan requested, start sequence pending.
    StartScan = 5,
    /// Binary scan data streaming.
    Scanning = 6,
    /// Safe, terminal state.
    PowerDown = 7,
}

impl DeviceState {
    /// All states in lifecycle order.
    pub const ALL: [Self; 8] = [
        Self::PowerUp,
        Self::Initialized,
        Self::IonizerOn,
        Self::DetectorOn,
        Self::ReadyToScan,
        Self::StartScan,
        Self::Scanning,
        Self::PowerDown,
    ];

    /// Decode the `repr(u8)` value; unknown values map to `PowerDown`.
    pub fn from_u8(value: u8) -> Self {
        Self::ALL
            .get(usize::from(value))
            .copied()
            .unwrap_or(Self::PowerDown)
    }

    /// Whether a scan is in progress.
    pub fn is_scanning(self) -> bool {
        matches!(self, Self::StartScan | Self::Scanning)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PowerUp => "PowerUp",
            Self::Initialized => "Initialized",
            Self::IonizerOn => "IonizerOn",
            Self::DetectorOn => "DetectorOn",
            Self::ReadyToScan => "ReadyToScan",
            Self::StartScan => "StartScan",
            Self::Scanning => "Scanning",
            Self::PowerDown => "PowerDown",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Health flags from the head's status byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StatusBits: u8 {
        /// RS-232 communication error.
        const COMMUNICATION = 1 << 0;
        /// Filament error.
        const FILAMENT = 1 << 1;
        /// Electron multiplier (CDEM) error.
        const MULTIPLIER = 1 << 3;
        /// Quadrupole mass filter error.
        const MASS_FILTER = 1 << 4;
        /// Electrometer error.
        const ELECTROMETER = 1 << 5;
        /// External 24 V supply error.
        const EXTERNAL_SUPPLY = 1 << 6;
    }
}

impl StatusBits {
    /// Names of the raised flags, or `"ok"`.
    pub fn describe(self) -> String {
        if self.is_empty() {
            return "ok".to_string();
        }
        self.iter_names()
            .map(|(name, _)| name.to_ascii_lowercase().replace('_', " "))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Values the head reported during the last sequences.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    /// Identification string.
    pub id: Option<String>,
    /// Last status byte.
    pub status: StatusBits,
    /// First AMU of the scan.
    pub start_amu: Option<u32>,
    /// Last AMU of the scan.
    pub end_amu: Option<u32>,
    /// Steps per AMU.
    pub points_per_amu: Option<u32>,
    /// Analog scan points reported by the head, excluding the pressure word.
    pub scan_points: Option<u32>,
    /// Calibrated multiplier voltage.
    pub cdem_voltage: Option<f64>,
}

impl DeviceInfo {
    /// Values expected per scan, including the trailing total-pressure word.
    ///
    /// Uses the reported point count when known, otherwise derives it from
    /// the AMU range. `None` when neither is known or the reported values
    /// overflow.
    pub fn total_scan_points(&self) -> Option<usize> {
        if let Some(points) = self.scan_points {
            return usize::try_from(points).ok()?.checked_add(1);
        }
        match (self.start_amu, self.end_amu, self.points_per_amu) {
            (Some(start), Some(end), Some(ppa)) if end >= start => {
                let points = (end - start).checked_mul(ppa)?;
                usize::try_from(points).ok()?.checked_add(2)
            },
            _ => None,
        }
    }
}
