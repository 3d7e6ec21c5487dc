//! Protocol catalog: which sequence runs in which state, and how responses
//! are judged.
//!
//! The catalog is data injected into the [`Head`](crate::head::Head), so an
//! alternate instrument dialect needs no change to the state machine.
//! [`Catalog::rga`] builds the command set of a quadrupole residual gas
//! analyzer head.
//!
//! ## Calibration cache
//!
//! The multiplier-voltage query stores the calibrated voltage in the
//! catalog's [`CalibrationCache`], and the high-voltage command reads its
//! parameter from there. The cache is shared by every head that uses the
//! same catalog: two heads driven concurrently from one catalog overwrite
//! each other's calibrated value. Give each head its own catalog when that
//! matters.

use {
    crate::{
        command::{
            Command, CommandSequence, ResponseKind, ValidationContext, parse_integer,
            parse_number, parse_status,
        },
        device::{DeviceInfo, DeviceState, StatusBits},
        error::{Error, Result},
    },
    log::debug,
    parking_lot::RwLock,
    std::{collections::HashMap, sync::Arc},
};

/// Calibration key for the multiplier high voltage.
pub const CDEM_VOLTAGE_KEY: &str = "HV";

/// Highest mass the head can be tuned to.
pub const MAX_AMU: u32 = 300;

/// Finest analog scan resolution, in steps per AMU.
pub const MAX_POINTS_PER_AMU: u32 = 25;

/// Calibrated parameter values shared by all commands of a catalog.
#[derive(Debug, Clone, Default)]
pub struct CalibrationCache(Arc<RwLock<HashMap<String, String>>>);

impl CalibrationCache {
    /// Current value for `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        self.0.read().get(key).cloned()
    }

    /// Store a value for `key`.
    pub fn set(&self, key: &str, value: impl Into<String>) {
        let value = value.into();
        debug!("Calibration {key} = {value}");
        self.0.write().insert(key.to_string(), value);
    }
}

/// Scan range and detector settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ScanSettings {
    /// First AMU.
    pub start_amu: u32,
    /// Last AMU.
    pub end_amu: u32,
    /// Steps per AMU.
    pub points_per_amu: u32,
    /// Filament emission current in mA.
    pub filament_current: f64,
    /// Multiplier voltage used until calibration reports one.
    pub cdem_voltage: u32,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            start_amu: 1,
            end_amu: 100,
            points_per_amu: 10,
            filament_current: 1.0,
            cdem_voltage: 1400,
        }
    }
}

impl ScanSettings {
    /// Settings for a scan over `start..=end` AMU.
    pub fn new(start_amu: u32, end_amu: u32, points_per_amu: u32) -> Self {
        Self {
            start_amu,
            end_amu,
            points_per_amu,
            ..Self::default()
        }
    }

    /// Set the filament emission current.
    #[must_use]
    pub fn with_filament_current(mut self, milliamps: f64) -> Self {
        self.filament_current = milliamps;
        self
    }

    /// Set the default multiplier voltage.
    #[must_use]
    pub fn with_cdem_voltage(mut self, volts: u32) -> Self {
        self.cdem_voltage = volts;
        self
    }

    /// Reject empty ranges, ranges past the head's limits and step counts
    /// outside `1..=MAX_POINTS_PER_AMU`.
    pub fn validate(&self) -> Result<()> {
        if self.end_amu <= self.start_amu {
            return Err(Error::Config(format!(
                "end AMU {} must be above start AMU {}",
                self.end_amu, self.start_amu
            )));
        }
        if self.end_amu > MAX_AMU {
            return Err(Error::Config(format!(
                "end AMU {} exceeds the maximum of {MAX_AMU}",
                self.end_amu
            )));
        }
        if self.points_per_amu == 0 || self.points_per_amu > MAX_POINTS_PER_AMU {
            return Err(Error::Config(format!(
                "points per AMU must be between 1 and {MAX_POINTS_PER_AMU}, got {}",
                self.points_per_amu
            )));
        }
        self.checked_scan_points().ok_or_else(|| {
            Error::Config(format!(
                "scan {}..{} at {} points per AMU is too large",
                self.start_amu, self.end_amu, self.points_per_amu
            ))
        })?;
        if self.filament_current.is_nan() || self.filament_current <= 0.0 {
            return Err(Error::Config("filament current must be positive".into()));
        }
        Ok(())
    }

    /// Values per scan, alignment point and pressure word included.
    ///
    /// Saturates for settings that [`validate`](Self::validate) rejects.
    pub fn total_scan_points(&self) -> usize {
        self.checked_scan_points().unwrap_or(usize::MAX)
    }

    fn checked_scan_points(&self) -> Option<usize> {
        let span = usize::try_from(self.end_amu.saturating_sub(self.start_amu)).ok()?;
        let ppa = usize::try_from(self.points_per_amu).ok()?;
        span.checked_mul(ppa)?.checked_add(2)
    }
}

/// Command sequences per state plus the abort command.
#[derive(Debug, Clone)]
pub struct Catalog {
    name: String,
    sequences: HashMap<DeviceState, CommandSequence>,
    abort: Command,
    calibration: CalibrationCache,
    settings: ScanSettings,
}

impl Catalog {
    /// Create an empty catalog.
    pub fn new(name: impl Into<String>, settings: ScanSettings, abort: Command) -> Self {
        Self {
            name: name.into(),
            sequences: HashMap::new(),
            abort,
            calibration: CalibrationCache::default(),
            settings,
        }
    }

    /// Register the sequence run in `state`.
    #[must_use]
    pub fn with_sequence(mut self, state: DeviceState, sequence: CommandSequence) -> Self {
        self.sequences.insert(state, sequence);
        self
    }

    /// Catalog name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sequence for `state`, if the state has one.
    pub fn sequence_for(&self, state: DeviceState) -> Option<&CommandSequence> {
        self.sequences.get(&state)
    }

    /// Command that switches the mass filter off.
    pub fn abort_command(&self) -> &Command {
        &self.abort
    }

    /// Shared calibration values.
    pub fn calibration(&self) -> &CalibrationCache {
        &self.calibration
    }

    /// Scan settings the catalog was built for.
    pub fn scan_settings(&self) -> &ScanSettings {
        &self.settings
    }

    /// Command set of a quadrupole RGA head.
    pub fn rga(settings: ScanSettings) -> Result<Self> {
        settings.validate()?;
        let s = &settings;

        let power_up = CommandSequence::new(
            "power-up",
            vec![
                Command::new("ID?", ResponseKind::Text)?.with_validator(identification),
                Command::new("IN", ResponseKind::StatusByte)?
                    .with_parameter(0)
                    .with_validator(status_byte),
            ],
            DeviceState::PowerUp,
            DeviceState::Initialized,
        );

        let ionizer = CommandSequence::new(
            "filament-on",
            vec![
                Command::new("FL", ResponseKind::StatusByte)?
                    .with_parameter(s.filament_current)
                    .with_validator(status_byte),
            ],
            DeviceState::PowerUp,
            DeviceState::IonizerOn,
        );

        let detector = CommandSequence::new(
            "detector-on",
            vec![
                Command::new("MV?", ResponseKind::Number)?.with_validator(cdem_calibration),
                Command::new("HV", ResponseKind::StatusByte)?
                    .with_calibrated_parameter(CDEM_VOLTAGE_KEY, s.cdem_voltage)
                    .with_validator(status_byte),
            ],
            DeviceState::Initialized,
            DeviceState::DetectorOn,
        );

        let scan_setup = CommandSequence::new(
            "scan-setup",
            vec![
                Command::new("MI", ResponseKind::None)?.with_parameter(s.start_amu),
                Command::new("MF", ResponseKind::None)?.with_parameter(s.end_amu),
                Command::new("SA", ResponseKind::None)?.with_parameter(s.points_per_amu),
                Command::new("MI?", ResponseKind::Number)?
                    .with_validator(record(|info| &mut info.start_amu)),
                Command::new("MF?", ResponseKind::Number)?
                    .with_validator(record(|info| &mut info.end_amu)),
                Command::new("SA?", ResponseKind::Number)?
                    .with_validator(record(|info| &mut info.points_per_amu)),
                Command::new("AP?", ResponseKind::Number)?
                    .with_validator(record(|info| &mut info.scan_points)),
            ],
            DeviceState::PowerUp,
            DeviceState::ReadyToScan,
        );

        let start_scan = CommandSequence::new(
            "start-scan",
            vec![Command::new("SC", ResponseKind::None)?.with_parameter(1)],
            DeviceState::DetectorOn,
            DeviceState::Scanning,
        );

        let power_down = CommandSequence::new(
            "power-down",
            vec![
                Command::new("HV", ResponseKind::StatusByte)?
                    .with_parameter(0)
                    .with_validator(status_byte),
                Command::new("FL", ResponseKind::StatusByte)?
                    .with_parameter(0)
                    .with_validator(status_byte),
            ],
            DeviceState::PowerDown,
            DeviceState::PowerDown,
        );

        let abort = Command::new("MR", ResponseKind::None)?.with_parameter(0);

        Ok(Self::new("rga", settings.clone(), abort)
            .with_sequence(DeviceState::PowerUp, power_up)
            .with_sequence(DeviceState::Initialized, ionizer)
            .with_sequence(DeviceState::IonizerOn, detector)
            .with_sequence(DeviceState::DetectorOn, scan_setup)
            .with_sequence(DeviceState::StartScan, start_scan)
            .with_sequence(DeviceState::PowerDown, power_down))
    }
}

fn required<'a>(command: &Command, response: Option<&'a str>) -> Result<&'a str> {
    response.ok_or_else(|| Error::Protocol(format!("{} returned no response", command.name())))
}

/// Records the status byte; succeeds iff it is zero.
pub fn status_byte(
    command: &Command,
    ctx: &mut ValidationContext<'_>,
    response: Option<&str>,
) -> Result<bool> {
    let byte = parse_status(required(command, response)?)?;
    ctx.info.status = StatusBits::from_bits_truncate(byte);
    if byte != 0 {
        debug!(
            "{} reported status {byte:#04x} ({})",
            command.name(),
            ctx.info.status.describe()
        );
    }
    Ok(byte == 0)
}

/// Records the identification string; succeeds iff it is non-empty.
pub fn identification(
    command: &Command,
    ctx: &mut ValidationContext<'_>,
    response: Option<&str>,
) -> Result<bool> {
    let id = required(command, response)?.trim();
    if id.is_empty() {
        return Ok(false);
    }
    ctx.info.id = Some(id.to_string());
    Ok(true)
}

/// Records the calibrated multiplier voltage and propagates it to the
/// high-voltage command's parameter.
pub fn cdem_calibration(
    command: &Command,
    ctx: &mut ValidationContext<'_>,
    response: Option<&str>,
) -> Result<bool> {
    let volts = parse_number(required(command, response)?)?;
    ctx.info.cdem_voltage = Some(volts);
    if volts > 0.0 {
        ctx.calibration.set(CDEM_VOLTAGE_KEY, format!("{volts:.0}"));
    }
    Ok(true)
}

/// Validator storing an integer response in a [`DeviceInfo`] field.
pub fn record(
    field: fn(&mut DeviceInfo) -> &mut Option<u32>,
) -> impl Fn(&Command, &mut ValidationContext<'_>, Option<&str>) -> Result<bool> + Send + Sync + 'static
{
    move |command: &Command, ctx: &mut ValidationContext<'_>, response: Option<&str>| {
        let value = parse_integer(required(command, response)?)?;
        let value = u32::try_from(value)
            .map_err(|_| Error::Protocol(format!("{} out of range: {value}", command.name())))?;
        *field(ctx.info) = Some(value);
        Ok(true)
    }
}
