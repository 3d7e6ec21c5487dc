//! Configuration file support for rgahead.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (RGAHEAD_*)
//! 3. Local config file (./rgahead.toml)
//! 4. Global config file (~/.config/rgahead/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use rgahead::{HeadConfig, ScanSettings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
}

/// Scan range and detector settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanConfig {
    /// First AMU.
    pub start_amu: Option<u32>,
    /// Last AMU.
    pub end_amu: Option<u32>,
    /// Steps per AMU.
    pub points_per_amu: Option<u32>,
    /// Filament emission current in mA.
    pub filament_current: Option<f64>,
    /// Multiplier voltage used until calibration reports one.
    pub cdem_voltage: Option<u32>,
}

impl ScanConfig {
    /// Apply the configured values on top of the library defaults.
    pub fn settings(&self) -> ScanSettings {
        let defaults = ScanSettings::default();
        ScanSettings {
            start_amu: self.start_amu.unwrap_or(defaults.start_amu),
            end_amu: self.end_amu.unwrap_or(defaults.end_amu),
            points_per_amu: self.points_per_amu.unwrap_or(defaults.points_per_amu),
            filament_current: self.filament_current.unwrap_or(defaults.filament_current),
            cdem_voltage: self.cdem_voltage.unwrap_or(defaults.cdem_voltage),
        }
    }
}

/// Head timing, in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Wait for each command's response.
    pub command_timeout_ms: Option<u64>,
    /// Time a scan may take before the watchdog recovers.
    pub watchdog_timeout_ms: Option<u64>,
    /// Bound on the watchdog's lock acquisition.
    pub watchdog_lock_timeout_ms: Option<u64>,
    /// Pause after aborting a scan.
    pub abort_settle_ms: Option<u64>,
}

impl TimingConfig {
    /// Apply the configured values on top of the library defaults.
    pub fn head_config(&self) -> HeadConfig {
        let mut config = HeadConfig::default();
        if let Some(ms) = self.command_timeout_ms {
            config = config.with_command_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.watchdog_timeout_ms {
            config = config.with_watchdog_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.watchdog_lock_timeout_ms {
            config = config.with_watchdog_lock_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.abort_settle_ms {
            config = config.with_abort_settle(Duration::from_millis(ms));
        }
        config
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Scan settings.
    #[serde(default)]
    pub scan: ScanConfig,
    /// Head timing.
    #[serde(default)]
    pub timing: TimingConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new("rgahead.toml")) {
            debug!("Loaded local config from rgahead.toml");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "rgahead").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one. Values set in `other` win.
    fn merge(&mut self, other: Self) {
        let Self {
            connection,
            scan,
            timing,
        } = other;

        self.connection.serial = connection.serial.or(self.connection.serial.take());
        self.connection.baud = connection.baud.or(self.connection.baud);

        self.scan.start_amu = scan.start_amu.or(self.scan.start_amu);
        self.scan.end_amu = scan.end_amu.or(self.scan.end_amu);
        self.scan.points_per_amu = scan.points_per_amu.or(self.scan.points_per_amu);
        self.scan.filament_current = scan.filament_current.or(self.scan.filament_current);
        self.scan.cdem_voltage = scan.cdem_voltage.or(self.scan.cdem_voltage);

        self.timing.command_timeout_ms = timing.command_timeout_ms.or(self.timing.command_timeout_ms);
        self.timing.watchdog_timeout_ms =
            timing.watchdog_timeout_ms.or(self.timing.watchdog_timeout_ms);
        self.timing.watchdog_lock_timeout_ms = timing
            .watchdog_lock_timeout_ms
            .or(self.timing.watchdog_lock_timeout_ms);
        self.timing.abort_settle_ms = timing.abort_settle_ms.or(self.timing.abort_settle_ms);
    }
}
