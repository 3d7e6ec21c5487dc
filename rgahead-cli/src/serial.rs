//! Serial port selection and head session setup.
//!
//! The port comes from `--port`, then the config file, then the only port
//! present on the host. `--simulate` replaces the port with an in-process
//! simulated head.

use {
    crate::{CliError, config::Config},
    anyhow::{Context, Result},
    log::{debug, info},
    rgahead::{
        Catalog, Head, HeadConfig, PortInfo, ScanSettings, SerialConfig,
        port::DEFAULT_BAUD,
        sim::{SimConfig, SimulatedRga},
    },
    std::{cmp::Ordering, sync::Arc},
};

/// Options for opening a head.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Explicit baud rate specified via CLI.
    pub baud: Option<u32>,
    /// Use the simulated head.
    pub simulate: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Pick the port to open.
pub fn select_serial_port(options: &SessionOptions, config: &Config) -> Result<String> {
    if let Some(port_name) = &options.port {
        return Ok(port_name.clone());
    }

    if let Some(port_name) = &config.connection.serial {
        debug!("Using port from config: {port_name}");
        return Ok(port_name.clone());
    }

    let ports = rgahead::list_ports().context("Failed to enumerate serial ports")?;
    select_only_port(ports)
}

fn select_only_port(ports: Vec<PortInfo>) -> Result<String> {
    match ports.len().cmp(&1) {
        Ordering::Equal => {
            let name = ports
                .into_iter()
                .next()
                .map(|p| p.name)
                .ok_or_else(|| usage_err("No serial ports found"))?;
            info!("Auto-selected port: {name}");
            Ok(name)
        },
        Ordering::Greater => Err(usage_err(
            "Multiple serial ports found; choose one with --port",
        )),
        Ordering::Less => Err(usage_err(
            "No serial ports found; pass --port or --simulate",
        )),
    }
}

/// An open head plus the simulator behind it, if any.
pub struct Session {
    /// The head.
    pub head: Arc<Head>,
    sim: Option<SimulatedRga>,
}

impl Session {
    /// Open a head on the selected port or on a simulator.
    pub fn open(
        options: &SessionOptions,
        config: &Config,
        settings: ScanSettings,
        head_config: HeadConfig,
    ) -> Result<Self> {
        let catalog = Arc::new(Catalog::rga(settings).map_err(|e| usage_err(&e.to_string()))?);

        if options.simulate {
            let (port, sim) = SimulatedRga::connect("simulator", SimConfig::default());
            let head = Head::new(Box::new(port), catalog, head_config)?;
            return Ok(Self {
                head: Arc::new(head),
                sim: Some(sim),
            });
        }

        let port = select_serial_port(options, config)?;
        let baud = options
            .baud
            .or(config.connection.baud)
            .unwrap_or(DEFAULT_BAUD);
        let head = Head::open(&SerialConfig::new(&port, baud), catalog, head_config)
            .with_context(|| format!("Failed to open {port} at {baud} baud"))?;
        Ok(Self {
            head: Arc::new(head),
            sim: None,
        })
    }

    /// Whether the head is simulated.
    pub fn is_simulated(&self) -> bool {
        self.sim.is_some()
    }

    /// Power down and close.
    pub fn close(self) {
        self.head.dispose();
        if let Some(sim) = self.sim {
            sim.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }

    #[test]
    fn test_explicit_port_wins() {
        let options = SessionOptions {
            port: Some("/dev/ttyS3".into()),
            ..SessionOptions::default()
        };
        let mut config = Config::default();
        config.connection.serial = Some("/dev/ttyUSB0".into());
        assert_eq!(select_serial_port(&options, &config).unwrap(), "/dev/ttyS3");
    }

    #[test]
    fn test_config_port_used_when_no_flag() {
        let mut config = Config::default();
        config.connection.serial = Some("/dev/ttyUSB0".into());
        assert_eq!(
            select_serial_port(&SessionOptions::default(), &config).unwrap(),
            "/dev/ttyUSB0"
        );
    }

    #[test]
    fn test_only_port_selected() {
        assert_eq!(select_only_port(vec![port("COM4")]).unwrap(), "COM4");
    }

    #[test]
    fn test_zero_or_many_ports_are_usage_errors() {
        for ports in [vec![], vec![port("a"), port("b")]] {
            let err = select_only_port(ports).unwrap_err();
            assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_))));
        }
    }

    #[test]
    fn test_simulated_session_opens() {
        let options = SessionOptions {
            simulate: true,
            ..SessionOptions::default()
        };
        let session = Session::open(
            &options,
            &Config::default(),
            ScanSettings::new(1, 3, 2),
            HeadConfig::default(),
        )
        .unwrap();
        assert!(session.is_simulated());
        assert_eq!(session.head.state(), rgahead::DeviceState::PowerUp);
        session.close();
    }
}
