//! `list-ports` command.

use anyhow::{Context, Result};
use console::style;
use rgahead::PortInfo;

/// List the serial ports present on this host.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = rgahead::list_ports().context("Failed to enumerate serial ports")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports").bold().underlined());
    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
    }
    for port in &ports {
        eprintln!("  {} {}", style("•").green(), describe(port));
    }
    Ok(())
}

fn describe(port: &PortInfo) -> String {
    let mut line = style(&port.name).cyan().to_string();
    if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        line.push_str(&format!(" ({vid:04X}:{pid:04X})"));
    }
    if let Some(product) = port.product.as_deref().filter(|p| !p.is_empty()) {
        line.push_str(&format!(" - {}", style(product).dim()));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_includes_usb_ids() {
        console::set_colors_enabled(false);
        let port = PortInfo {
            name: "/dev/ttyUSB0".into(),
            vid: Some(0x0403),
            pid: Some(0x6001),
            manufacturer: Some("FTDI".into()),
            product: Some("USB-RS232".into()),
            serial_number: None,
        };
        assert_eq!(describe(&port), "/dev/ttyUSB0 (0403:6001) - USB-RS232");
    }
}
