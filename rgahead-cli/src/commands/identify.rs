//! `identify` command: power the head up and report who it is.

use anyhow::{Result, bail};
use console::style;
use rgahead::{DeviceInfo, DeviceState, Head, HeadEvent};

use crate::{Cli, config::Config, open_session};

/// Run the power-up sequence and print the identification and status.
pub(crate) fn cmd_identify(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let session = open_session(cli, config)?;
    let outcome = identify(&session.head);
    session.close();
    let info = outcome?;

    if json {
        let value = serde_json::json!({
            "id": info.id,
            "status": info.status.bits(),
            "status_text": info.status.describe(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("{}", info.id.as_deref().unwrap_or("unknown"));
    if !cli.quiet {
        let status = info.status.describe();
        let status = if info.status.is_empty() {
            style(status).green()
        } else {
            style(status).red()
        };
        eprintln!("{} status: {status}", style("ℹ").blue());
    }
    Ok(())
}

fn identify(head: &Head) -> Result<DeviceInfo> {
    let Some(sequence) = head.catalog().sequence_for(DeviceState::PowerUp) else {
        bail!("Catalog has no power-up sequence");
    };
    let events = head.subscribe();
    head.execute_sequence(sequence);

    if head.state() != DeviceState::Initialized {
        let reason = events
            .try_iter()
            .find_map(|event| match event {
                HeadEvent::Exception { message, .. } => Some(message),
                _ => None,
            })
            .unwrap_or_else(|| format!("ended in {}", head.state()));
        bail!("Head did not initialize: {reason}");
    }
    Ok(head.device_info())
}
