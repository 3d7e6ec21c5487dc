//! `scan` command: drive the head to scanning and export each spectrum.

use anyhow::{Context, Result, bail};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use rgahead::{ControlLoop, Head, HeadEvent, PollOutcome, ScanResult, Spectrum};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::{Cli, CliError, config::Config, open_session, use_fancy_output, was_interrupted};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Failures in a row after which the command gives up.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Output options of the scan command.
#[derive(Debug, Clone)]
pub(crate) struct ScanOptions<'a> {
    /// Scans to take.
    pub count: u32,
    /// Destination; stdout when absent.
    pub output: Option<&'a Path>,
    /// Write JSON instead of TSV.
    pub json: bool,
}

/// Run scans until `count` completed, then power the head down.
pub(crate) fn cmd_scan(cli: &Cli, config: &Config, options: &ScanOptions<'_>) -> Result<()> {
    let session = open_session(cli, config)?;
    if !cli.quiet {
        let source = if session.is_simulated() {
            "simulated head".to_string()
        } else {
            session.head.name().to_string()
        };
        eprintln!("{} Using {}", style("🔌").cyan(), style(source).green());
    }

    let result = run_scans(cli, &session.head, options);

    if was_interrupted() && session.head.state().is_scanning() {
        info!("Interrupted; aborting scan");
        session.head.abort_scan();
    }
    session.close();
    result
}

fn progress_bar(cli: &Cli) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

fn run_scans(cli: &Cli, head: &Arc<Head>, options: &ScanOptions<'_>) -> Result<()> {
    let events = head.subscribe();
    let control = ControlLoop::new(Arc::clone(head)).with_poll_interval(POLL_INTERVAL);
    let pb = progress_bar(cli);

    let mut completed = 0u32;
    let mut failures = 0u32;
    while completed < options.count {
        if was_interrupted() {
            pb.abandon_with_message("interrupted");
            return Err(CliError::Cancelled("scan interrupted".to_string()).into());
        }

        match control.poll_once() {
            PollOutcome::Halted => bail!("Head powered down"),
            PollOutcome::Ran { from, to } => {
                debug!("{from} -> {to}");
                pb.set_message(to.to_string());
            },
            PollOutcome::ScanStarted => {
                let progress = head.scan_progress();
                pb.set_length(progress.expected as u64);
                pb.set_position(0);
                pb.set_message(format!("scan {}/{}", completed + 1, options.count));
            },
            PollOutcome::Scanning | PollOutcome::Idle => {
                pb.set_position(head.scan_progress().values as u64);
                thread::sleep(POLL_INTERVAL);
            },
        }

        for event in events.try_iter() {
            match event {
                HeadEvent::ScanCompleted => {
                    if let Some(scan) = head.last_scan_result() {
                        completed += 1;
                        failures = 0;
                        pb.set_position(scan.len() as u64);
                        export(&scan, options, completed)?;
                    }
                },
                HeadEvent::Exception {
                    kind,
                    message,
                    context,
                } => {
                    failures += 1;
                    pb.println(format!(
                        "{} {kind:?} in {context}: {message}",
                        style("⚠").yellow()
                    ));
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        pb.abandon();
                        bail!("Giving up after {failures} consecutive failures: {message}");
                    }
                },
                HeadEvent::StateChanged { .. } | HeadEvent::TerminalLog(_) => {},
            }
        }
    }

    pb.finish_and_clear();
    if !cli.quiet {
        eprintln!(
            "{} {completed} scan(s) complete",
            style("✓").green()
        );
    }
    Ok(())
}

fn export(scan: &ScanResult, options: &ScanOptions<'_>, index: u32) -> Result<()> {
    let spectrum = Spectrum::from_scan(scan);
    match options.output {
        None => write_spectrum(&spectrum, io::stdout().lock(), options.json),
        Some(path) => {
            let path = numbered_path(path, index, options.count);
            let file = File::create(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            write_spectrum(&spectrum, BufWriter::new(file), options.json)?;
            info!("Wrote {} points to {}", spectrum.len(), path.display());
            Ok(())
        },
    }
}

fn write_spectrum<W: Write>(spectrum: &Spectrum, mut out: W, json: bool) -> Result<()> {
    if json {
        serde_json::to_writer_pretty(&mut out, spectrum)?;
        writeln!(out)?;
        out.flush()?;
    } else {
        spectrum.write_tsv(out)?;
    }
    Ok(())
}

/// `scan.tsv` becomes `scan-2.tsv` when more than one scan is taken.
fn numbered_path(path: &Path, index: u32, count: u32) -> PathBuf {
    if count <= 1 {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}-{index}.{}", ext.to_string_lossy()),
        None => format!("{stem}-{index}"),
    };
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbered_path() {
        let path = Path::new("/tmp/out/scan.tsv");
        assert_eq!(numbered_path(path, 1, 1), PathBuf::from("/tmp/out/scan.tsv"));
        assert_eq!(numbered_path(path, 2, 3), PathBuf::from("/tmp/out/scan-2.tsv"));
        assert_eq!(
            numbered_path(Path::new("spectrum"), 3, 3),
            PathBuf::from("spectrum-3")
        );
    }

    #[test]
    fn test_write_spectrum_json() {
        let spectrum = Spectrum::from_scan(&ScanResult::new(vec![4, 8, 2], 10, 1));
        let mut out = Vec::new();
        write_spectrum(&spectrum, &mut out, true).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["total_pressure"], 2);
        assert_eq!(value["points"][1]["amu"], 11.0);
        assert_eq!(value["points"][1]["intensity"], 4.0);
    }
}
