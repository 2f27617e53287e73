// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Report artefacts
//!
//! Two views of the same [`FleetReport`]: a JSON file with stable field
//! order and a sorted result list (two runs with the same outcomes produce
//! byte-identical JSON modulo timestamps), and a human-readable summary
//! for the operator driving the maintenance window.

use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use fleet_common::config::OperationKind;
use fleet_common::report::FleetReport;
use fleet_common::report::OperationResult;
use fleet_common::report::OperationStatus;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

/// File name for the JSON artefact of a run:
/// `<operation>-report-<ISO8601 basic UTC>.json`.
pub fn report_file_name(
    operation: OperationKind,
    started_at: DateTime<Utc>,
) -> String {
    format!(
        "{}-report-{}.json",
        operation.label(),
        started_at.format("%Y%m%dT%H%M%SZ")
    )
}

/// Serialize the report with stable field order.
pub fn to_json_bytes(report: &FleetReport) -> Vec<u8> {
    let mut bytes = serde_json::to_vec_pretty(report)
        .expect("report serialization is infallible");
    bytes.push(b'\n');
    bytes
}

/// Write the JSON artefact into `dir` and return its path.
pub fn write_json(
    report: &FleetReport,
    dir: &Path,
) -> io::Result<PathBuf> {
    let path = dir.join(report_file_name(
        report.config.operation,
        report.started_at,
    ));
    std::fs::write(&path, to_json_bytes(report))?;
    Ok(path)
}

/// Render the human-readable summary.
pub fn write_summary<W: Write>(
    report: &FleetReport,
    out: &mut W,
) -> io::Result<()> {
    let operation = report.config.operation;
    writeln!(out, "{:=<70}", "")?;
    writeln!(
        out,
        "{} report for project {:?}",
        operation, report.config.project
    )?;
    writeln!(out, "{:=<70}", "")?;

    writeln!(out)?;
    writeln!(
        out,
        "started:   {}",
        report.started_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    )?;
    writeln!(
        out,
        "finished:  {}",
        report.finished_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    )?;
    writeln!(
        out,
        "duration:  {}",
        format_duration(report.duration_seconds)
    )?;
    if let Some(message) = &report.message {
        writeln!(out, "note:      {message}")?;
    }

    writeln!(out)?;
    writeln!(out, "statistics")?;
    writeln!(out, "{:-<40}", "")?;
    let stats = &report.statistics;
    for (label, value) in [
        ("total", stats.total),
        ("eligible", stats.eligible),
        ("up to date", stats.up_to_date),
        ("started", stats.started),
        ("succeeded", stats.succeeded),
        ("failed", stats.failed),
        ("skipped", stats.skipped),
        ("compensated", stats.compensated),
    ] {
        writeln!(out, "{label:<20} {value}")?;
    }

    let succeeded: Vec<&OperationResult> = report
        .results
        .iter()
        .filter(|r| {
            matches!(
                r.status,
                OperationStatus::Succeeded | OperationStatus::Compensated
            )
        })
        .collect();
    let durations: Vec<f64> =
        succeeded.iter().filter_map(|r| r.duration_seconds).collect();
    if durations.len() > 1 {
        let total: f64 = durations.iter().sum();
        let fastest =
            durations.iter().cloned().fold(f64::INFINITY, f64::min);
        let slowest = durations.iter().cloned().fold(0.0, f64::max);
        writeln!(out)?;
        writeln!(out, "timing across {} operations", durations.len())?;
        writeln!(out, "{:-<40}", "")?;
        writeln!(
            out,
            "mean:      {}",
            format_duration(total / durations.len() as f64)
        )?;
        writeln!(out, "fastest:   {}", format_duration(fastest))?;
        writeln!(out, "slowest:   {}", format_duration(slowest))?;
    }

    let failed: Vec<&OperationResult> = report
        .results
        .iter()
        .filter(|r| r.status == OperationStatus::Failed)
        .collect();
    if !failed.is_empty() {
        writeln!(out)?;
        writeln!(out, "failures")?;
        writeln!(out, "{:-<70}", "")?;
        writeln!(
            out,
            "{:<25} {:<20} {:<12} error",
            "instance", "location", "kind"
        )?;
        for result in failed {
            writeln!(
                out,
                "{:<25} {:<20} {:<12} {}",
                result.instance,
                result.location,
                result
                    .error_kind
                    .map(|kind| format!("{kind:?}"))
                    .unwrap_or_else(|| "-".to_string()),
                truncated(result.error_message.as_deref().unwrap_or("-"), 60),
            )?;
        }
    }

    let skipped: Vec<&OperationResult> = report
        .results
        .iter()
        .filter(|r| r.status == OperationStatus::Skipped)
        .collect();
    if !skipped.is_empty() {
        writeln!(out)?;
        writeln!(out, "skipped")?;
        writeln!(out, "{:-<70}", "")?;
        writeln!(out, "{:<25} {:<20} reason", "instance", "location")?;
        for result in skipped {
            writeln!(
                out,
                "{:<25} {:<20} {}",
                result.instance,
                result.location,
                truncated(result.error_message.as_deref().unwrap_or("-"), 60),
            )?;
        }
    }

    let dry_run: Vec<&OperationResult> = report
        .results
        .iter()
        .filter(|r| r.status == OperationStatus::DryRun)
        .collect();
    if !dry_run.is_empty() {
        writeln!(out)?;
        writeln!(out, "dry run: would {operation}")?;
        writeln!(out, "{:-<70}", "")?;
        writeln!(
            out,
            "{:<25} {:<20} target version",
            "instance", "location"
        )?;
        for result in dry_run {
            writeln!(
                out,
                "{:<25} {:<20} {}",
                result.instance,
                result.location,
                result.target_version.as_deref().unwrap_or("-"),
            )?;
        }
    }

    writeln!(out)?;
    writeln!(out, "{:=<70}", "")?;
    Ok(())
}

/// Humanize a duration in seconds.
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{seconds:.1}s")
    } else if seconds < 3600.0 {
        let minutes = (seconds / 60.0).floor() as u64;
        format!("{}m {:.0}s", minutes, seconds % 60.0)
    } else {
        let hours = (seconds / 3600.0).floor() as u64;
        let minutes = ((seconds % 3600.0) / 60.0).floor() as u64;
        format!("{}h {}m {:.0}s", hours, minutes, seconds % 60.0)
    }
}

fn truncated(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        text.to_string()
    } else {
        let cut = text
            .char_indices()
            .take_while(|(index, _)| *index < limit)
            .last()
            .map(|(index, _)| index)
            .unwrap_or(0);
        format!("{}...", &text[..cut])
    }
}
