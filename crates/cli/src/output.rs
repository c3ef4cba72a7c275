//! Output formatting for CLI responses

use agnos_flash::{FlashPlan, PartitionVariant, ReleaseCatalog, StorageInfo};
use anyhow::Error;
use colored::*;
use serde::Serialize;
use serde_json::json;

use crate::commands::simulate::SimulationReport;
use crate::error::CliError;

/// Print error in JSON format on stderr, leaving stdout to the command result
pub fn print_error_json(error: &Error) {
    let error_json = json!({
        "success": false,
        "error": {
            "message": error.to_string(),
            "type": error_type_name(error),
            "code": flash_error_code(error),
        }
    });
    match serde_json::to_string_pretty(&error_json) {
        Ok(s) => eprintln!("{}", s),
        Err(e) => eprintln!("Failed to format error as JSON: {}", e),
    }
}

/// Print error in human-readable format
pub fn print_error_human(error: &Error) {
    eprintln!("{} {}", "Error:".red().bold(), error);

    let mut source = error.source();
    while let Some(err) = source {
        eprintln!("  {} {}", "Caused by:".yellow(), err);
        source = err.source();
    }
}

/// Print the release catalog
pub fn print_releases(catalog: &ReleaseCatalog, json: bool) {
    if json {
        let output = json!({
            "success": true,
            "versions": catalog.versions,
            "loader": catalog.loader,
        });
        print_json(&output, "release list");
        return;
    }

    println!("{}", "Available releases:".bold());
    for release in &catalog.versions {
        let marker = if release.is_latest {
            " (latest)".green().to_string()
        } else {
            String::new()
        };
        println!("  {} {}{}", "●".cyan(), release.name.bold(), marker);
        println!("    {} {}", "Id:".dimmed(), release.id);
        println!("    {} {}", "Manifest:".dimmed(), release.manifest);
    }
    println!("{} {}", "Programmer:".dimmed(), catalog.loader.url);
}

/// Print a device classification
pub fn print_classification(info: &StorageInfo, variant: PartitionVariant, json: bool) {
    if json {
        let output = json!({
            "success": true,
            "variant": variant,
            "image": variant.image_name(),
            "capacity": variant.capacity_label(),
            "storage": info,
        });
        print_json(&output, "classification");
        return;
    }

    println!(
        "{} {} ({}, {} blocks)",
        "✓".green(),
        variant.image_name().bold(),
        variant.capacity_label(),
        info.total_blocks
    );
}

/// Print a flash plan
pub fn print_plan(manifest: &str, plan: &FlashPlan, json: bool) {
    if json {
        let output = json!({
            "success": true,
            "manifest": manifest,
            "plan": plan,
            "bytes": plan.bytes_written(),
        });
        print_json(&output, "plan");
        return;
    }

    println!("{} {}", "Manifest:".bold(), manifest);
    match plan.variant {
        Some(variant) => println!(
            "{} {} ({})",
            "Variant:".bold(),
            variant.image_name(),
            variant.capacity_label()
        ),
        None => println!("{} {}", "Variant:".bold(), "unknown".yellow()),
    }
    let userdata = if plan.preserve_userdata {
        "preserved".yellow()
    } else {
        "replaced".normal()
    };
    println!("{} {}", "Userdata:".bold(), userdata);

    println!("{}", "Partition tables:".bold());
    if plan.repairs.is_empty() {
        println!("  {}", "none".dimmed());
    }
    for repair in &plan.repairs {
        println!("  LUN {} ← {}", repair.lun, repair.image);
    }

    println!("{}", "System images:".bold());
    for write in &plan.writes {
        println!(
            "  {} ({}) → {}",
            write.image,
            format_bytes(write.size),
            write.targets.join(", ")
        );
    }
    println!(
        "{} {} to {} partitions, then boot slot {}",
        "Total:".bold(),
        format_bytes(plan.bytes_written()),
        plan.partitions().count(),
        plan.boot_slot
    );
}

/// Print the result of a simulated run
pub fn print_simulation(report: &SimulationReport, show_calls: bool, json: bool) {
    if json {
        let output = json!({
            "success": report.status.error.is_none(),
            "report": report,
        });
        print_json(&output, "simulation report");
        return;
    }

    let status = &report.status;
    println!("{} {}", "Manifest:".bold(), report.manifest);
    println!("{} {}", "Step:".bold(), status.step);
    if let Some(serial) = &status.serial {
        println!("{} {}", "Serial:".bold(), serial);
    }
    match status.error {
        Some(kind) => println!(
            "{} {} (code {})",
            "Error:".red().bold(),
            kind.description(),
            kind.code()
        ),
        None => println!("{} {}", "Error:".bold(), "none".green()),
    }
    println!(
        "{} {} partitions in {} ms",
        "Written:".bold(),
        report.written.len(),
        report.elapsed_ms
    );
    for (partition, len) in &report.written {
        let size = format_bytes(u64::try_from(*len).unwrap_or(u64::MAX));
        println!("  {} {}", partition, size.dimmed());
    }

    if show_calls {
        println!("{}", "Device calls:".bold());
        for (index, call) in report.calls.iter().enumerate() {
            let line = serde_json::to_string(call).unwrap_or_else(|_| format!("{call:?}"));
            println!("  {:>3} {}", index, line);
        }
    }
}

fn print_json<T: Serialize>(value: &T, what: &str) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => eprintln!("Failed to format {} as JSON: {}", what, e),
    }
}

fn flash_error_code(error: &Error) -> Option<i8> {
    match error.downcast_ref::<CliError>() {
        Some(CliError::FlashFailed(kind)) => Some(kind.code()),
        _ => None,
    }
}

fn error_type_name(error: &Error) -> &'static str {
    error
        .downcast_ref::<CliError>()
        .map_or("Error", CliError::type_name)
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024 && unit + 1 < UNITS.len() {
        value /= 1024;
        unit += 1;
    }
    format!("{} {}", value, UNITS.get(unit).unwrap_or(&"B"))
}
