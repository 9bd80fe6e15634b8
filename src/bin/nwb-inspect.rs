//! NWB Inspect - NWB-Zarr container inspection
//!
//! Displays the session metadata, devices, imaging planes and every time
//! series of a container written by `brezovec-convert`.
//!
//! # Usage
//!
//! ```bash
//! nwb-inspect conversion_nwb/20200620_fly2.nwb.zarr
//!
//! # Attributes of every object, conversion provenance
//! nwb-inspect conversion_nwb/20200620_fly2.nwb.zarr --verbose
//!
//! # Only some series
//! nwb-inspect conversion_nwb/20200620_fly2.nwb.zarr --series TwoPhotonSeriesFunctionalGreen
//! ```

use anyhow::Result;
use clap::Parser;
use clandinin_nwb_toolbox::nwb::NwbStore;
use serde_json::Value;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "nwb-inspect")]
#[command(about = "Inspect NWB-Zarr containers written by brezovec-convert")]
#[command(version)]
struct Args {
    /// Path to the .nwb.zarr container
    file_path: PathBuf,

    /// Show every attribute and the conversion provenance
    #[arg(short, long)]
    verbose: bool,

    /// Filter to specific series name(s)
    #[arg(short, long)]
    series: Option<Vec<String>>,
}

fn attr_str<'a>(attrs: &'a Value, key: &str) -> &'a str {
    attrs.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

fn print_attributes(attrs: &Value, indent: &str) {
    if let Some(map) = attrs.as_object() {
        for (key, value) in map {
            if matches!(key.as_str(), "neurodata_type" | "namespace" | "object_id") {
                continue;
            }
            println!("{}   {}: {}", indent, key, value);
        }
    }
}

fn print_tree_branch(index: usize, count: usize) -> (&'static str, &'static str) {
    if index + 1 == count {
        ("  └─", "     ")
    } else {
        ("  ├─", "  │  ")
    }
}

fn inspect_series(nwb: &NwbStore, group: &str, name: &str, indent: &str, verbose: bool) -> Result<()> {
    let path = format!("{group}/{name}");
    let attrs = nwb.read_attributes(&path)?;
    println!("{}├─ Type: {}", indent, attr_str(&attrs, "neurodata_type"));

    if nwb.has_array(&format!("{path}/data"))? {
        let shape = nwb.array_shape(&format!("{path}/data"))?;
        println!("{}├─ Data: {:?}", indent, shape);
    }

    if let Some(rate) = attrs.get("rate").and_then(|v| v.as_f64()) {
        let starting_time = attrs.get("starting_time").and_then(|v| v.as_f64()).unwrap_or(0.0);
        println!("{}├─ Rate: {:.4} Hz", indent, rate);
        println!("{}├─ Starting time: {:+.3} s", indent, starting_time);
    }

    let timestamps_path = format!("{path}/timestamps");
    if nwb.has_array(&timestamps_path)? {
        let timestamps = nwb.read_f64_1d(&timestamps_path)?;
        match (timestamps.first(), timestamps.last()) {
            (Some(first), Some(last)) if timestamps.len() > 1 => {
                println!("{}├─ Samples: {}", indent, timestamps.len());
                println!("{}├─ Time Range: {:.6} → {:.6}", indent, first, last);
            }
            _ => println!("{}├─ Samples: {}", indent, timestamps.len()),
        }
    }

    if let Some(files) = attrs.get("external_file").and_then(|v| v.as_array()) {
        for file in files {
            println!("{}├─ External file: {}", indent, file.as_str().unwrap_or(""));
        }
    }

    if verbose {
        print_attributes(&attrs, indent);
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    clandinin_nwb_toolbox::display_license_notice("nwb-inspect");

    println!("╔════════════════════════════════════════════════════════════════╗");
    println!("║              NWB-Zarr Container Inspector                      ║");
    println!("╚════════════════════════════════════════════════════════════════╝");
    println!();
    println!("Store: {}", args.file_path.display());
    println!();

    let nwb = NwbStore::open(&args.file_path)?;
    let root = nwb.read_attributes("/")?;

    println!("SESSION");
    for key in ["identifier", "session_id", "session_start_time", "lab", "institution"] {
        if let Some(value) = root.get(key).and_then(|v| v.as_str()) {
            println!("  {}: {}", key, value);
        }
    }
    if nwb.has_group("/general/subject")? {
        let subject = nwb.read_attributes("/general/subject")?;
        println!("  subject: {} ({})", attr_str(&subject, "subject_id"), attr_str(&subject, "species"));
    }
    if args.verbose
        && let Some(conversion) = root.get("conversion")
    {
        println!("  conversion: {}", serde_json::to_string_pretty(conversion)?);
    }
    println!();

    if nwb.has_group("/general/devices")? {
        let devices = nwb.children("/general/devices")?;
        println!("DEVICES ({} found)", devices.len());
        for (index, device) in devices.iter().enumerate() {
            let (prefix, _) = print_tree_branch(index, devices.len());
            let attrs = nwb.read_attributes(&format!("/general/devices/{device}"))?;
            println!("{} {} - {}", prefix, device, attr_str(&attrs, "manufacturer"));
        }
        println!();
    }

    if nwb.has_group("/general/optophysiology")? {
        let planes = nwb.children("/general/optophysiology")?;
        println!("IMAGING PLANES ({} found)", planes.len());
        for (index, plane) in planes.iter().enumerate() {
            let (prefix, indent) = print_tree_branch(index, planes.len());
            let path = format!("/general/optophysiology/{plane}");
            let attrs = nwb.read_attributes(&path)?;
            println!("{} {} ({})", prefix, plane, attr_str(&attrs, "indicator"));
            if let Some(rate) = attrs.get("imaging_rate").and_then(|v| v.as_f64()) {
                println!("{}├─ Imaging rate: {:.4} Hz", indent, rate);
            }
            for channel in nwb.children(&path)? {
                println!("{}├─ {}", indent, channel);
            }
            if args.verbose {
                print_attributes(&attrs, indent);
            }
        }
        println!();
    }

    let mut series_groups = vec!["/acquisition".to_string()];
    if nwb.has_group("/processing")? {
        for module in nwb.children("/processing")? {
            let module_path = format!("/processing/{module}");
            series_groups.push(module_path.clone());
            for container in nwb.children(&module_path)? {
                let container_path = format!("{module_path}/{container}");
                let attrs = nwb.read_attributes(&container_path)?;
                if attr_str(&attrs, "neurodata_type") == "Position" {
                    series_groups.push(container_path);
                }
            }
        }
    }

    let mut series_count = 0;
    for group in &series_groups {
        let names: Vec<String> = nwb
            .children(group)?
            .into_iter()
            .filter(|name| {
                args.series
                    .as_ref()
                    .is_none_or(|filter| filter.contains(name))
            })
            .filter(|name| {
                nwb.read_attributes(&format!("{group}/{name}"))
                    .map(|attrs| attr_str(&attrs, "neurodata_type").ends_with("Series"))
                    .unwrap_or(false)
            })
            .collect();

        if names.is_empty() {
            continue;
        }

        println!("{} ({} series)", group, names.len());
        for (index, name) in names.iter().enumerate() {
            let (prefix, indent) = print_tree_branch(index, names.len());
            println!("{} {}", prefix, name);
            if let Err(e) = inspect_series(&nwb, group, name, indent, args.verbose) {
                println!("{}├─ WARNING: {}", indent, e);
            }
        }
        series_count += names.len();
        println!();
    }

    println!(
        "Summary: {} series{}",
        series_count,
        if args.series.is_some() { " (filtered)" } else { "" }
    );
    println!();

    Ok(())
}
