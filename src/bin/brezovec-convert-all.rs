//! Brezovec Convert All - batch conversion of every session
//!
//! Looks for `imports/<session>/<subject>/<func*>/TSeries-*/TSeries-*.xml`
//! under the data directory and converts each match. A failing session is
//! logged and skipped; the exit status is non-zero if any session failed.
//!
//! # Usage
//!
//! ```bash
//! # Everything, in stub mode
//! brezovec-convert-all --data-dir brezovec_example_data --stub-test
//!
//! # Only some sessions/subjects
//! brezovec-convert-all -d brezovec_example_data --session 20200620 --subject fly2
//!
//! # Show what would be converted
//! brezovec-convert-all -d brezovec_example_data --dry-run
//! ```

use anyhow::Result;
use clap::Parser;
use clandinin_nwb_toolbox::cli::BatchArgs;
use clandinin_nwb_toolbox::converter::{discover_sessions, session_to_nwb};
use std::time::Instant;

fn main() -> Result<()> {
    let args = BatchArgs::parse();

    if !args.options.quiet {
        clandinin_nwb_toolbox::display_license_notice("brezovec-convert-all");
        clandinin_nwb_toolbox::init_tracing();
    }

    let sessions: Vec<(String, String)> = discover_sessions(&args.options.data_dir)?
        .into_iter()
        .filter(|(session_id, subject_id)| args.selects(session_id, subject_id))
        .collect();

    println!("Found {} session(s) under {}", sessions.len(), args.options.data_dir.display());
    for (session_id, subject_id) in &sessions {
        println!("  {}\t{}", session_id, subject_id);
    }
    println!();

    if args.dry_run {
        return Ok(());
    }

    let mut failures = Vec::new();
    for (index, (session_id, subject_id)) in sessions.iter().enumerate() {
        println!("[{}/{}] {} {}", index + 1, sessions.len(), session_id, subject_id);
        let started = Instant::now();

        match session_to_nwb(&args.conversion(subject_id, session_id)) {
            Ok(output) => println!(
                "\t✓ {} ({:.1}s)",
                output.display(),
                started.elapsed().as_secs_f64()
            ),
            Err(e) => {
                tracing::error!("Session {} subject {} failed: {:#}", session_id, subject_id, e);
                println!("\t✗ {:#}", e);
                failures.push(format!("{session_id}/{subject_id}"));
            }
        }
    }

    println!();
    println!(
        "Converted {} of {} session(s)",
        sessions.len() - failures.len(),
        sessions.len()
    );

    if !failures.is_empty() {
        anyhow::bail!("{} session(s) failed: {}", failures.len(), failures.join(", "));
    }
    Ok(())
}
