//! Clandinin NWB Toolbox - convert Brezovec two-photon imaging sessions to NWB
//!
//! This crate provides command-line tools and library functions for turning the raw files of
//! a Bruker two-photon imaging session with FicTrac behavioural tracking into one NWB
//! container (Zarr backend), with every stream placed on a single session timeline.
//!
//! # Overview
//!
//! A session is recorded by independent instruments: the Bruker microscope acquires a
//! functional and an anatomical scan (each with a green and a red channel), FicTrac logs
//! the ball motion and a camera records video. Each keeps its own clock. The toolbox finds
//! the files of a session by naming convention, reads the instrument metadata, aligns the
//! clocks to the functional scan start and writes everything as NWB objects.
//!
//! # Key Features
//!
//! - **Session discovery** by prefix/suffix and folder-name conventions, with not-found and
//!   ambiguous matches reported instead of guessed
//! - **Streaming PrairieView XML** reading with early exit
//! - **Clock alignment** on time-zone-aware instants
//! - **Metadata defaults** from the instrument, deep-merged with a YAML/JSON override
//! - **Atomic output**: containers appear only when the conversion succeeds
//! - **Stub mode** for quick test conversions
//!
//! # Command-Line Tools
//!
//! - [`brezovec-convert`](../brezovec_convert/index.html) - Convert one session
//! - [`brezovec-convert-all`](../brezovec_convert_all/index.html) - Convert every session under `imports/`
//! - [`nwb-inspect`](../nwb_inspect/index.html) - Inspect a written container
//!
//! # Quick Start
//!
//! ```bash
//! # Stub conversion of one session (10 frames per imaging series)
//! brezovec-convert --data-dir brezovec_example_data --session-id 20200620 --subject-id fly2 --stub-test
//!
//! # Full conversion of every session
//! brezovec-convert-all --data-dir brezovec_example_data --output-dir conversion_nwb
//!
//! # Look at the result
//! nwb-inspect conversion_nwb/20200620_fly2.nwb.zarr --verbose
//! ```
//!
//! # Container Structure
//!
//! ```text
//! 20200620_fly2.nwb.zarr/
//! ├── zarr.json                         (NWBFile attributes + conversion provenance)
//! ├── general/
//! │   ├── subject/
//! │   ├── devices/{BrukerUltima, Flea FL3-U3-13E4M-C}/
//! │   └── optophysiology/ImagingPlane*/OpticalChannel*/
//! ├── acquisition/
//! │   ├── TwoPhotonSeriesFunctionalGreen/data   [t × rows × columns × planes]
//! │   ├── TwoPhotonSeriesFunctionalRed/data
//! │   ├── TwoPhotonSeriesAnatomicalGreen/data
//! │   ├── TwoPhotonSeriesAnatomicalRed/data
//! │   └── BehavioralVideo/timestamps            (external .avi)
//! └── processing/
//!     ├── behavior/FicTrac/<spatial series>/{data, timestamps}
//!     └── ophys/TwoPhotonSeriesFunctionalGreenProcessed/data   (optional)
//! ```
//!
//! # Library Usage
//!
//! - [`locator`] - Session file discovery
//! - [`bruker`] - PrairieView XML metadata
//! - [`nifti`] - NIfTI-1 headers and frames
//! - [`imaging`] - The four imaging streams
//! - [`fictrac`] - FicTrac logs
//! - [`alignment`] - Session timeline
//! - [`metadata`] - Metadata defaults and deep merge
//! - [`nwb`] - NWB-Zarr writing
//! - [`converter`] - The conversion driver
//! - [`cli`] - Command-line argument definitions
//!
//! # License
//!
//! This project is licensed under the GNU General Public License v3.0.
//! See LICENSE.md for details.

pub mod alignment;
pub mod bruker;
pub mod cli;
pub mod converter;
pub mod error;
pub mod fictrac;
pub mod imaging;
pub mod locator;
pub mod metadata;
pub mod nifti;
pub mod nwb;

use chrono::Datelike;

/// Display GPL license notice for a program
pub fn display_license_notice(program_name: &str) {
	let version = env!("CARGO_PKG_VERSION");
	let current_year = chrono::Utc::now().year();
	let copyright_year = if current_year == 2025 {
		"2025".to_string()
	} else {
		format!("2025-{}", current_year)
	};

	println!("{} {} Copyright (C) {} Raul C. Sîmpetru", program_name, version, copyright_year);
	println!("This program comes with ABSOLUTELY NO WARRANTY.");
	println!("For details see https://www.gnu.org/licenses/gpl-3.0.html#license-text.");
	println!("This is free software, and you are welcome to redistribute it under certain conditions.");
	println!();
}

/// Install the `tracing` subscriber used by the binaries (`RUST_LOG`, default `info`)
pub fn init_tracing() {
	let filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
	tracing_subscriber::fmt().with_env_filter(filter).init();
}
