//! Brezovec Convert - single-session conversion to NWB
//!
//! Finds the functional and anatomical Bruker scans, the FicTrac log and the
//! behaviour video of one session, aligns their clocks and writes one
//! `{session}_{subject}.nwb.zarr` container.
//!
//! # Usage
//!
//! ```bash
//! # Quick stub conversion (10 frames per imaging series, into conversion_nwb/nwb_stub/)
//! brezovec-convert --data-dir brezovec_example_data --session-id 20200620 --subject-id fly2 --stub-test
//!
//! # Full conversion with a custom metadata file and the motion-corrected volume
//! brezovec-convert -d brezovec_example_data --session-id 20200620 -s fly2 \
//!   --metadata my_metadata.yaml --processed moco/functional_channel_1_moc.nii
//!
//! # Replace an existing container
//! brezovec-convert -d brezovec_example_data --session-id 20200620 -s fly2 --overwrite
//! ```
//!
//! Set `RUST_LOG=debug` for detailed progress.

use anyhow::Result;
use clap::Parser;
use clandinin_nwb_toolbox::cli::Args;
use clandinin_nwb_toolbox::converter::session_to_nwb;

fn main() -> Result<()> {
    let args = Args::parse();

    if !args.options.quiet {
        clandinin_nwb_toolbox::display_license_notice("brezovec-convert");
        clandinin_nwb_toolbox::init_tracing();
    }

    let conversion = args.conversion()?;

    if !args.options.quiet {
        println!("Session:\t{}", conversion.session_id);
        println!("Subject:\t{}", conversion.subject_id);
        println!("Data:\t\t{}", conversion.data_dir.display());
        println!("Output:\t\t{}", conversion.output_path().display());
        if conversion.stub_test {
            println!("Stub mode:\t{} frames per imaging series", conversion.stub_frames);
        }
        println!();
    }

    let output = session_to_nwb(&conversion)?;

    println!("Conversion complete: {}", output.display());
    Ok(())
}
