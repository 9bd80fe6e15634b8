use clap::{Args as ClapArgs, Parser};
use chrono_tz::Tz;
use serde_json::json;
use std::path::PathBuf;

use crate::converter::{DEFAULT_STUB_FRAMES, SessionConversion};

/// Options shared by the single-session and batch converters
#[derive(ClapArgs, Clone, Debug)]
pub struct ConversionOptions {
    #[arg(
        long,
        short = 'd',
        help = "Root data directory (holds fictrac/ and imports/)"
    )]
    pub data_dir: PathBuf,

    #[arg(
        long,
        short = 'o',
        help = "Directory the .nwb.zarr containers are written to",
        default_value = "conversion_nwb"
    )]
    pub output_dir: PathBuf,

    #[arg(
        long,
        help = "Stub mode: write only the first --stub-frames frames of each imaging series into <output>/nwb_stub"
    )]
    pub stub_test: bool,

    #[arg(long, default_value_t = DEFAULT_STUB_FRAMES, help = "Frames per imaging series in stub mode")]
    pub stub_frames: usize,

    #[arg(
        long,
        short = 'm',
        help = "YAML or JSON metadata deep-merged over the defaults (default: metadata/brezovec_metadata.yaml)"
    )]
    pub metadata: Option<PathBuf>,

    #[arg(long, help = "Replace an existing container")]
    pub overwrite: bool,

    #[arg(
        long,
        default_value = "America/Los_Angeles",
        help = "IANA time zone of the acquisition clocks"
    )]
    pub timezone: Tz,

    #[arg(long, short = 'q', help = "Minimal output mode")]
    pub quiet: bool,
}

impl ConversionOptions {
    pub fn session(&self, subject_id: &str, session_id: &str) -> SessionConversion {
        let mut conversion = SessionConversion::new(&self.data_dir, &self.output_dir, subject_id, session_id);
        conversion.stub_test = self.stub_test;
        conversion.stub_frames = self.stub_frames;
        conversion.metadata_override = self.metadata.clone();
        conversion.overwrite = self.overwrite;
        conversion.timezone = self.timezone;
        conversion
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "data_dir": self.data_dir.display().to_string(),
            "output_dir": self.output_dir.display().to_string(),
            "stub_test": self.stub_test,
            "stub_frames": self.stub_frames,
            "metadata": self.metadata.as_ref().map(|p| p.display().to_string()),
            "overwrite": self.overwrite,
            "timezone": self.timezone.name(),
            "quiet": self.quiet,
        })
    }
}

#[derive(Parser, Clone, Debug)]
#[command(name = "brezovec-convert")]
#[command(about = "Convert one Brezovec imaging + FicTrac session to NWB (Zarr backend)")]
#[command(version)]
pub struct Args {
    #[arg(long, short = 's', help = "Subject identifier, e.g. fly2")]
    pub subject_id: String,

    #[arg(long, help = "Session identifier or YYYYMMDD date, e.g. 20200620")]
    pub session_id: String,

    #[arg(long, help = "Motion-corrected functional green volume (.nii)")]
    pub processed: Option<PathBuf>,

    #[command(flatten)]
    pub options: ConversionOptions,
}

impl Args {
    /// The conversion described by the parsed arguments
    pub fn conversion(&self) -> anyhow::Result<SessionConversion> {
        let mut conversion = self.options.session(&self.subject_id, &self.session_id);
        conversion.processed_volume = self.processed.clone();
        conversion.invocation = Some(serde_json::from_str(&self.to_conversion_config_json()?)?);
        Ok(conversion)
    }

    /// Serialize the conversion configuration to a JSON string
    pub fn to_conversion_config_json(&self) -> anyhow::Result<String> {
        let mut config_json = self.options.to_json();
        config_json["subject_id"] = json!(self.subject_id);
        config_json["session_id"] = json!(self.session_id);
        config_json["processed"] = json!(self.processed.as_ref().map(|p| p.display().to_string()));
        config_json["tool"] = json!("brezovec-convert");
        config_json["converter_version"] = json!(env!("CARGO_PKG_VERSION"));

        Ok(serde_json::to_string_pretty(&config_json)?)
    }
}

#[derive(Parser, Clone, Debug)]
#[command(name = "brezovec-convert-all")]
#[command(about = "Convert every session found under <data-dir>/imports")]
#[command(version)]
pub struct BatchArgs {
    #[arg(long, help = "Only convert these sessions (can be specified multiple times)")]
    pub session: Vec<String>,

    #[arg(long, help = "Only convert these subjects (can be specified multiple times)")]
    pub subject: Vec<String>,

    #[arg(long, help = "List the sessions that would be converted and exit")]
    pub dry_run: bool,

    #[command(flatten)]
    pub options: ConversionOptions,
}

impl BatchArgs {
    pub fn selects(&self, session_id: &str, subject_id: &str) -> bool {
        (self.session.is_empty() || self.session.iter().any(|s| s == session_id))
            && (self.subject.is_empty() || self.subject.iter().any(|s| s == subject_id))
    }

    pub fn conversion(&self, subject_id: &str, session_id: &str) -> SessionConversion {
        let mut conversion = self.options.session(subject_id, session_id);
        let mut invocation = self.options.to_json();
        invocation["tool"] = json!("brezovec-convert-all");
        invocation["subject_id"] = json!(subject_id);
        invocation["session_id"] = json!(session_id);
        conversion.invocation = Some(invocation);
        conversion
    }
}
