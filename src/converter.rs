//! Session conversion driver
//!
//! Discovery, instrument metadata, alignment, metadata merge and the
//! container write, in that order, for one `(subject, session)`.

use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};

use crate::alignment::{self, SessionStream, SessionTimeline};
use crate::bruker::{self, BrukerMetadata};
use crate::fictrac::FicTracLog;
use crate::imaging::{FUNCTIONAL_GREEN, IMAGING_STREAMS, ImagingStream, Purpose};
use crate::locator::{self, SessionLayout};
use crate::metadata::{self, MetadataContext, PROCESSED_SERIES_NAME};
use crate::nifti::NiftiVolume;
use crate::nwb::writer::{self, SeriesLocation};
use crate::nwb::{NwbStore, StagedOutput};

pub const DEFAULT_STUB_FRAMES: usize = 10;
pub const STUB_SUBDIRECTORY: &str = "nwb_stub";

/// Everything needed to convert one session
#[derive(Debug, Clone)]
pub struct SessionConversion {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub subject_id: String,
    pub session_id: String,
    pub stub_test: bool,
    pub stub_frames: usize,
    /// Defaults to `metadata/brezovec_metadata.yaml`
    pub metadata_override: Option<PathBuf>,
    /// Motion-corrected functional green volume
    pub processed_volume: Option<PathBuf>,
    pub overwrite: bool,
    pub timezone: Tz,
    /// Command line that requested the conversion, stored as provenance
    pub invocation: Option<Value>,
}

impl SessionConversion {
    pub fn new(data_dir: &Path, output_dir: &Path, subject_id: &str, session_id: &str) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            subject_id: subject_id.to_string(),
            session_id: session_id.to_string(),
            stub_test: false,
            stub_frames: DEFAULT_STUB_FRAMES,
            metadata_override: None,
            processed_volume: None,
            overwrite: false,
            timezone: alignment::DEFAULT_TIMEZONE,
            invocation: None,
        }
    }

    /// `{output}/{session}_{subject}.nwb.zarr`, under `nwb_stub/` in stub mode
    pub fn output_path(&self) -> PathBuf {
        let directory = if self.stub_test {
            self.output_dir.join(STUB_SUBDIRECTORY)
        } else {
            self.output_dir.clone()
        };
        directory.join(format!("{}_{}.nwb.zarr", self.session_id, self.subject_id))
    }

    pub fn max_frames(&self) -> Option<usize> {
        self.stub_test.then_some(self.stub_frames)
    }

    fn override_path(&self) -> PathBuf {
        self.metadata_override
            .clone()
            .unwrap_or_else(|| PathBuf::from(metadata::DEFAULT_OVERRIDE_FILE))
    }

    fn provenance(&self) -> Value {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        json!({
            "converter": env!("CARGO_PKG_NAME"),
            "converter_version": env!("CARGO_PKG_VERSION"),
            "converted_at": chrono::Utc::now().to_rfc3339(),
            "hostname": host,
            "data_dir": self.data_dir.display().to_string(),
            "stub_test": self.stub_test,
            "stub_frames": self.max_frames(),
            "timezone": self.timezone.name(),
            "invocation": self.invocation,
        })
    }
}

/// Raw inputs of one session, resolved and read
pub struct SessionSources {
    pub layout: SessionLayout,
    pub imaging: Vec<ImagingStream>,
    pub fictrac: FicTracLog,
    pub video: PathBuf,
    pub timeline: SessionTimeline,
}

impl SessionSources {
    pub fn imaging_stream(&self, stream: SessionStream) -> Option<&ImagingStream> {
        let spec = stream.imaging_spec()?;
        self.imaging.iter().find(|s| s.spec == spec)
    }
}

/// Locate and read every input of a session and put them on one timeline
pub fn discover_session(config: &SessionConversion) -> Result<SessionSources> {
    let layout = SessionLayout::new(&config.data_dir, &config.subject_id, &config.session_id);

    let mut folder_metadata: Vec<(Purpose, PathBuf, BrukerMetadata)> = Vec::new();
    for purpose in [Purpose::Functional, Purpose::Anatomical] {
        let folder = layout
            .imaging_folder(purpose)
            .with_context(|| format!("Locating the {} imaging folder", purpose.as_str().to_lowercase()))?;
        let xml_path = locator::bruker_xml_file(&folder)?;
        let metadata = bruker::read_bruker_metadata(&xml_path)
            .with_context(|| format!("Reading {}", xml_path.display()))?;
        tracing::info!(
            "{} folder {} started at {}",
            purpose.as_str(),
            folder.display(),
            metadata.start_time
        );
        folder_metadata.push((purpose, folder, metadata));
    }

    let mut imaging = Vec::with_capacity(IMAGING_STREAMS.len());
    for spec in IMAGING_STREAMS {
        let (_, folder, metadata) = folder_metadata
            .iter()
            .find(|(purpose, _, _)| *purpose == spec.purpose)
            .ok_or_else(|| anyhow::anyhow!("No folder for {}", spec.label()))?;
        let stream = ImagingStream::from_metadata(folder, spec, metadata.clone())
            .with_context(|| format!("Opening {}", spec.label()))?;
        imaging.push(stream);
    }

    let reference = imaging
        .iter()
        .find(|s| s.spec == FUNCTIONAL_GREEN)
        .ok_or_else(|| anyhow::anyhow!("Functional green stream missing"))?;
    let reference_epoch =
        alignment::epoch_seconds(&alignment::localize(reference.start_time(), config.timezone)?);

    let fictrac_path = layout.fictrac_log(reference_epoch, config.timezone)?;
    let video = layout.video_for_log(&fictrac_path)?;
    let fictrac = FicTracLog::read(&fictrac_path)?;

    if let Some(log_start) = locator::fictrac_log_timestamp(&fictrac_path, config.timezone) {
        tracing::info!(
            "FicTrac log named {:+.1} s from the functional start",
            alignment::epoch_seconds(&log_start) - reference_epoch
        );
    }
    if let Some(rate) = fictrac.recorded_rate() {
        tracing::info!(
            "FicTrac recorded rate {:.2} Hz, nominal {} Hz",
            rate,
            alignment::FICTRAC_NOMINAL_RATE_HZ
        );
    }

    let stream_refs: Vec<&ImagingStream> = imaging.iter().collect();
    let timeline = alignment::align_session(&stream_refs, fictrac.num_rows(), config.timezone)?;

    Ok(SessionSources {
        layout,
        imaging,
        fictrac,
        video,
        timeline,
    })
}

/// Default metadata, override merged on top, driver-owned fields last
pub fn session_metadata(config: &SessionConversion, sources: &SessionSources) -> Result<Value> {
    let streams: Vec<&ImagingStream> = sources.imaging.iter().collect();
    let mut merged = metadata::default_metadata(&MetadataContext {
        subject_id: &config.subject_id,
        session_id: &config.session_id,
        streams: &streams,
        include_processed: config.processed_volume.is_some(),
    });

    let override_path = config.override_path();
    let overrides = metadata::load_override(&override_path)
        .with_context(|| format!("Loading metadata override {}", override_path.display()))?;
    metadata::deep_merge(&mut merged, overrides);
    metadata::finalize(&mut merged, &sources.timeline.session_start, &config.subject_id);

    if config.processed_volume.is_some() {
        copy_functional_rate_to_processed(&mut merged)?;
    }

    Ok(merged)
}

fn copy_functional_rate_to_processed(merged: &mut Value) -> Result<()> {
    let functional = metadata::two_photon_series_named(merged, &FUNCTIONAL_GREEN.series_name())?;
    let rate = functional
        .rate
        .ok_or_else(|| anyhow::anyhow!("{} has no rate", functional.name))?;

    if let Some(Value::Array(series)) = merged.pointer_mut("/Ophys/TwoPhotonSeries") {
        for entry in series.iter_mut() {
            if entry.get("name").and_then(|n| n.as_str()) == Some(PROCESSED_SERIES_NAME) {
                entry["rate"] = json!(rate);
            }
        }
    }
    Ok(())
}

/// Convert one session. The container appears at
/// [`SessionConversion::output_path`] only if every step succeeds.
pub fn session_to_nwb(config: &SessionConversion) -> Result<PathBuf> {
    tracing::info!(
        "Converting session {} subject {}{}",
        config.session_id,
        config.subject_id,
        if config.stub_test { " (stub)" } else { "" }
    );

    let sources = discover_session(config)?;
    let merged = session_metadata(config, &sources)?;

    let staged = StagedOutput::begin(&config.output_path(), config.overwrite)?;
    let nwb = NwbStore::create(staged.staging_path())?;
    write_session(&nwb, config, &sources, &merged)?;
    let output = staged.commit()?;

    tracing::info!("Wrote {}", output.display());
    Ok(output)
}

fn write_session(
    nwb: &NwbStore,
    config: &SessionConversion,
    sources: &SessionSources,
    merged: &Value,
) -> Result<()> {
    writer::write_file_metadata(
        nwb,
        metadata::attribute_fields(merged, "NWBFile"),
        metadata::attribute_fields(merged, "Subject"),
        config.provenance(),
    )?;

    for device in metadata::devices(merged)? {
        writer::write_device(nwb, &device)?;
    }
    for plane in metadata::imaging_planes(merged)? {
        writer::write_imaging_plane(nwb, &plane)?;
    }

    for stream in &sources.imaging {
        let series = metadata::two_photon_series_at(merged, stream.spec.photon_series_index)?;
        let starting_time = sources
            .timeline
            .offset(SessionStream::from_imaging_spec(&stream.spec));
        let mut volume = NiftiVolume::open(&stream.volume_path)?;
        writer::write_two_photon_series(
            nwb,
            SeriesLocation::Acquisition,
            &series,
            &mut volume,
            starting_time,
            config.max_frames(),
        )
        .with_context(|| format!("Writing {}", series.name))?;
    }

    if let Some(processed_path) = &config.processed_volume {
        let series = metadata::two_photon_series_named(merged, PROCESSED_SERIES_NAME)?;
        let mut volume = NiftiVolume::open(processed_path)?;
        writer::write_two_photon_series(
            nwb,
            SeriesLocation::ProcessedOphys,
            &series,
            &mut volume,
            sources.timeline.offset(SessionStream::FunctionalGreen),
            config.max_frames(),
        )
        .with_context(|| format!("Writing {}", series.name))?;
    }

    let behavior = merged.get("Behavior").cloned().unwrap_or_else(|| json!({}));
    let fictrac_description = behavior
        .pointer("/FicTrac/description")
        .and_then(|v| v.as_str())
        .unwrap_or("Fictrac data");
    writer::write_fictrac(
        nwb,
        &sources.fictrac,
        &sources.timeline.behavior_timestamps,
        fictrac_description,
    )?;

    let video = behavior.get("Video").cloned().unwrap_or_else(|| json!({}));
    let video_name = video
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("BehavioralVideo");
    writer::write_external_video(
        nwb,
        video_name,
        &video,
        &sources.video,
        &sources.timeline.behavior_timestamps,
    )?;

    Ok(())
}

/// Every `(session_id, subject_id)` under `imports/` with a functional
/// `TSeries-*` folder and its XML sidecar
pub fn discover_sessions(data_dir: &Path) -> Result<Vec<(String, String)>> {
    let imports = data_dir.join(locator::IMPORTS_DIR);
    let mut sessions = Vec::new();

    for session in sorted_subdirectories(&imports)? {
        for subject in sorted_subdirectories(&session)? {
            let layout = SessionLayout::new(data_dir, &dir_name(&subject), &dir_name(&session));
            match layout
                .imaging_folder(Purpose::Functional)
                .and_then(|folder| locator::bruker_xml_file(&folder))
            {
                Ok(_) => sessions.push((layout.session_id, layout.subject_id)),
                Err(e) => tracing::debug!("Skipping {}: {}", subject.display(), e),
            }
        }
    }

    Ok(sessions)
}

fn sorted_subdirectories(directory: &Path) -> Result<Vec<PathBuf>> {
    let mut directories = Vec::new();
    for entry in std::fs::read_dir(directory)
        .with_context(|| format!("Listing {}", directory.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            directories.push(entry.path());
        }
    }
    directories.sort();
    Ok(directories)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}
