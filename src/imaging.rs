use chrono::NaiveDateTime;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::bruker::{self, BrukerMetadata};
use crate::error::Result;
use crate::locator;
use crate::nifti::NiftiHeader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Purpose {
    Functional,
    Anatomical,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Functional => "Functional",
            Purpose::Anatomical => "Anatomical",
        }
    }

    /// Substring that identifies the purpose's folder under the subject directory
    pub fn folder_marker(&self) -> &'static str {
        match self {
            Purpose::Functional => "func",
            Purpose::Anatomical => "anat",
        }
    }
}

/// The channel × purpose combinations differ only in this data
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImagingStreamSpec {
    pub purpose: Purpose,
    /// `channelName` in the PrairieView `File` records
    pub channel_name: &'static str,
    pub emission_lambda_nm: f64,
    pub indicator: &'static str,
    /// Position of the series' entry in `Ophys.TwoPhotonSeries`
    pub photon_series_index: usize,
}

impl ImagingStreamSpec {
    /// e.g. `FunctionalGreen`
    pub fn label(&self) -> String {
        format!("{}{}", self.purpose.as_str(), self.channel_name)
    }

    pub fn series_name(&self) -> String {
        format!("TwoPhotonSeries{}", self.label())
    }

    pub fn imaging_plane_name(&self) -> String {
        format!("ImagingPlane{}", self.label())
    }

    pub fn optical_channel_name(&self) -> String {
        format!("OpticalChannel{}", self.channel_name)
    }
}

pub const FUNCTIONAL_GREEN: ImagingStreamSpec = ImagingStreamSpec {
    purpose: Purpose::Functional,
    channel_name: "Green",
    emission_lambda_nm: 513.0,
    indicator: "GCaMP6f",
    photon_series_index: 0,
};

pub const FUNCTIONAL_RED: ImagingStreamSpec = ImagingStreamSpec {
    purpose: Purpose::Functional,
    channel_name: "Red",
    emission_lambda_nm: 581.0,
    indicator: "tdTomato",
    photon_series_index: 1,
};

pub const ANATOMICAL_GREEN: ImagingStreamSpec = ImagingStreamSpec {
    purpose: Purpose::Anatomical,
    channel_name: "Green",
    emission_lambda_nm: 513.0,
    indicator: "GCaMP6f",
    photon_series_index: 2,
};

pub const ANATOMICAL_RED: ImagingStreamSpec = ImagingStreamSpec {
    purpose: Purpose::Anatomical,
    channel_name: "Red",
    emission_lambda_nm: 581.0,
    indicator: "tdTomato",
    photon_series_index: 3,
};

pub const IMAGING_STREAMS: [ImagingStreamSpec; 4] =
    [FUNCTIONAL_GREEN, FUNCTIONAL_RED, ANATOMICAL_GREEN, ANATOMICAL_RED];

/// One channel of one `TSeries-*` folder: its sidecar metadata, the NIfTI
/// volume holding the channel and the derived per-volume timeline
#[derive(Debug, Clone)]
pub struct ImagingStream {
    pub spec: ImagingStreamSpec,
    pub folder: PathBuf,
    pub volume_path: PathBuf,
    pub channel_id: String,
    pub header: NiftiHeader,
    pub metadata: BrukerMetadata,
    /// One absolute time per volume, seconds since acquisition start
    pub timestamps: Vec<f64>,
    pub sampling_frequency: f64,
}

impl ImagingStream {
    pub fn open(folder: &Path, spec: ImagingStreamSpec) -> Result<Self> {
        let xml_path = locator::bruker_xml_file(folder)?;
        let metadata = bruker::read_bruker_metadata(&xml_path)?;
        Self::from_metadata(folder, spec, metadata)
    }

    /// Build a stream from already parsed sidecar metadata, so both channels
    /// of a folder share one XML read
    pub fn from_metadata(
        folder: &Path,
        spec: ImagingStreamSpec,
        metadata: BrukerMetadata,
    ) -> Result<Self> {
        if metadata.state.is_volumetric() == Some(false) {
            tracing::warn!(
                "{} is not a volumetric acquisition (zDevice = 0), treating every frame as one plane",
                folder.display()
            );
        }

        let channel_id = metadata.channel_id(spec.channel_name)?.to_string();
        let volume_path = locator::channel_volume_file(folder, &channel_id)?;
        let header = NiftiHeader::read(&volume_path)?;

        let (_, _, planes) = header.frame_shape();
        let timestamps = bruker::volume_timestamps(&metadata.frame_times, planes);
        let sampling_frequency = bruker::regular_series_rate(&timestamps)?;

        if timestamps.len() != header.num_frames() {
            tracing::warn!(
                "{}: XML lists {} volumes, NIfTI holds {}",
                spec.label(),
                timestamps.len(),
                header.num_frames()
            );
        }

        tracing::info!(
            "{}: {} frames of {:?} at {:.4} Hz from {}",
            spec.label(),
            header.num_frames(),
            header.frame_shape(),
            sampling_frequency,
            volume_path.display()
        );

        Ok(Self {
            spec,
            folder: folder.to_path_buf(),
            volume_path,
            channel_id,
            header,
            metadata,
            timestamps,
            sampling_frequency,
        })
    }

    pub fn label(&self) -> String {
        self.spec.label()
    }

    pub fn start_time(&self) -> NaiveDateTime {
        self.metadata.start_time
    }

    pub fn num_frames(&self) -> usize {
        self.header.num_frames()
    }

    pub fn planes_per_volume(&self) -> usize {
        self.header.frame_shape().2
    }

    /// Rate at which the planes of the first volume were acquired
    pub fn plane_acquisition_rate(&self) -> Option<f64> {
        bruker::plane_acquisition_rate(&self.metadata.frame_times, self.planes_per_volume(), 1).ok()
    }
}

impl fmt::Display for ImagingStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (channel {}, {} frames, {:.3} Hz)",
            self.label(),
            self.channel_id,
            self.num_frames(),
            self.sampling_frequency
        )
    }
}
