use anyhow::Result;
use ndarray::{Array4, ArrayView4, Axis, Ix4};
use serde_json::{Map, Value, json};
use std::time::{Duration, Instant};
use zarrs::array::codec::BloscShuffleMode;
use zarrs::array::{Array, ArrayBuilder, DataType, FillValue};
use zarrs::filesystem::FilesystemStore;

use super::{NwbStore, blosc_codec};
use crate::fictrac::{FicTracLog, SPATIAL_SERIES, column_description};
use crate::metadata::{DeviceMetadata, ImagingPlaneMetadata, TwoPhotonSeriesMetadata};
use crate::nifti::{FrameData, NiftiVolume, VoxelType};

fn zarr_dtype(voxel_type: VoxelType) -> DataType {
    match voxel_type {
        VoxelType::UInt8 => DataType::UInt8,
        VoxelType::Int8 => DataType::Int8,
        VoxelType::Int16 => DataType::Int16,
        VoxelType::UInt16 => DataType::UInt16,
        VoxelType::Int32 => DataType::Int32,
        VoxelType::Float32 => DataType::Float32,
        VoxelType::Float64 => DataType::Float64,
    }
}

fn fill_value(voxel_type: VoxelType) -> FillValue {
    match voxel_type {
        VoxelType::UInt8 => FillValue::from(0u8),
        VoxelType::Int8 => FillValue::from(0i8),
        VoxelType::Int16 => FillValue::from(0i16),
        VoxelType::UInt16 => FillValue::from(0u16),
        VoxelType::Int32 => FillValue::from(0i32),
        VoxelType::Float32 => FillValue::from(0.0f32),
        VoxelType::Float64 => FillValue::from(0.0f64),
    }
}

fn shuffle_mode(voxel_type: VoxelType) -> BloscShuffleMode {
    match voxel_type {
        VoxelType::Float32 | VoxelType::Float64 => BloscShuffleMode::BitShuffle,
        _ => BloscShuffleMode::Shuffle,
    }
}

/// Appends `[1, rows, columns, planes]` frames to a `[t, rows, columns, planes]`
/// dataset, buffering a few frames per write
pub struct VolumeSeriesWriter {
    array: Array<FilesystemStore>,
    voxel_type: VoxelType,
    frame_shape: [u64; 3],
    pending: Vec<FrameData>,
    frames_per_flush: usize,
    frames_written: u64,
    slow_flush_warnings: u32,
}

impl VolumeSeriesWriter {
    pub fn create(
        nwb: &NwbStore,
        path: &str,
        voxel_type: VoxelType,
        (rows, columns, planes): (usize, usize, usize),
        frames_per_flush: usize,
    ) -> Result<Self> {
        let frame_shape = [rows as u64, columns as u64, planes as u64];
        // Start empty along time, one volume per chunk
        let array = ArrayBuilder::new(
            vec![0, frame_shape[0], frame_shape[1], frame_shape[2]],
            vec![1, frame_shape[0], frame_shape[1], frame_shape[2]],
            zarr_dtype(voxel_type),
            fill_value(voxel_type),
        )
        .dimension_names(Some(vec![
            Some("frames".to_string()),
            Some("rows".to_string()),
            Some("columns".to_string()),
            Some("planes".to_string()),
        ]))
        .bytes_to_bytes_codecs(vec![blosc_codec(shuffle_mode(voxel_type), voxel_type.size())?])
        .build(nwb.store().clone(), path)?;

        array.store_metadata()?;

        Ok(Self {
            array,
            voxel_type,
            frame_shape,
            pending: Vec::new(),
            frames_per_flush: frames_per_flush.max(1),
            frames_written: 0,
            slow_flush_warnings: 0,
        })
    }

    pub fn append(&mut self, frame: FrameData) -> Result<()> {
        let expected = [
            1,
            self.frame_shape[0] as usize,
            self.frame_shape[1] as usize,
            self.frame_shape[2] as usize,
        ];
        if frame.shape() != &expected[..] {
            anyhow::bail!("Frame shape {:?} does not match series shape {:?}", frame.shape(), expected);
        }

        // Buffer frames and flush in blocks
        self.pending.push(frame);
        if self.pending.len() >= self.frames_per_flush {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let flush_start = Instant::now();
        let num_frames = self.pending.len() as u64;
        let start = self.frames_written;
        let new_length = start + num_frames;

        // zarrs does not grow arrays on write
        self.array.set_shape(vec![
            new_length,
            self.frame_shape[0],
            self.frame_shape[1],
            self.frame_shape[2],
        ])?;

        let pending = std::mem::take(&mut self.pending);

        // Stack the pending frames along time and write them as one block

        macro_rules! write_frames {
            ($type:ty, $variant:ident) => {{
                let views = pending
                    .iter()
                    .map(|frame| match frame {
                        FrameData::$variant(data) => Ok(data.view()),
                        _ => Err(anyhow::anyhow!(
                            "Frame data type does not match series type {:?}",
                            self.voxel_type
                        )),
                    })
                    .collect::<Result<Vec<ArrayView4<$type>>>>()?;
                let block: Array4<$type> = ndarray::concatenate(Axis(0), &views)?;
                self.array
                    .store_array_subset_ndarray::<$type, Ix4>(&[start, 0, 0, 0], block)?;
            }};
        }

        match self.voxel_type {
            VoxelType::UInt8 => write_frames!(u8, UInt8),
            VoxelType::Int8 => write_frames!(i8, Int8),
            VoxelType::Int16 => write_frames!(i16, Int16),
            VoxelType::UInt16 => write_frames!(u16, UInt16),
            VoxelType::Int32 => write_frames!(i32, Int32),
            VoxelType::Float32 => write_frames!(f32, Float32),
            VoxelType::Float64 => write_frames!(f64, Float64),
        }

        // Persist the new shape
        self.array.store_metadata()?;
        self.frames_written = new_length;

        // Warn about slow writes, at most 5 times per series
        let flush_duration = flush_start.elapsed();
        if flush_duration > Duration::from_secs(2) {
            self.slow_flush_warnings += 1;
            if self.slow_flush_warnings <= 5 {
                tracing::warn!(
                    "Slow volume write: {:.1}s for {} frames (warning {}/5)",
                    flush_duration.as_secs_f64(),
                    num_frames,
                    self.slow_flush_warnings
                );
            }
        }
        tracing::debug!("Wrote frames {}..{} ({:.1}ms)", start, new_length, flush_duration.as_millis());

        Ok(())
    }

    /// Flush what is left and return the number of frames in the dataset
    pub fn finish(mut self) -> Result<u64> {
        self.flush()?;
        Ok(self.frames_written)
    }
}

fn string_attrs(value: &impl serde::Serialize) -> Result<Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map.into_iter().filter(|(_, v)| !v.is_null()).collect()),
        _ => anyhow::bail!("Expected an object"),
    }
}

/// Root attributes plus the subject group
pub fn write_file_metadata(
    nwb: &NwbStore,
    nwb_file: Map<String, Value>,
    subject: Map<String, Value>,
    provenance: Value,
) -> Result<()> {
    // Root attributes: NWBFile fields plus conversion provenance
    let mut root_attrs = nwb_file;
    root_attrs.insert("conversion".to_string(), provenance);
    nwb.update_attributes("/", root_attrs)?;

    nwb.create_group("/general/subject", Some("Subject"), subject)?;
    Ok(())
}

pub fn write_device(nwb: &NwbStore, device: &DeviceMetadata) -> Result<()> {
    let mut attrs = string_attrs(device)?;
    attrs.remove("name");
    nwb.create_group(&format!("/general/devices/{}", device.name), Some("Device"), attrs)
}

pub fn write_imaging_plane(nwb: &NwbStore, plane: &ImagingPlaneMetadata) -> Result<()> {
    let path = format!("/general/optophysiology/{}", plane.name);
    let mut attrs = string_attrs(plane)?;
    attrs.remove("name");
    attrs.remove("optical_channel");
    // Links are stored as paths
    attrs.insert("device".to_string(), json!(format!("/general/devices/{}", plane.device)));
    nwb.create_group(&path, Some("ImagingPlane"), attrs)?;

    // One child group per optical channel

    for channel in &plane.optical_channel {
        let mut channel_attrs = string_attrs(channel)?;
        channel_attrs.remove("name");
        nwb.create_group(&format!("{path}/{}", channel.name), Some("OpticalChannel"), channel_attrs)?;
    }
    Ok(())
}

/// Where a two-photon series lives: `acquisition` for raw data,
/// `processing/ophys` for derived data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesLocation {
    Acquisition,
    ProcessedOphys,
}

impl SeriesLocation {
    fn group_path(&self, name: &str) -> String {
        match self {
            SeriesLocation::Acquisition => format!("/acquisition/{name}"),
            SeriesLocation::ProcessedOphys => format!("/processing/ophys/{name}"),
        }
    }
}

/// Stream up to `max_frames` volumes from `volume` into a TwoPhotonSeries
/// with a regular timeline (`starting_time` + `rate`)
pub fn write_two_photon_series(
    nwb: &NwbStore,
    location: SeriesLocation,
    series: &TwoPhotonSeriesMetadata,
    volume: &mut NiftiVolume,
    starting_time: f64,
    max_frames: Option<usize>,
) -> Result<u64> {
    let rate = series
        .rate
        .ok_or_else(|| anyhow::anyhow!("{} has no rate", series.name))?;

    // Create the processing module on first use
    if location == SeriesLocation::ProcessedOphys && !nwb.has_group("/processing/ophys")? {
        nwb.create_group(
            "/processing/ophys",
            Some("ProcessingModule"),
            Map::from_iter([("description".to_string(), json!("Processed imaging data"))]),
        )?;
    }

    let group_path = location.group_path(&series.name);
    let mut attrs = string_attrs(series)?;
    attrs.remove("name");
    attrs.insert(
        "imaging_plane".to_string(),
        json!(format!("/general/optophysiology/{}", series.imaging_plane)),
    );
    // Regular timeline: starting time on the session clock plus a rate
    attrs.insert("starting_time".to_string(), json!(starting_time));
    attrs.insert("starting_time_unit".to_string(), json!("seconds"));
    attrs.insert("rate".to_string(), json!(rate));
    attrs.insert("source_file".to_string(), json!(volume.path().display().to_string()));
    nwb.create_group(&group_path, Some("TwoPhotonSeries"), attrs)?;

    // Stream frames; stub runs stop after `max_frames`
    let header = volume.header().clone();
    let total = header.num_frames();
    let frames = max_frames.map_or(total, |limit| limit.min(total));

    let mut writer = VolumeSeriesWriter::create(
        nwb,
        &format!("{group_path}/data"),
        header.voxel_type,
        header.frame_shape(),
        8,
    )?;
    for index in 0..frames {
        writer.append(volume.read_frame(index)?)?;
    }
    let written = writer.finish()?;

    tracing::info!("{}: {} of {} frames written", series.name, written, total);
    Ok(written)
}

/// One spatial series per column group under `processing/behavior/FicTrac`,
/// all sharing `timestamps`
pub fn write_fictrac(
    nwb: &NwbStore,
    log: &FicTracLog,
    timestamps: &[f64],
    description: &str,
) -> Result<()> {
    if timestamps.len() != log.num_rows() {
        anyhow::bail!(
            "{} timestamps for {} FicTrac rows",
            timestamps.len(),
            log.num_rows()
        );
    }

    // Create the behavior module if it doesn't exist
    if !nwb.has_group("/processing/behavior")? {
        nwb.create_group(
            "/processing/behavior",
            Some("ProcessingModule"),
            Map::from_iter([("description".to_string(), json!("Behavior data from FicTrac"))]),
        )?;
    }

    let mut position_attrs = Map::new();
    position_attrs.insert("description".to_string(), json!(description));
    position_attrs.insert("source_file".to_string(), json!(log.path.display().to_string()));
    if let Some(rate) = log.recorded_rate() {
        position_attrs.insert("recorded_rate".to_string(), json!(rate));
    }
    nwb.create_group("/processing/behavior/FicTrac", Some("Position"), position_attrs)?;

    for spec in &SPATIAL_SERIES {
        let path = format!("/processing/behavior/FicTrac/{}", spec.name);
        // Description is built from the per-column descriptions
        let descriptions: Vec<&str> = spec
            .columns
            .iter()
            .filter_map(|column| column_description(column))
            .collect();

        let mut attrs = Map::new();
        attrs.insert("reference_frame".to_string(), json!(spec.reference_frame.as_str()));
        attrs.insert("columns".to_string(), json!(spec.columns));
        attrs.insert("description".to_string(), json!(descriptions.join(" ")));
        attrs.insert("unit".to_string(), json!("radians"));
        nwb.create_group(&path, Some("SpatialSeries"), attrs)?;

        nwb.write_f64_2d(&format!("{path}/data"), log.spatial_series_data(spec)?)?;
        nwb.write_f64_1d(&format!("{path}/timestamps"), "samples", timestamps)?;
    }

    Ok(())
}

/// Video referenced by path, one timestamp per frame
pub fn write_external_video(
    nwb: &NwbStore,
    name: &str,
    video: &Value,
    external_file: &std::path::Path,
    timestamps: &[f64],
) -> Result<()> {
    let path = format!("/acquisition/{name}");
    // Scalar metadata fields, minus the name
    let mut attrs = Map::new();
    if let Value::Object(fields) = video {
        for (key, value) in fields {
            if key != "name" && !value.is_object() {
                attrs.insert(key.clone(), value.clone());
            }
        }
    }
    if let Some(device) = video.get("device").and_then(|v| v.as_str()) {
        attrs.insert("device".to_string(), json!(format!("/general/devices/{device}")));
    }
    // Frames stay in the video file
    attrs.insert("external_file".to_string(), json!([external_file.display().to_string()]));
    attrs.insert("starting_frame".to_string(), json!([0]));
    attrs.insert("format".to_string(), json!("external"));
    attrs.insert("unit".to_string(), json!("n.a."));
    nwb.create_group(&path, Some("ImageSeries"), attrs)?;

    nwb.write_f64_1d(&format!("{path}/timestamps"), "frames", timestamps)
}
