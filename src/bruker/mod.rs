//! Bruker PrairieView metadata
//!
//! Every imaging folder (`TSeries-*`) carries an XML sidecar named after the
//! folder. The document is read with a forward-only streaming parser; the
//! session start time is found with an early exit, the rest needs one full
//! pass that only keeps frame times, the first frame's channel records and
//! the flattened `PVStateValue` configuration in memory.

pub mod xml;

use chrono::NaiveDateTime;
use serde_json::{Map, Value};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use crate::error::{ConversionError, Result};
use xml::{FirstFrameChannels, FrameTimes, SessionStartCollector, StateValueCollector};

/// Instrument configuration flattened from the `PVStateValue` records
#[derive(Debug, Clone, Default)]
pub struct StateValues(Map<String, Value>);

impl StateValues {
    pub fn new(values: Map<String, Value>) -> Self {
        Self(values)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get_str(key).and_then(|v| v.trim().parse().ok())
    }

    /// Value of a nested entry, e.g. `micronsPerPixel/XAxis`
    pub fn get_indexed_f64(&self, key: &str, sub_key: &str) -> Option<f64> {
        self.0
            .get(key)
            .and_then(|v| v.get(sub_key))
            .and_then(|v| v.as_str())
            .and_then(|v| v.trim().parse().ok())
    }

    /// First parseable nested value of `key`
    pub fn first_indexed_f64(&self, key: &str) -> Option<f64> {
        self.0
            .get(key)
            .and_then(|v| v.as_object())
            .and_then(|entries| {
                entries
                    .values()
                    .filter_map(|v| v.as_str())
                    .find_map(|v| v.trim().parse().ok())
            })
    }

    /// `zDevice` is 1 for volumetric acquisitions, 0 for single planes
    pub fn is_volumetric(&self) -> Option<bool> {
        self.get_str("zDevice")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map(|v| v != 0)
    }

    /// Pixel size in micrometres along x, y and z, if the configuration has it
    pub fn microns_per_pixel(&self) -> Option<[f64; 3]> {
        Some([
            self.get_indexed_f64("micronsPerPixel", "XAxis")?,
            self.get_indexed_f64("micronsPerPixel", "YAxis")?,
            self.get_indexed_f64("micronsPerPixel", "ZAxis")?,
        ])
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

/// Everything the conversion needs from one PrairieView XML document
#[derive(Debug, Clone)]
pub struct BrukerMetadata {
    pub xml_path: PathBuf,
    pub start_time: NaiveDateTime,
    /// `(channel id, channel name)` from the first frame
    pub channels: Vec<(String, String)>,
    /// One absolute time per frame (i.e. per plane for volumetric scans)
    pub frame_times: Vec<f64>,
    pub state: StateValues,
}

impl BrukerMetadata {
    /// Channel id for a channel name such as `Green` or `Red`
    pub fn channel_id(&self, channel_name: &str) -> Result<&str> {
        self.channels
            .iter()
            .find(|(_, name)| name == channel_name)
            .map(|(id, _)| id.as_str())
            .ok_or_else(|| ConversionError::UnknownChannel {
                requested: channel_name.to_string(),
                available: self.channels.iter().map(|(_, name)| name.clone()).collect(),
            })
    }
}

/// Date of the session (`PVScan/@date`) combined with the time of day of
/// the first sequence (`Sequence/@time`). Stops reading once both are known.
pub fn read_session_start_time(xml_path: &Path) -> Result<NaiveDateTime> {
    let mut collector = SessionStartCollector::default();
    xml::stream_elements(xml_path, |node| collector.visit(&node))?;
    collector.finish(xml_path)
}

/// Channel records of the first `Frame` block only
pub fn read_channels_from_first_frame(xml_path: &Path) -> Result<Vec<(String, String)>> {
    let mut collector = FirstFrameChannels::default();
    xml::stream_elements(xml_path, |node| collector.visit(&node))?;
    Ok(collector.channels)
}

/// All `Frame/@absoluteTime` values in document order
pub fn read_frame_times(xml_path: &Path) -> Result<Vec<f64>> {
    let mut collector = FrameTimes::default();
    xml::stream_elements(xml_path, |node| collector.visit(&node))?;
    Ok(collector.times)
}

pub fn read_state_values(xml_path: &Path) -> Result<StateValues> {
    let mut collector = StateValueCollector::default();
    xml::stream_elements(xml_path, |node| collector.visit(&node))?;
    Ok(StateValues::new(collector.values))
}

/// Read the whole sidecar: one early-exit pass for the start time, one full
/// pass for frames, channels and configuration.
pub fn read_bruker_metadata(xml_path: &Path) -> Result<BrukerMetadata> {
    let start_time = read_session_start_time(xml_path)?;

    let mut channels = FirstFrameChannels::default();
    let mut frames = FrameTimes::default();
    let mut state = StateValueCollector::default();
    xml::stream_elements(xml_path, |node| {
        let channel_flow = channels.visit(&node)?;
        let frame_flow = frames.visit(&node)?;
        let state_flow = state.visit(&node)?;
        // Stop only once every collector is done
        if channel_flow.is_break() && frame_flow.is_break() && state_flow.is_break() {
            Ok(ControlFlow::Break(()))
        } else {
            Ok(ControlFlow::Continue(()))
        }
    })?;

    tracing::debug!(
        "Read {} frame times and {} state values from {}",
        frames.times.len(),
        state.values.len(),
        xml_path.display()
    );

    Ok(BrukerMetadata {
        xml_path: xml_path.to_path_buf(),
        start_time,
        channels: channels.channels,
        frame_times: frames.times,
        state: StateValues::new(state.values),
    })
}

/// Rate of a regularly sampled series: reciprocal of the mean difference
/// between consecutive timestamps.
pub fn regular_series_rate(timestamps: &[f64]) -> Result<f64> {
    if timestamps.len() < 2 {
        return Err(ConversionError::SamplingRate(format!(
            "need at least two timestamps, got {}",
            timestamps.len()
        )));
    }

    let total: f64 = timestamps.windows(2).map(|w| w[1] - w[0]).sum();
    let mean_interval = total / (timestamps.len() - 1) as f64;
    let rate = 1.0 / mean_interval;

    if !rate.is_finite() || rate <= 0.0 {
        return Err(ConversionError::SamplingRate(format!(
            "mean interval {mean_interval} s gives rate {rate}"
        )));
    }

    Ok(rate)
}

/// One timestamp per volume: the time of each volume's first plane
pub fn volume_timestamps(frame_times: &[f64], planes_per_volume: usize) -> Vec<f64> {
    frame_times
        .iter()
        .step_by(planes_per_volume.max(1))
        .copied()
        .collect()
}

/// Rate at which the planes of volume `cycle` (1-based) were acquired
pub fn plane_acquisition_rate(
    frame_times: &[f64],
    planes_per_volume: usize,
    cycle: usize,
) -> Result<f64> {
    if cycle == 0 {
        return Err(ConversionError::SamplingRate("cycles are numbered from 1".to_string()));
    }
    let start = planes_per_volume * (cycle - 1);
    let end = (planes_per_volume * cycle).min(frame_times.len());
    if start >= end {
        return Err(ConversionError::SamplingRate(format!(
            "cycle {cycle} is beyond the {} recorded frames",
            frame_times.len()
        )));
    }
    regular_series_rate(&frame_times[start..end])
}
