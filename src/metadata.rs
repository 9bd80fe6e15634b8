//! Session metadata
//!
//! Defaults are derived from the instrument metadata as a nested JSON
//! document, then a user override document is deep-merged on top. The
//! writer reads the merged document back through the typed views below.

use chrono::DateTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::path::Path;

use crate::error::{ConversionError, Result};
use crate::fictrac::SPATIAL_SERIES;
use crate::imaging::{FUNCTIONAL_GREEN, ImagingStream};

pub const DEFAULT_OVERRIDE_FILE: &str = "metadata/brezovec_metadata.yaml";
pub const MICROSCOPE_NAME: &str = "BrukerUltima";
pub const CAMERA_NAME: &str = "Flea FL3-U3-13E4M-C";
pub const PROCESSED_SERIES_NAME: &str = "TwoPhotonSeriesFunctionalGreenProcessed";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpticalChannelMetadata {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub emission_lambda: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagingPlaneMetadata {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub device: String,
    #[serde(default)]
    pub excitation_lambda: Option<f64>,
    #[serde(default)]
    pub indicator: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub imaging_rate: Option<f64>,
    #[serde(default)]
    pub optical_channel: Vec<OpticalChannelMetadata>,
    #[serde(default)]
    pub grid_spacing: Option<Vec<f64>>,
    #[serde(default)]
    pub grid_spacing_unit: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwoPhotonSeriesMetadata {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub imaging_plane: String,
    #[serde(default = "default_unit")]
    pub unit: String,
    #[serde(default)]
    pub rate: Option<f64>,
    #[serde(default)]
    pub dimension: Option<Vec<u64>>,
    #[serde(default)]
    pub field_of_view: Option<Vec<f64>>,
    #[serde(default)]
    pub scan_line_rate: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_unit() -> String {
    "n.a.".to_string()
}

/// Inputs of the default metadata document
pub struct MetadataContext<'a> {
    pub subject_id: &'a str,
    pub session_id: &'a str,
    /// Ordered by `photon_series_index`
    pub streams: &'a [&'a ImagingStream],
    pub include_processed: bool,
}

pub fn default_metadata(context: &MetadataContext<'_>) -> Value {
    let version = context
        .streams
        .first()
        .and_then(|s| s.metadata.state.get_str("version"))
        .unwrap_or("unknown");

    let mut imaging_planes = Vec::new();
    let mut series = Vec::new();
    for stream in context.streams {
        imaging_planes.push(imaging_plane_metadata(stream));
        series.push(two_photon_series_metadata(stream));
    }

    if context.include_processed
        && let Some(functional_green) = context.streams.iter().find(|s| s.spec == FUNCTIONAL_GREEN)
    {
        series.push(json!({
            "name": PROCESSED_SERIES_NAME,
            "description": "Motion-corrected functional imaging of the green channel.",
            "imaging_plane": FUNCTIONAL_GREEN.imaging_plane_name(),
            "unit": "n.a.",
            "rate": functional_green.sampling_frequency,
        }));
    }

    let fictrac_series: Map<String, Value> = SPATIAL_SERIES
        .iter()
        .map(|spec| {
            (
                spec.name.to_string(),
                json!({
                    "reference_frame": spec.reference_frame.as_str(),
                    "columns": spec.columns,
                }),
            )
        })
        .collect();

    json!({
        "NWBFile": {
            "session_description": "Two-photon imaging of the whole central brain during spherical treadmill walking.",
            "identifier": uuid::Uuid::new_v4().to_string(),
            "session_id": context.session_id,
            "lab": "Clandinin",
            "institution": "Stanford University",
            "experiment_description": "Functional and anatomical two-photon volumes of a tethered fly with FicTrac behavioural tracking.",
        },
        "Subject": {
            "subject_id": context.subject_id,
            "species": "Drosophila melanogaster",
        },
        "Ophys": {
            "Device": [{
                "name": MICROSCOPE_NAME,
                "description": format!("Bruker Ultima two-photon microscope controlled by PrairieView {version}."),
                "manufacturer": "Bruker",
            }],
            "ImagingPlane": imaging_planes,
            "TwoPhotonSeries": series,
        },
        "Behavior": {
            "FicTrac": {
                "description": "Fictrac data",
                "rate": crate::alignment::FICTRAC_NOMINAL_RATE_HZ,
                "SpatialSeries": fictrac_series,
            },
            "Video": {
                "name": "BehavioralVideo",
                "description": "Video of the fly on the spherical treadmill tracked by FicTrac.",
                "device": CAMERA_NAME,
            },
            "Device": [{
                "name": CAMERA_NAME,
                "description": "Sensor used for imaging with FicTrac at 50 Hz with Edmund Optics 100 mm C Series Fixed Focal Length Lens",
                "manufacturer": "Teledyne FLIR Systems, Inc.",
            }],
        },
    })
}

fn imaging_plane_metadata(stream: &ImagingStream) -> Value {
    let spec = &stream.spec;
    let mut plane = json!({
        "name": spec.imaging_plane_name(),
        "description": format!("{} imaging plane, {} channel.", spec.purpose.as_str(), spec.channel_name),
        "device": MICROSCOPE_NAME,
        "indicator": spec.indicator,
        "location": "whole central brain",
        "imaging_rate": stream.sampling_frequency,
        "optical_channel": [{
            "name": spec.optical_channel_name(),
            "description": format!("{} channel of the PMT.", spec.channel_name),
            "emission_lambda": spec.emission_lambda_nm,
        }],
    });

    let state = &stream.metadata.state;
    if let Some(wavelength) = state.first_indexed_f64("laserWavelength").or_else(|| state.get_f64("laserWavelength")) {
        plane["excitation_lambda"] = json!(wavelength);
    }
    if let Some(spacing) = state.microns_per_pixel() {
        plane["grid_spacing"] = json!(spacing);
        plane["grid_spacing_unit"] = json!("micrometers");
    }
    plane
}

fn two_photon_series_metadata(stream: &ImagingStream) -> Value {
    let spec = &stream.spec;
    let (rows, columns, planes) = stream.header.frame_shape();
    let mut series = json!({
        "name": spec.series_name(),
        "description": format!("{} imaging data acquired from the {} channel.", spec.purpose.as_str(), spec.channel_name),
        "imaging_plane": spec.imaging_plane_name(),
        "unit": "n.a.",
        "rate": stream.sampling_frequency,
        "dimension": [rows, columns, planes],
    });

    let state = &stream.metadata.state;
    if let Some([x, y, z]) = state.microns_per_pixel() {
        // meters, (width, height, depth)
        series["field_of_view"] = json!([
            x * columns as f64 * 1e-6,
            y * rows as f64 * 1e-6,
            z * planes as f64 * 1e-6,
        ]);
    }
    if let Some(period) = state.get_f64("scanLinePeriod").filter(|p| *p > 0.0) {
        series["scan_line_rate"] = json!(1.0 / period);
    }
    series
}

/// Recursively merge `overlay` into `base`. Objects merge key by key with
/// `overlay` winning; any other value (lists included) replaces wholesale.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Load an override document. A missing file means no overrides.
pub fn load_override(path: &Path) -> Result<Value> {
    if !path.exists() {
        tracing::info!("No metadata override at {}", path.display());
        return Ok(Value::Object(Map::new()));
    }

    let contents = std::fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let value: Value = if is_json {
        serde_json::from_str(&contents)?
    } else {
        serde_yaml::from_str(&contents)?
    };

    match value {
        Value::Object(_) => Ok(value),
        Value::Null => Ok(Value::Object(Map::new())),
        _ => Err(ConversionError::Metadata(format!(
            "{} must contain a mapping at the top level",
            path.display()
        ))),
    }
}

/// Fields the driver always owns, set after the override is merged
pub fn finalize(metadata: &mut Value, session_start: &DateTime<Tz>, subject_id: &str) {
    deep_merge(
        metadata,
        json!({
            "NWBFile": { "session_start_time": session_start.to_rfc3339() },
            "Subject": { "subject_id": subject_id },
        }),
    );
}

fn section<'a>(metadata: &'a Value, path: &[&str]) -> Result<&'a Value> {
    path.iter().try_fold(metadata, |value, key| {
        value
            .get(key)
            .ok_or_else(|| ConversionError::Metadata(format!("missing '{}'", path.join("."))))
    })
}

fn typed_list<T: for<'de> Deserialize<'de>>(metadata: &Value, path: &[&str]) -> Result<Vec<T>> {
    match section(metadata, path) {
        Ok(value) => Ok(serde_json::from_value(value.clone())?),
        Err(_) => Ok(Vec::new()),
    }
}

pub fn devices(metadata: &Value) -> Result<Vec<DeviceMetadata>> {
    let mut all: Vec<DeviceMetadata> = typed_list(metadata, &["Ophys", "Device"])?;
    all.extend(typed_list::<DeviceMetadata>(metadata, &["Behavior", "Device"])?);
    Ok(all)
}

pub fn imaging_planes(metadata: &Value) -> Result<Vec<ImagingPlaneMetadata>> {
    typed_list(metadata, &["Ophys", "ImagingPlane"])
}

pub fn two_photon_series(metadata: &Value) -> Result<Vec<TwoPhotonSeriesMetadata>> {
    typed_list(metadata, &["Ophys", "TwoPhotonSeries"])
}

/// Entry `photon_series_index` of `Ophys.TwoPhotonSeries`
pub fn two_photon_series_at(metadata: &Value, photon_series_index: usize) -> Result<TwoPhotonSeriesMetadata> {
    two_photon_series(metadata)?
        .into_iter()
        .nth(photon_series_index)
        .ok_or_else(|| {
            ConversionError::Metadata(format!("no TwoPhotonSeries entry at index {photon_series_index}"))
        })
}

pub fn two_photon_series_named(metadata: &Value, name: &str) -> Result<TwoPhotonSeriesMetadata> {
    two_photon_series(metadata)?
        .into_iter()
        .find(|s| s.name == name)
        .ok_or_else(|| ConversionError::Metadata(format!("no TwoPhotonSeries named {name}")))
}

/// Fields of a top-level section, e.g. `NWBFile` or `Subject`, that can be
/// stored as attributes: scalars and lists of scalars. Nested mappings are
/// written as groups by their own writers.
pub fn attribute_fields(metadata: &Value, key: &str) -> Map<String, Value> {
    metadata
        .get(key)
        .and_then(|v| v.as_object())
        .map(|fields| {
            fields
                .iter()
                .filter(|(_, v)| is_attribute_value(v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}

fn is_attribute_value(value: &Value) -> bool {
    match value {
        Value::Object(_) => false,
        Value::Array(items) => items.iter().all(|item| !item.is_object() && !item.is_array()),
        _ => true,
    }
}
