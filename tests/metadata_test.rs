mod common;

use anyhow::Result;
use chrono::NaiveDate;
use clandinin_nwb_toolbox::alignment::{self, DEFAULT_TIMEZONE};
use clandinin_nwb_toolbox::error::ConversionError;
use clandinin_nwb_toolbox::imaging::{FUNCTIONAL_GREEN, FUNCTIONAL_RED, ImagingStream};
use clandinin_nwb_toolbox::metadata::{self, MetadataContext, PROCESSED_SERIES_NAME};
use common::{BrukerXml, SESSION_ID, SUBJECT_ID, SessionFixture, SessionOptions};
use serde_json::json;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn functional_streams(fixture: &SessionFixture) -> Result<Vec<ImagingStream>> {
    Ok(vec![
        ImagingStream::open(&fixture.functional_folder, FUNCTIONAL_GREEN)?,
        ImagingStream::open(&fixture.functional_folder, FUNCTIONAL_RED)?,
    ])
}

fn defaults_for(streams: &[ImagingStream], include_processed: bool) -> serde_json::Value {
    let refs: Vec<&ImagingStream> = streams.iter().collect();
    metadata::default_metadata(&MetadataContext {
        subject_id: SUBJECT_ID,
        session_id: SESSION_ID,
        streams: &refs,
        include_processed,
    })
}

#[test]
fn test_deep_merge_nested_objects() {
    let mut base = json!({
        "NWBFile": { "lab": "Clandinin", "institution": "Stanford University" },
        "Ophys": { "Device": [{ "name": "A" }, { "name": "B" }] },
    });
    let overlay = json!({
        "NWBFile": { "lab": "Clandinin Lab", "keywords": ["fly"] },
        "Ophys": { "Device": [{ "name": "C" }] },
        "Extra": 1,
    });

    metadata::deep_merge(&mut base, overlay);

    assert_eq!(base["NWBFile"]["lab"], "Clandinin Lab");
    assert_eq!(base["NWBFile"]["institution"], "Stanford University");
    assert_eq!(base["NWBFile"]["keywords"], json!(["fly"]));
    // Lists are replaced, not concatenated
    assert_eq!(base["Ophys"]["Device"], json!([{ "name": "C" }]));
    assert_eq!(base["Extra"], 1);
}

#[test]
fn test_deep_merge_scalar_replaces_object() {
    let mut base = json!({ "Subject": { "age": "P3D" } });
    metadata::deep_merge(&mut base, json!({ "Subject": null }));
    assert!(base["Subject"].is_null());
}

#[test]
fn test_defaults_derived_from_instrument() -> Result<()> {
    let dir = TempDir::new()?;
    let fixture = SessionFixture::build(dir.path(), &SessionOptions::default())?;
    let streams = functional_streams(&fixture)?;
    let defaults = defaults_for(&streams, false);

    assert_eq!(defaults["NWBFile"]["session_id"], SESSION_ID);
    assert_eq!(defaults["Subject"]["species"], "Drosophila melanogaster");
    assert!(
        defaults["Ophys"]["Device"][0]["description"]
            .as_str()
            .is_some_and(|d| d.contains("5.5.64.100"))
    );

    let planes = metadata::imaging_planes(&defaults)?;
    assert_eq!(planes.len(), 2);
    assert_eq!(planes[0].name, "ImagingPlaneFunctionalGreen");
    assert_eq!(planes[0].excitation_lambda, Some(920.0));
    assert_eq!(planes[0].grid_spacing, Some(vec![2.6, 2.6, 5.0]));
    assert_eq!(planes[0].grid_spacing_unit.as_deref(), Some("micrometers"));
    assert_eq!(planes[1].optical_channel[0].emission_lambda, Some(581.0));

    let series = metadata::two_photon_series_at(&defaults, 0)?;
    assert_eq!(series.name, "TwoPhotonSeriesFunctionalGreen");
    assert_eq!(series.unit, "n.a.");
    assert_eq!(series.dimension, Some(vec![3, 4, 3]));
    let fov = series.field_of_view.expect("field of view");
    assert!((fov[0] - 2.6 * 4.0 * 1e-6).abs() < 1e-12);
    assert!((series.scan_line_rate.unwrap_or_default() - 1.0 / 0.000633).abs() < 1e-6);
    assert!((series.rate.unwrap_or_default() - 1.0 / 0.3).abs() < 1e-6);

    let behavior_devices = metadata::devices(&defaults)?;
    assert_eq!(behavior_devices.len(), 2);
    assert_eq!(behavior_devices[1].name, metadata::CAMERA_NAME);
    assert_eq!(defaults["Behavior"]["FicTrac"]["description"], "Fictrac data");
    assert_eq!(defaults["Behavior"]["Video"]["name"], "BehavioralVideo");
    Ok(())
}

#[test]
fn test_missing_geometry_is_omitted() -> Result<()> {
    let dir = TempDir::new()?;
    let fixture = SessionFixture::build(dir.path(), &SessionOptions::default())?;
    BrukerXml {
        with_geometry: false,
        frame_times: (0..36).map(|i| i as f64 * 0.1).collect(),
        ..Default::default()
    }
    .write(&fixture.functional_folder.join("TSeries-06202020-0001.xml"))?;

    let streams = functional_streams(&fixture)?;
    let defaults = defaults_for(&streams, false);

    let planes = metadata::imaging_planes(&defaults)?;
    assert_eq!(planes[0].grid_spacing, None);
    assert!(defaults["Ophys"]["ImagingPlane"][0].get("grid_spacing_unit").is_none());
    assert_eq!(metadata::two_photon_series_at(&defaults, 0)?.field_of_view, None);
    Ok(())
}

#[test]
fn test_processed_series_is_optional() -> Result<()> {
    let dir = TempDir::new()?;
    let fixture = SessionFixture::build(dir.path(), &SessionOptions::default())?;
    let streams = functional_streams(&fixture)?;

    assert!(metadata::two_photon_series_named(&defaults_for(&streams, false), PROCESSED_SERIES_NAME).is_err());

    let processed = metadata::two_photon_series_named(&defaults_for(&streams, true), PROCESSED_SERIES_NAME)?;
    assert_eq!(processed.imaging_plane, "ImagingPlaneFunctionalGreen");
    assert!((processed.rate.unwrap_or_default() - 1.0 / 0.3).abs() < 1e-6);
    Ok(())
}

#[test]
fn test_override_replaces_device_list() -> Result<()> {
    let dir = TempDir::new()?;
    let fixture = SessionFixture::build(dir.path(), &SessionOptions::default())?;
    let streams = functional_streams(&fixture)?;
    let mut merged = defaults_for(&streams, false);

    let override_path = dir.path().join("override.yaml");
    fs::write(
        &override_path,
        "Subject:\n  sex: F\nOphys:\n  Device:\n    - name: BrukerUltima\n      description: Custom\n",
    )?;
    metadata::deep_merge(&mut merged, metadata::load_override(&override_path)?);

    assert_eq!(merged["Subject"]["sex"], "F");
    assert_eq!(merged["Subject"]["species"], "Drosophila melanogaster");
    let devices = metadata::devices(&merged)?;
    assert_eq!(devices[0].description.as_deref(), Some("Custom"));
    assert_eq!(devices[0].manufacturer, None);
    // Untouched sections survive
    assert_eq!(metadata::imaging_planes(&merged)?.len(), 2);
    Ok(())
}

#[test]
fn test_load_override_formats() -> Result<()> {
    let dir = TempDir::new()?;

    let missing = metadata::load_override(&dir.path().join("absent.yaml"))?;
    assert_eq!(missing, json!({}));

    let json_path = dir.path().join("override.json");
    fs::write(&json_path, r#"{"NWBFile": {"lab": "X"}}"#)?;
    assert_eq!(metadata::load_override(&json_path)?["NWBFile"]["lab"], "X");

    let empty = dir.path().join("null.yaml");
    fs::write(&empty, "~\n")?;
    assert_eq!(metadata::load_override(&empty)?, json!({}));

    let list = dir.path().join("list.yaml");
    fs::write(&list, "- a\n- b\n")?;
    assert!(matches!(
        metadata::load_override(&list),
        Err(ConversionError::Metadata(_))
    ));

    let broken = dir.path().join("broken.yaml");
    fs::write(&broken, "NWBFile: [unclosed\n")?;
    assert!(metadata::load_override(&broken).is_err());
    Ok(())
}

#[test]
fn test_bundled_override_parses() -> Result<()> {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join(metadata::DEFAULT_OVERRIDE_FILE);
    let overrides = metadata::load_override(&path)?;
    assert_eq!(overrides["NWBFile"]["lab"], "Clandinin");
    assert_eq!(overrides["Subject"]["sex"], "F");
    Ok(())
}

#[test]
fn test_finalize_wins_over_override() -> Result<()> {
    let mut merged = json!({
        "NWBFile": { "session_start_time": "1999-01-01T00:00:00Z" },
        "Subject": { "subject_id": "someone-else", "sex": "F" },
    });
    let naive = NaiveDate::from_ymd_opt(2020, 6, 20)
        .unwrap()
        .and_hms_opt(10, 15, 2)
        .unwrap();
    let start = alignment::localize(naive, DEFAULT_TIMEZONE)?;

    metadata::finalize(&mut merged, &start, SUBJECT_ID);

    assert_eq!(merged["NWBFile"]["session_start_time"], "2020-06-20T10:15:02-07:00");
    assert_eq!(merged["Subject"]["subject_id"], SUBJECT_ID);
    assert_eq!(merged["Subject"]["sex"], "F");

    let fields = metadata::attribute_fields(&merged, "Subject");
    assert_eq!(fields.len(), 2);
    Ok(())
}

#[test]
fn test_attribute_fields_keep_scalar_lists() {
    let merged = json!({
        "NWBFile": {
            "lab": "Clandinin",
            "keywords": ["two-photon", "FicTrac"],
            "experimenter": [],
            "nested": { "a": 1 },
            "table": [{ "a": 1 }],
            "grid": [[1, 2], [3, 4]],
        },
    });

    let fields = metadata::attribute_fields(&merged, "NWBFile");
    assert_eq!(fields["lab"], "Clandinin");
    assert_eq!(fields["keywords"], json!(["two-photon", "FicTrac"]));
    assert_eq!(fields["experimenter"], json!([]));
    assert!(!fields.contains_key("nested"));
    assert!(!fields.contains_key("table"));
    assert!(!fields.contains_key("grid"));
    assert!(metadata::attribute_fields(&merged, "Subject").is_empty());
}
