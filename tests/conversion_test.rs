mod common;

use anyhow::Result;
use clandinin_nwb_toolbox::converter::{self, SessionConversion};
use clandinin_nwb_toolbox::nwb::NwbStore;
use common::{SESSION_ID, SUBJECT_ID, SessionFixture, SessionOptions, voxel_value, write_nifti_u16};
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use zarrs::array::Array;
use zarrs::array_subset::ArraySubset;

fn stub_config(data_dir: &Path, output_dir: &Path) -> SessionConversion {
    let mut config = SessionConversion::new(data_dir, output_dir, SUBJECT_ID, SESSION_ID);
    config.stub_test = true;
    config.stub_frames = 5;
    config.metadata_override = Some(data_dir.join("no-override.yaml"));
    config
}

/// Names in `dir` that are not the finished container or its lock file
fn leftovers(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if name.contains(".partial-") {
            names.push(name);
        }
    }
    Ok(names)
}

#[test]
fn test_stub_conversion_layout() -> Result<()> {
    let data = TempDir::new()?;
    let output = TempDir::new()?;
    SessionFixture::build(data.path(), &SessionOptions::default())?;

    let config = stub_config(data.path(), output.path());
    let written = converter::session_to_nwb(&config)?;

    assert_eq!(
        written,
        output.path().join("nwb_stub").join("20200620_fly2.nwb.zarr")
    );
    assert!(leftovers(&output.path().join("nwb_stub"))?.is_empty());

    let nwb = NwbStore::open(&written)?;

    let root = nwb.read_attributes("/")?;
    assert_eq!(root["neurodata_type"], "NWBFile");
    assert_eq!(root["session_id"], SESSION_ID);
    assert_eq!(root["session_start_time"], "2020-06-20T10:15:02.123456700-07:00");
    assert_eq!(root["conversion"]["stub_test"], true);
    assert_eq!(root["conversion"]["stub_frames"], 5);

    let subject = nwb.read_attributes("/general/subject")?;
    assert_eq!(subject["subject_id"], SUBJECT_ID);

    assert!(nwb.has_group("/general/devices/BrukerUltima")?);
    assert!(nwb.has_group("/general/devices/Flea FL3-U3-13E4M-C")?);
    assert_eq!(nwb.children("/general/optophysiology")?.len(), 4);

    // Stub mode caps functional volumes; anatomical has fewer than the cap
    assert_eq!(
        nwb.array_shape("/acquisition/TwoPhotonSeriesFunctionalGreen/data")?,
        vec![5, 3, 4, 3]
    );
    assert_eq!(
        nwb.array_shape("/acquisition/TwoPhotonSeriesAnatomicalRed/data")?,
        vec![3, 3, 4, 2]
    );
    Ok(())
}

#[test]
fn test_volume_values_and_timing() -> Result<()> {
    let data = TempDir::new()?;
    let output = TempDir::new()?;
    SessionFixture::build(data.path(), &SessionOptions::default())?;

    let written = converter::session_to_nwb(&stub_config(data.path(), output.path()))?;
    let nwb = NwbStore::open(&written)?;

    let array = Array::open(
        nwb.store().clone(),
        "/acquisition/TwoPhotonSeriesFunctionalGreen/data",
    )?;
    let subset = ArraySubset::new_with_start_shape(vec![2, 0, 0, 0], vec![1, 3, 4, 3])?;
    let frame = array.retrieve_array_subset_ndarray::<u16>(&subset)?;
    assert_eq!(frame[[0, 1, 2, 0]], voxel_value(2, 1, 0, 2));
    assert_eq!(frame[[0, 2, 3, 2]], voxel_value(3, 2, 2, 2));

    let green = nwb.read_attributes("/acquisition/TwoPhotonSeriesFunctionalGreen")?;
    assert_eq!(green["starting_time"], 0.0);
    assert!((green["rate"].as_f64().unwrap_or_default() - 1.0 / 0.3).abs() < 1e-6);
    assert_eq!(
        green["imaging_plane"],
        "/general/optophysiology/ImagingPlaneFunctionalGreen"
    );

    let anatomical = nwb.read_attributes("/acquisition/TwoPhotonSeriesAnatomicalGreen")?;
    let offset = anatomical["starting_time"].as_f64().unwrap_or_default();
    assert!((offset - 1799.8765433).abs() < 1e-6);
    assert!((anatomical["rate"].as_f64().unwrap_or_default() - 10.0).abs() < 1e-6);
    Ok(())
}

#[test]
fn test_behavior_shares_synthetic_timeline() -> Result<()> {
    let data = TempDir::new()?;
    let output = TempDir::new()?;
    let fixture = SessionFixture::build(data.path(), &SessionOptions::default())?;

    let written = converter::session_to_nwb(&stub_config(data.path(), output.path()))?;
    let nwb = NwbStore::open(&written)?;

    let fictrac = nwb.children("/processing/behavior/FicTrac")?;
    assert_eq!(fictrac.len(), 9);

    let heading = "/processing/behavior/FicTrac/lab_integrated_animal_heading";
    assert_eq!(nwb.array_shape(&format!("{heading}/data"))?, vec![100, 1]);
    let timestamps = nwb.read_f64_1d(&format!("{heading}/timestamps"))?;
    assert_eq!(timestamps.len(), 100);
    for (i, t) in timestamps.iter().enumerate() {
        assert!((t - i as f64 * 0.02).abs() < 1e-9);
    }
    let attrs = nwb.read_attributes(heading)?;
    assert_eq!(attrs["reference_frame"], "laboratory");

    let video = nwb.read_attributes("/acquisition/BehavioralVideo")?;
    assert_eq!(video["neurodata_type"], "ImageSeries");
    assert_eq!(video["format"], "external");
    assert_eq!(video["external_file"][0], fixture.video.display().to_string());
    assert_eq!(
        nwb.read_f64_1d("/acquisition/BehavioralVideo/timestamps")?,
        timestamps
    );
    Ok(())
}

#[test]
fn test_metadata_override_is_applied() -> Result<()> {
    let data = TempDir::new()?;
    let output = TempDir::new()?;
    SessionFixture::build(data.path(), &SessionOptions::default())?;

    let override_path = data.path().join("override.yaml");
    fs::write(
        &override_path,
        "NWBFile:\n  lab: Clandinin Lab\n  session_start_time: '1999-01-01T00:00:00Z'\nSubject:\n  sex: F\n",
    )?;
    let mut config = stub_config(data.path(), output.path());
    config.metadata_override = Some(override_path);

    let nwb = NwbStore::open(&converter::session_to_nwb(&config)?)?;
    let root = nwb.read_attributes("/")?;
    assert_eq!(root["lab"], "Clandinin Lab");
    assert_eq!(root["session_start_time"], "2020-06-20T10:15:02.123456700-07:00");
    assert_eq!(nwb.read_attributes("/general/subject")?["sex"], "F");
    Ok(())
}

#[test]
fn test_override_lists_reach_root_attributes() -> Result<()> {
    let data = TempDir::new()?;
    let output = TempDir::new()?;
    SessionFixture::build(data.path(), &SessionOptions::default())?;

    let override_path = data.path().join("override.yaml");
    fs::write(
        &override_path,
        "NWBFile:\n  keywords:\n    - two-photon\n    - FicTrac\n  related_publications:\n    - https://doi.org/10.1101/2022.03.20.485047\n  notes:\n    - { text: nested }\n",
    )?;
    let mut config = stub_config(data.path(), output.path());
    config.metadata_override = Some(override_path);

    let nwb = NwbStore::open(&converter::session_to_nwb(&config)?)?;
    let root = nwb.read_attributes("/")?;
    assert_eq!(root["keywords"], serde_json::json!(["two-photon", "FicTrac"]));
    assert_eq!(
        root["related_publications"],
        serde_json::json!(["https://doi.org/10.1101/2022.03.20.485047"])
    );
    // Lists of mappings are not attribute values
    assert!(root.get("notes").is_none());
    Ok(())
}

#[test]
fn test_processed_volume_uses_functional_rate() -> Result<()> {
    let data = TempDir::new()?;
    let output = TempDir::new()?;
    SessionFixture::build(data.path(), &SessionOptions::default())?;

    let processed = data.path().join("functional_channel_2_moco.nii");
    write_nifti_u16(&processed, [4, 3, 3, 12])?;
    let mut config = stub_config(data.path(), output.path());
    config.processed_volume = Some(processed);

    let nwb = NwbStore::open(&converter::session_to_nwb(&config)?)?;
    let path = "/processing/ophys/TwoPhotonSeriesFunctionalGreenProcessed";
    let attrs = nwb.read_attributes(path)?;
    assert!((attrs["rate"].as_f64().unwrap_or_default() - 1.0 / 0.3).abs() < 1e-6);
    assert_eq!(nwb.array_shape(&format!("{path}/data"))?, vec![5, 3, 4, 3]);
    Ok(())
}

#[test]
fn test_full_conversion_writes_every_frame() -> Result<()> {
    let data = TempDir::new()?;
    let output = TempDir::new()?;
    SessionFixture::build(data.path(), &SessionOptions::default())?;

    let mut config = stub_config(data.path(), output.path());
    config.stub_test = false;

    let written = converter::session_to_nwb(&config)?;
    assert_eq!(written, output.path().join("20200620_fly2.nwb.zarr"));
    let nwb = NwbStore::open(&written)?;
    assert_eq!(
        nwb.array_shape("/acquisition/TwoPhotonSeriesFunctionalRed/data")?,
        vec![12, 3, 4, 3]
    );
    Ok(())
}

#[test]
fn test_missing_anatomical_folder_writes_nothing() -> Result<()> {
    let data = TempDir::new()?;
    let output = TempDir::new()?;
    let fixture = SessionFixture::build(data.path(), &SessionOptions::default())?;
    fs::remove_dir_all(fixture.anatomical_folder.parent().expect("anat folder"))?;

    let config = stub_config(data.path(), output.path());
    assert!(converter::session_to_nwb(&config).is_err());
    assert!(!config.output_path().exists());
    assert!(leftovers(&output.path().join("nwb_stub"))?.is_empty());
    Ok(())
}

#[test]
fn test_failure_during_write_leaves_no_partial_output() -> Result<()> {
    let data = TempDir::new()?;
    let output = TempDir::new()?;
    let fixture = SessionFixture::build(data.path(), &SessionOptions::default())?;

    // Header intact, voxel data cut short
    let volume = fixture.anatomical_folder.join("anatomy_channel_1.nii");
    let bytes = fs::read(&volume)?;
    fs::write(&volume, &bytes[..bytes.len() / 2])?;

    let config = stub_config(data.path(), output.path());
    assert!(converter::session_to_nwb(&config).is_err());
    assert!(!config.output_path().exists());
    assert!(leftovers(&output.path().join("nwb_stub"))?.is_empty());
    Ok(())
}

#[test]
fn test_existing_output_requires_overwrite() -> Result<()> {
    let data = TempDir::new()?;
    let output = TempDir::new()?;
    SessionFixture::build(data.path(), &SessionOptions::default())?;

    let mut config = stub_config(data.path(), output.path());
    let first = converter::session_to_nwb(&config)?;
    let identifier = NwbStore::open(&first)?.read_attributes("/")?["identifier"].clone();

    assert!(converter::session_to_nwb(&config).is_err());
    // The first container is untouched
    assert_eq!(
        NwbStore::open(&first)?.read_attributes("/")?["identifier"],
        identifier
    );

    config.overwrite = true;
    let second = converter::session_to_nwb(&config)?;
    assert_eq!(first, second);
    assert_ne!(
        NwbStore::open(&second)?.read_attributes("/")?["identifier"],
        identifier
    );
    Ok(())
}

#[test]
fn test_discover_sessions() -> Result<()> {
    let data = TempDir::new()?;
    SessionFixture::build(data.path(), &SessionOptions::default())?;
    // A subject without imaging data is skipped
    fs::create_dir_all(data.path().join("imports").join(SESSION_ID).join("fly9"))?;
    // A second session
    let other = data.path().join("imports").join("20200701").join("fly1");
    let folder = other.join("func_0").join("TSeries-07012020-0001");
    fs::create_dir_all(&folder)?;
    fs::write(folder.join("TSeries-07012020-0001.xml"), "<PVScan/>")?;

    let sessions = converter::discover_sessions(data.path())?;
    assert_eq!(
        sessions,
        vec![
            (SESSION_ID.to_string(), SUBJECT_ID.to_string()),
            ("20200701".to_string(), "fly1".to_string()),
        ]
    );
    Ok(())
}
