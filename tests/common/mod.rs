#![allow(dead_code)]

use anyhow::Result;
use byteorder::{LittleEndian, WriteBytesExt};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const SESSION_ID: &str = "20200620";
pub const SUBJECT_ID: &str = "fly2";

/// Voxel value at `(x, y, z, t)` in the generated volumes
pub fn voxel_value(x: usize, y: usize, z: usize, t: usize) -> u16 {
    (t * 1000 + z * 100 + y * 10 + x) as u16
}

/// Little-endian uint16 NIfTI-1 volume filled with [`voxel_value`]
pub fn write_nifti_u16(path: &Path, dims: [usize; 4]) -> Result<()> {
    let mut header = vec![0u8; 352];
    (&mut header[0..4]).write_i32::<LittleEndian>(348)?;
    (&mut header[40..42]).write_i16::<LittleEndian>(4)?;
    for (i, dim) in dims.iter().enumerate() {
        (&mut header[42 + 2 * i..44 + 2 * i]).write_i16::<LittleEndian>(*dim as i16)?;
    }
    (&mut header[70..72]).write_i16::<LittleEndian>(512)?;
    (&mut header[72..74]).write_i16::<LittleEndian>(16)?;
    for (i, spacing) in [1.0f32, 2.6, 2.6, 5.0, 0.5].iter().enumerate() {
        (&mut header[76 + 4 * i..80 + 4 * i]).write_f32::<LittleEndian>(*spacing)?;
    }
    (&mut header[108..112]).write_f32::<LittleEndian>(352.0)?;
    header[123] = 10;
    header[344..348].copy_from_slice(b"n+1\0");

    let [nx, ny, nz, nt] = dims;
    let mut file = fs::File::create(path)?;
    file.write_all(&header)?;
    for t in 0..nt {
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    file.write_u16::<LittleEndian>(voxel_value(x, y, z, t))?;
                }
            }
        }
    }
    Ok(())
}

pub struct BrukerXml<'a> {
    pub date: &'a str,
    pub sequence_time: &'a str,
    pub channels: &'a [(&'a str, &'a str)],
    pub frame_times: Vec<f64>,
    pub z_device: &'a str,
    pub with_geometry: bool,
}

impl Default for BrukerXml<'_> {
    fn default() -> Self {
        Self {
            date: "06/20/2020 10:14:58 AM",
            sequence_time: "10:15:02.1234567",
            channels: &[("1", "Red"), ("2", "Green")],
            frame_times: (0..12).map(|i| i as f64 * 0.1).collect(),
            z_device: "1",
            with_geometry: true,
        }
    }
}

impl BrukerXml<'_> {
    pub fn render(&self) -> String {
        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
        xml.push_str(&format!(
            "<PVScan version=\"5.5.64.100\" date=\"{}\" notes=\"\">\n",
            self.date
        ));
        xml.push_str("  <SystemIDs SystemID=\"1234\" />\n");
        xml.push_str("  <PVStateShard>\n");
        xml.push_str("    <PVStateValue key=\"activeMode\" value=\"Galvo\" />\n");
        xml.push_str(&format!(
            "    <PVStateValue key=\"zDevice\" value=\"{}\" />\n",
            self.z_device
        ));
        xml.push_str("    <PVStateValue key=\"scanLinePeriod\" value=\"0.000633\" />\n");
        xml.push_str("    <PVStateValue key=\"laserWavelength\">\n");
        xml.push_str("      <IndexedValue index=\"0\" value=\"920\" description=\"Chameleon\" />\n");
        xml.push_str("    </PVStateValue>\n");
        if self.with_geometry {
            xml.push_str("    <PVStateValue key=\"micronsPerPixel\">\n");
            xml.push_str("      <IndexedValue index=\"XAxis\" value=\"2.6\" />\n");
            xml.push_str("      <IndexedValue index=\"YAxis\" value=\"2.6\" />\n");
            xml.push_str("      <IndexedValue index=\"ZAxis\" value=\"5\" />\n");
            xml.push_str("    </PVStateValue>\n");
        }
        xml.push_str("    <PVStateValue key=\"pmtGain\">\n");
        xml.push_str("      <IndexedValue index=\"0\" value=\"550\" description=\"PMT 1 HV\" />\n");
        xml.push_str("      <IndexedValue index=\"1\" value=\"650\" description=\"PMT 2 HV\" />\n");
        xml.push_str("    </PVStateValue>\n");
        xml.push_str("    <PVStateValue key=\"positionCurrent\">\n");
        xml.push_str("      <SubindexedValues index=\"XAxis\">\n");
        xml.push_str("        <SubindexedValue subindex=\"0\" value=\"-12.5\" />\n");
        xml.push_str("      </SubindexedValues>\n");
        xml.push_str("    </PVStateValue>\n");
        xml.push_str("  </PVStateShard>\n");
        xml.push_str(&format!(
            "  <Sequence type=\"TSeries ZSeries Element\" cycle=\"1\" time=\"{}\" bidirectionalZ=\"False\">\n",
            self.sequence_time
        ));
        for (index, time) in self.frame_times.iter().enumerate() {
            xml.push_str(&format!(
                "    <Frame relativeTime=\"{time}\" absoluteTime=\"{time}\" index=\"{}\" parameterSet=\"CurrentSettings\">\n",
                index + 1
            ));
            for (id, name) in self.channels {
                xml.push_str(&format!(
                    "      <File channel=\"{id}\" channelName=\"{name}\" page=\"1\" filename=\"TSeries_Cycle00001_Ch{id}_{:06}.ome.tif\" />\n",
                    index + 1
                ));
            }
            xml.push_str("      <PVStateShard>\n");
            xml.push_str("        <PVStateValue key=\"zDevice\" value=\"0\" />\n");
            xml.push_str("      </PVStateShard>\n");
            xml.push_str("    </Frame>\n");
        }
        xml.push_str("  </Sequence>\n");
        xml.push_str("</PVScan>\n");
        xml
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.render())?;
        Ok(())
    }
}

/// One FicTrac row with 25 columns; row `i` has frame counter `i + 1`
/// and a recorded timestamp of `i * delta_ms`
pub fn fictrac_row(i: usize, delta_ms: f64) -> String {
    let mut fields = vec![(i + 1).to_string()];
    for column in 1..21 {
        fields.push(format!("{:.6}", column as f64 * 0.01 + i as f64 * 0.001));
    }
    fields.push(format!("{:.1}", i as f64 * delta_ms));
    fields.push((i + 1).to_string());
    fields.push(format!("{:.1}", delta_ms));
    fields.push(format!("{:.1}", 36_000_000.0 + i as f64 * delta_ms));
    fields.join(", ")
}

pub fn write_fictrac(path: &Path, rows: usize) -> Result<()> {
    let lines: Vec<String> = (0..rows).map(|i| fictrac_row(i, 20.0)).collect();
    fs::write(path, lines.join("\n") + "\n")?;
    Ok(())
}

/// A complete raw session on disk
pub struct SessionFixture {
    pub root: PathBuf,
    pub functional_folder: PathBuf,
    pub anatomical_folder: PathBuf,
    pub fictrac_log: PathBuf,
    pub video: PathBuf,
}

pub struct SessionOptions<'a> {
    pub functional_dims: [usize; 4],
    pub anatomical_dims: [usize; 4],
    /// `PVScan/@date` of each scan
    pub functional_date: &'a str,
    pub anatomical_date: &'a str,
    pub functional_time: &'a str,
    pub anatomical_time: &'a str,
    pub fictrac_rows: usize,
    pub fictrac_stamp: &'a str,
}

impl Default for SessionOptions<'_> {
    fn default() -> Self {
        Self {
            functional_dims: [4, 3, 3, 12],
            anatomical_dims: [4, 3, 2, 3],
            functional_date: "06/20/2020 10:14:58 AM",
            anatomical_date: "06/20/2020 10:44:58 AM",
            functional_time: "10:15:02.1234567",
            anatomical_time: "10:45:02",
            fictrac_rows: 100,
            fictrac_stamp: "20200620_101500",
        }
    }
}

impl SessionFixture {
    pub fn build(root: &Path, options: &SessionOptions<'_>) -> Result<Self> {
        let subject_dir = root.join("imports").join(SESSION_ID).join(SUBJECT_ID);

        let functional_folder = subject_dir.join("func_0").join("TSeries-06202020-0001");
        fs::create_dir_all(&functional_folder)?;
        let [_, _, planes, volumes] = options.functional_dims;
        BrukerXml {
            date: options.functional_date,
            sequence_time: options.functional_time,
            frame_times: (0..planes * volumes).map(|i| i as f64 * 0.1).collect(),
            ..Default::default()
        }
        .write(&functional_folder.join("TSeries-06202020-0001.xml"))?;
        write_nifti_u16(&functional_folder.join("functional_channel_1.nii"), options.functional_dims)?;
        write_nifti_u16(&functional_folder.join("functional_channel_2.nii"), options.functional_dims)?;

        let anatomical_folder = subject_dir.join("anat_0").join("TSeries-06202020-0002");
        fs::create_dir_all(&anatomical_folder)?;
        let [_, _, planes, volumes] = options.anatomical_dims;
        BrukerXml {
            date: options.anatomical_date,
            sequence_time: options.anatomical_time,
            frame_times: (0..planes * volumes).map(|i| i as f64 * 0.05).collect(),
            ..Default::default()
        }
        .write(&anatomical_folder.join("TSeries-06202020-0002.xml"))?;
        write_nifti_u16(&anatomical_folder.join("anatomy_channel_1.nii"), options.anatomical_dims)?;
        write_nifti_u16(&anatomical_folder.join("anatomy_channel_2.nii"), options.anatomical_dims)?;

        let fictrac_dir = root.join("fictrac");
        fs::create_dir_all(&fictrac_dir)?;
        let fictrac_log = fictrac_dir.join(format!("fictrac-{}.dat", options.fictrac_stamp));
        write_fictrac(&fictrac_log, options.fictrac_rows)?;
        let video = fictrac_dir.join(format!("fictrac-{}-raw.avi", options.fictrac_stamp));
        fs::write(&video, b"RIFF")?;

        Ok(Self {
            root: root.to_path_buf(),
            functional_folder,
            anatomical_folder,
            fictrac_log,
            video,
        })
    }
}
