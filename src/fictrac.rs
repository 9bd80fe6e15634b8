//! FicTrac behavioural logs
//!
//! A `.dat` log is headerless CSV, one row per tracked video frame. See
//! <https://github.com/rjdmoore/fictrac/blob/master/doc/data_header.txt>.

use csv::{ReaderBuilder, Trim};
use ndarray::Array2;
use std::path::{Path, PathBuf};

use crate::error::{ConversionError, Result};

/// `(column name, description)` in file order
pub const FICTRAC_COLUMNS: [(&str, &str); 25] = [
    ("frame_counter", "Corresponding video frame (starts at #1)."),
    ("cam_delta_rotation_vector_x_right", "Change in orientation since last frame, represented as rotation angle/axis (radians) in camera coordinates (x right)."),
    ("cam_delta_rotation_vector_y_down", "Change in orientation since last frame, represented as rotation angle/axis (radians) in camera coordinates (y down)."),
    ("cam_delta_rotation_vector_z_forward", "Change in orientation since last frame, represented as rotation angle/axis (radians) in camera coordinates (z forward)."),
    ("delta_rotation_error_score", "Error score associated with rotation estimate."),
    ("lab_delta_rotation_vector_x_right", "Change in orientation since last frame, represented as rotation angle/axis (radians) in laboratory coordinates (x right)."),
    ("lab_delta_rotation_vector_y_down", "Change in orientation since last frame, represented as rotation angle/axis (radians) in laboratory coordinates (y down)."),
    ("lab_delta_rotation_vector_z_forward", "Change in orientation since last frame, represented as rotation angle/axis (radians) in laboratory coordinates (z forward)."),
    ("cam_absolute_rotation_vector_x", "Absolute orientation of the sphere represented as rotation angle/axis (radians) in camera coordinates (x)."),
    ("cam_absolute_rotation_vector_y", "Absolute orientation of the sphere represented as rotation angle/axis (radians) in camera coordinates (y)."),
    ("cam_absolute_rotation_vector_z", "Absolute orientation of the sphere represented as rotation angle/axis (radians) in camera coordinates (z)."),
    ("lab_absolute_rotation_vector_x", "Absolute orientation of the sphere represented as rotation angle/axis (radians) in laboratory coordinates (x)."),
    ("lab_absolute_rotation_vector_y", "Absolute orientation of the sphere represented as rotation angle/axis (radians) in laboratory coordinates (y)."),
    ("lab_absolute_rotation_vector_z", "Absolute orientation of the sphere represented as rotation angle/axis (radians) in laboratory coordinates (z)."),
    ("lab_integrated_x_y_position_x", "Integrated x position (radians) in laboratory coordinates. Scale by sphere radius for true position."),
    ("lab_integrated_x_y_position_y", "Integrated y position (radians) in laboratory coordinates. Scale by sphere radius for true position."),
    ("lab_integrated_animal_heading", "Integrated heading orientation (radians) of the animal in laboratory coordinates. This is the direction the animal is facing."),
    ("lab_animal_movement_direction", "Instantaneous running direction (radians) of the animal in laboratory coordinates. This is the direction the animal is moving in the lab frame (add to animal heading to get direction in the world)."),
    ("animal_movement_speed", "Instantaneous running speed (radians/frame) of the animal. Scale by sphere radius for true speed."),
    ("integrated_forward_side_motion_x", "Integrated x position (radians) of the sphere in laboratory coordinates neglecting heading. Equivalent to the output from two optic mice."),
    ("integrated_forward_side_motion_y", "Integrated y position (radians) of the sphere in laboratory coordinates neglecting heading. Equivalent to the output from two optic mice."),
    ("timestamp", "Either position in video file (ms) or frame capture time (ms since epoch)."),
    ("sequence_counter", "Position in the current frame sequence. Usually corresponds directly to the frame counter, but can reset to 1 if tracking is reset."),
    ("delta_timestamps", "Time (ms) since the last frame."),
    ("alt_timestamp", "Frame capture time (ms since midnight)."),
];

/// Older FicTrac versions write only the first 23 columns
pub const REQUIRED_COLUMNS: usize = 23;

pub const INTEGER_COLUMNS: [&str; 2] = ["frame_counter", "sequence_counter"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceFrame {
    Camera,
    Laboratory,
}

impl ReferenceFrame {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceFrame::Camera => "camera",
            ReferenceFrame::Laboratory => "laboratory",
        }
    }
}

/// Columns written together as one spatial series
#[derive(Debug, Clone, Copy)]
pub struct SpatialSeriesSpec {
    pub name: &'static str,
    pub reference_frame: ReferenceFrame,
    pub columns: &'static [&'static str],
}

pub const SPATIAL_SERIES: [SpatialSeriesSpec; 9] = [
    SpatialSeriesSpec {
        name: "cam_delta_rotation",
        reference_frame: ReferenceFrame::Camera,
        columns: &[
            "cam_delta_rotation_vector_x_right",
            "cam_delta_rotation_vector_y_down",
            "cam_delta_rotation_vector_z_forward",
        ],
    },
    SpatialSeriesSpec {
        name: "lab_delta_rotation",
        reference_frame: ReferenceFrame::Laboratory,
        columns: &[
            "lab_delta_rotation_vector_x_right",
            "lab_delta_rotation_vector_y_down",
            "lab_delta_rotation_vector_z_forward",
        ],
    },
    SpatialSeriesSpec {
        name: "cam_absolute_rotation",
        reference_frame: ReferenceFrame::Camera,
        columns: &[
            "cam_absolute_rotation_vector_x",
            "cam_absolute_rotation_vector_y",
            "cam_absolute_rotation_vector_z",
        ],
    },
    SpatialSeriesSpec {
        name: "lab_absolute_rotation",
        reference_frame: ReferenceFrame::Laboratory,
        columns: &[
            "lab_absolute_rotation_vector_x",
            "lab_absolute_rotation_vector_y",
            "lab_absolute_rotation_vector_z",
        ],
    },
    SpatialSeriesSpec {
        name: "lab_integrated_x_y_position",
        reference_frame: ReferenceFrame::Laboratory,
        columns: &["lab_integrated_x_y_position_x", "lab_integrated_x_y_position_y"],
    },
    SpatialSeriesSpec {
        name: "lab_integrated_animal_heading",
        reference_frame: ReferenceFrame::Laboratory,
        columns: &["lab_integrated_animal_heading"],
    },
    SpatialSeriesSpec {
        name: "lab_animal_movement_direction",
        reference_frame: ReferenceFrame::Laboratory,
        columns: &["lab_animal_movement_direction"],
    },
    SpatialSeriesSpec {
        name: "animal_movement_speed",
        reference_frame: ReferenceFrame::Laboratory,
        columns: &["animal_movement_speed"],
    },
    SpatialSeriesSpec {
        name: "integrated_forward_side_motion",
        reference_frame: ReferenceFrame::Laboratory,
        columns: &["integrated_forward_side_motion_x", "integrated_forward_side_motion_y"],
    },
];

pub fn column_index(name: &str) -> Option<usize> {
    FICTRAC_COLUMNS.iter().position(|(column, _)| *column == name)
}

pub fn column_description(name: &str) -> Option<&'static str> {
    FICTRAC_COLUMNS
        .iter()
        .find(|(column, _)| *column == name)
        .map(|(_, description)| *description)
}

/// The first 23 columns of every row, as `f64`
#[derive(Debug, Clone)]
pub struct FicTracLog {
    pub path: PathBuf,
    pub rows: Vec<[f64; REQUIRED_COLUMNS]>,
}

impl FicTracLog {
    pub fn read(path: &Path) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .trim(Trim::All)
            .flexible(true)
            .from_path(path)?;

        let mut rows = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let line = line + 1;
            if record.len() == 1 && record[0].is_empty() {
                continue;
            }
            if record.len() < REQUIRED_COLUMNS {
                return Err(ConversionError::FicTracFormat {
                    line,
                    message: format!(
                        "expected at least {REQUIRED_COLUMNS} columns, found {}",
                        record.len()
                    ),
                });
            }

            let mut row = [0f64; REQUIRED_COLUMNS];
            for (index, value) in row.iter_mut().enumerate() {
                let field = &record[index];
                let (column, _) = FICTRAC_COLUMNS[index];
                *value = if INTEGER_COLUMNS.contains(&column) {
                    field.parse::<i64>().map(|v| v as f64).map_err(|_| {
                        ConversionError::FicTracFormat {
                            line,
                            message: format!("{column} is not an integer: '{field}'"),
                        }
                    })?
                } else {
                    field.parse::<f64>().map_err(|_| ConversionError::FicTracFormat {
                        line,
                        message: format!("{column} is not a number: '{field}'"),
                    })?
                };
            }
            rows.push(row);
        }

        tracing::info!("Read {} FicTrac rows from {}", rows.len(), path.display());

        Ok(Self {
            path: path.to_path_buf(),
            rows,
        })
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let index = column_index(name).filter(|&i| i < REQUIRED_COLUMNS)?;
        Some(self.rows.iter().map(|row| row[index]).collect())
    }

    /// `[rows, columns]` data of one spatial series
    pub fn spatial_series_data(&self, spec: &SpatialSeriesSpec) -> Result<Array2<f64>> {
        let indices = spec
            .columns
            .iter()
            .map(|name| {
                column_index(name).ok_or_else(|| ConversionError::FicTracFormat {
                    line: 0,
                    message: format!("unknown column {name}"),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let values: Vec<f64> = self
            .rows
            .iter()
            .flat_map(|row| indices.iter().map(move |&i| row[i]))
            .collect();
        Ok(Array2::from_shape_vec((self.rows.len(), indices.len()), values)?)
    }

    /// Rate implied by the recorded `timestamp` column (milliseconds).
    /// Not used as the clock of record.
    pub fn recorded_rate(&self) -> Option<f64> {
        let timestamps = self.column("timestamp")?;
        if timestamps.len() < 2 {
            return None;
        }
        let total: f64 = timestamps.windows(2).map(|w| w[1] - w[0]).sum();
        let mean_delta_ms = total / (timestamps.len() - 1) as f64;
        let rate = 1000.0 / mean_delta_ms;
        (rate.is_finite() && rate > 0.0).then_some(rate)
    }
}
