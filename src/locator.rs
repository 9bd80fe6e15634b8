//! Session file discovery
//!
//! Raw data follows a naming convention rather than a schema:
//!
//! ```text
//! <data_dir>/
//! ├── fictrac/
//! │   ├── fictrac-<YYYYMMDD>_<HHMMSS>.dat
//! │   └── fictrac-<YYYYMMDD>_<HHMMSS>-raw.avi
//! └── imports/<session>/<subject>/
//!     ├── func_0/TSeries-<...>/TSeries-<...>.xml + *channel_<id>*.nii
//!     └── anat_0/TSeries-<...>/TSeries-<...>.xml + *channel_<id>*.nii
//! ```
//!
//! Every lookup resolves to exactly one path or fails.

use chrono::{DateTime, NaiveDateTime};
use chrono_tz::Tz;
use std::path::{Path, PathBuf};

use crate::alignment;
use crate::error::{ConversionError, Result};
use crate::imaging::Purpose;

pub const FICTRAC_DIR: &str = "fictrac";
pub const IMPORTS_DIR: &str = "imports";
pub const FICTRAC_LOG_SUFFIX: &str = ".dat";
pub const VIDEO_SUFFIX: &str = "-raw.avi";
pub const TSERIES_PREFIX: &str = "TSeries-";

/// All entries of `directory` whose name starts with `prefix` and ends
/// with `suffix`, sorted by name
pub fn find_items_in_directory(directory: &Path, prefix: &str, suffix: &str) -> Result<Vec<PathBuf>> {
    let mut matches = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(prefix) && name.ends_with(suffix) {
            matches.push(entry.path());
        }
    }
    matches.sort();
    Ok(matches)
}

/// The single entry matching `prefix`/`suffix`
pub fn find_item_in_directory(directory: &Path, prefix: &str, suffix: &str) -> Result<PathBuf> {
    let mut matches = find_items_in_directory(directory, prefix, suffix)?;
    match matches.len() {
        0 => Err(ConversionError::NotFound {
            directory: directory.to_path_buf(),
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
        }),
        1 => Ok(matches.remove(0)),
        _ => Err(ConversionError::AmbiguousMatch {
            directory: directory.to_path_buf(),
            pattern: format!("{prefix}*{suffix}"),
            candidates: matches,
        }),
    }
}

/// The single subdirectory whose name contains `marker`
pub fn find_directory_containing(directory: &Path, marker: &str) -> Result<PathBuf> {
    let mut matches = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() && entry.file_name().to_string_lossy().contains(marker) {
            matches.push(entry.path());
        }
    }
    matches.sort();

    match matches.len() {
        0 => Err(ConversionError::NotFound {
            directory: directory.to_path_buf(),
            prefix: format!("*{marker}"),
            suffix: String::new(),
        }),
        1 => Ok(matches.remove(0)),
        _ => Err(ConversionError::AmbiguousMatch {
            directory: directory.to_path_buf(),
            pattern: format!("*{marker}*"),
            candidates: matches,
        }),
    }
}

/// PrairieView names the sidecar after its folder: `TSeries-x/TSeries-x.xml`
pub fn bruker_xml_file(folder: &Path) -> Result<PathBuf> {
    let name = folder
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let xml_path = folder.join(format!("{name}.xml"));
    if xml_path.is_file() {
        Ok(xml_path)
    } else {
        Err(ConversionError::NotFound {
            directory: folder.to_path_buf(),
            prefix: name,
            suffix: ".xml".to_string(),
        })
    }
}

/// The single `.nii` file in `folder` carrying the `channel_<id>` token.
/// `channel_1` does not match `channel_10`.
pub fn channel_volume_file(folder: &Path, channel_id: &str) -> Result<PathBuf> {
    let token = format!("channel_{channel_id}");
    let mut matches: Vec<PathBuf> = find_items_in_directory(folder, "", ".nii")?
        .into_iter()
        .filter(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            name.match_indices(&token).any(|(at, _)| {
                !name[at + token.len()..]
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_digit())
            })
        })
        .collect();

    match matches.len() {
        0 => Err(ConversionError::NotFound {
            directory: folder.to_path_buf(),
            prefix: format!("*{token}"),
            suffix: ".nii".to_string(),
        }),
        1 => Ok(matches.remove(0)),
        _ => Err(ConversionError::AmbiguousMatch {
            directory: folder.to_path_buf(),
            pattern: format!("*{token}*.nii"),
            candidates: matches,
        }),
    }
}

/// `YYYYMMDD` session ids name a day rather than one recording
pub fn is_date_session(session_id: &str) -> bool {
    session_id.len() == 8 && session_id.chars().all(|c| c.is_ascii_digit())
}

/// Start time embedded in a FicTrac file name (`fictrac-YYYYMMDD_HHMMSS...`),
/// localized in `timezone`
pub fn fictrac_log_timestamp(path: &Path, timezone: Tz) -> Option<DateTime<Tz>> {
    let name = path.file_name()?.to_string_lossy().to_string();
    let stamp = name.strip_prefix("fictrac-")?.get(..15)?;
    let naive = NaiveDateTime::parse_from_str(stamp, "%Y%m%d_%H%M%S").ok()?;
    alignment::localize(naive, timezone).ok()
}

/// Among same-day logs, the one whose embedded start time is closest to
/// `reference_epoch`. Equal distances are reported as ambiguous.
pub fn select_closest_log(
    directory: &Path,
    candidates: &[PathBuf],
    reference_epoch: f64,
    timezone: Tz,
) -> Result<PathBuf> {
    let mut best: Option<(f64, &PathBuf)> = None;
    let mut tied: Vec<PathBuf> = Vec::new();

    for candidate in candidates {
        let Some(start) = fictrac_log_timestamp(candidate, timezone) else {
            tracing::warn!(
                "Ignoring {}: no parseable start time in its name",
                candidate.display()
            );
            continue;
        };
        let distance = (alignment::epoch_seconds(&start) - reference_epoch).abs();

        match best {
            Some((best_distance, _)) if distance > best_distance => {}
            Some((best_distance, best_path)) if distance == best_distance => {
                if tied.is_empty() {
                    tied.push(best_path.clone());
                }
                tied.push(candidate.clone());
            }
            _ => {
                best = Some((distance, candidate));
                tied.clear();
            }
        }
    }

    if !tied.is_empty() {
        return Err(ConversionError::AmbiguousMatch {
            directory: directory.to_path_buf(),
            pattern: "equally close FicTrac logs".to_string(),
            candidates: tied,
        });
    }

    best.map(|(_, path)| path.clone())
        .ok_or_else(|| ConversionError::NotFound {
            directory: directory.to_path_buf(),
            prefix: "fictrac-YYYYMMDD_HHMMSS".to_string(),
            suffix: FICTRAC_LOG_SUFFIX.to_string(),
        })
}

/// Where the raw files of one `(subject, session)` live
#[derive(Debug, Clone)]
pub struct SessionLayout {
    pub data_dir: PathBuf,
    pub subject_id: String,
    pub session_id: String,
}

impl SessionLayout {
    pub fn new(data_dir: impl Into<PathBuf>, subject_id: &str, session_id: &str) -> Self {
        Self {
            data_dir: data_dir.into(),
            subject_id: subject_id.to_string(),
            session_id: session_id.to_string(),
        }
    }

    pub fn fictrac_dir(&self) -> PathBuf {
        self.data_dir.join(FICTRAC_DIR)
    }

    pub fn subject_dir(&self) -> PathBuf {
        self.data_dir
            .join(IMPORTS_DIR)
            .join(&self.session_id)
            .join(&self.subject_id)
    }

    /// The single `TSeries-*` folder of the functional or anatomical scan
    pub fn imaging_folder(&self, purpose: Purpose) -> Result<PathBuf> {
        let purpose_dir = find_directory_containing(&self.subject_dir(), purpose.folder_marker())?;
        find_item_in_directory(&purpose_dir, TSERIES_PREFIX, "")
    }

    /// The session's FicTrac log. A date session with several logs that day
    /// picks the one starting closest to `reference_epoch`.
    pub fn fictrac_log(&self, reference_epoch: f64, timezone: Tz) -> Result<PathBuf> {
        let directory = self.fictrac_dir();
        let prefix = format!("fictrac-{}", self.session_id);
        let candidates = find_items_in_directory(&directory, &prefix, FICTRAC_LOG_SUFFIX)?;

        if candidates.len() > 1 && is_date_session(&self.session_id) {
            tracing::info!(
                "{} FicTrac logs for {}, matching by start time",
                candidates.len(),
                self.session_id
            );
            return select_closest_log(&directory, &candidates, reference_epoch, timezone);
        }

        find_item_in_directory(&directory, &prefix, FICTRAC_LOG_SUFFIX)
    }

    /// The video recorded alongside a FicTrac log (same stem, `-raw.avi`)
    pub fn video_for_log(&self, fictrac_log: &Path) -> Result<PathBuf> {
        let stem = fictrac_log
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        find_item_in_directory(&self.fictrac_dir(), &stem, VIDEO_SUFFIX)
    }
}
