use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while discovering and reading the raw files of one session
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("No match for '{prefix}*{suffix}' in {}", directory.display())]
    NotFound {
        directory: PathBuf,
        prefix: String,
        suffix: String,
    },

    #[error("Ambiguous match for '{pattern}' in {}: {}", directory.display(), format_candidates(candidates))]
    AmbiguousMatch {
        directory: PathBuf,
        pattern: String,
        candidates: Vec<PathBuf>,
    },

    #[error("Missing <{element}> record with a '{attribute}' attribute in {}", path.display())]
    MissingTimestamp {
        path: PathBuf,
        element: &'static str,
        attribute: &'static str,
    },

    #[error("Unparseable {what}: '{value}'")]
    InvalidTimestamp { what: &'static str, value: String },

    #[error("Cannot derive sampling frequency: {0}")]
    SamplingRate(String),

    #[error("Local time {0} does not exist in the session time zone")]
    NonexistentLocalTime(chrono::NaiveDateTime),

    #[error("Channel '{requested}' not found, available channels: {available:?}")]
    UnknownChannel {
        requested: String,
        available: Vec<String>,
    },

    #[error("Invalid NIfTI file {}: {message}", path.display())]
    Nifti { path: PathBuf, message: String },

    #[error("FicTrac log format error at line {line}: {message}")]
    FicTracFormat { line: usize, message: String },

    #[error("Invalid metadata: {0}")]
    Metadata(String),

    #[error("XML parsing error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("XML attribute error: {0}")]
    XmlAttribute(#[from] quick_xml::events::attributes::AttrError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

fn format_candidates(candidates: &[PathBuf]) -> String {
    candidates
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, ConversionError>;
