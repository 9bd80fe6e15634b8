//! Session timeline
//!
//! The functional green acquisition start is time zero. Every other imaging
//! stream gets `starting_time = epoch(stream start) - epoch(session start)`,
//! computed on time-zone-aware instants. FicTrac and the video share a
//! synthetic uniform timeline at the nominal tracker rate.

use chrono::{DateTime, LocalResult, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ConversionError, Result};
use crate::imaging::{ANATOMICAL_GREEN, ANATOMICAL_RED, FUNCTIONAL_GREEN, FUNCTIONAL_RED, ImagingStream, ImagingStreamSpec};

pub const FICTRAC_NOMINAL_RATE_HZ: f64 = 50.0;
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::America::Los_Angeles;

/// UNIX epoch seconds with sub-second precision
pub fn epoch_seconds<T: TimeZone>(instant: &DateTime<T>) -> f64 {
    instant.timestamp() as f64 + f64::from(instant.timestamp_subsec_nanos()) * 1e-9
}

/// Attach `timezone` to a wall-clock time. Times skipped by a DST jump
/// are rejected; repeated times take the earlier instant.
pub fn localize(naive: NaiveDateTime, timezone: Tz) -> Result<DateTime<Tz>> {
    match timezone.from_local_datetime(&naive) {
        LocalResult::Single(instant) => Ok(instant),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest),
        LocalResult::None => Err(ConversionError::NonexistentLocalTime(naive)),
    }
}

/// `t_i = i * (n / rate) / n` for `i` in `0..n`
pub fn synthetic_timestamps(n: usize, rate: f64) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    let duration = n as f64 / rate;
    let step = duration / n as f64;
    (0..n).map(|i| i as f64 * step).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionStream {
    FunctionalGreen,
    FunctionalRed,
    AnatomicalGreen,
    AnatomicalRed,
    FicTrac,
    Video,
}

impl SessionStream {
    pub const ALL: [SessionStream; 6] = [
        SessionStream::FunctionalGreen,
        SessionStream::FunctionalRed,
        SessionStream::AnatomicalGreen,
        SessionStream::AnatomicalRed,
        SessionStream::FicTrac,
        SessionStream::Video,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStream::FunctionalGreen => "FunctionalGreen",
            SessionStream::FunctionalRed => "FunctionalRed",
            SessionStream::AnatomicalGreen => "AnatomicalGreen",
            SessionStream::AnatomicalRed => "AnatomicalRed",
            SessionStream::FicTrac => "FicTrac",
            SessionStream::Video => "Video",
        }
    }

    pub fn imaging_spec(&self) -> Option<ImagingStreamSpec> {
        match self {
            SessionStream::FunctionalGreen => Some(FUNCTIONAL_GREEN),
            SessionStream::FunctionalRed => Some(FUNCTIONAL_RED),
            SessionStream::AnatomicalGreen => Some(ANATOMICAL_GREEN),
            SessionStream::AnatomicalRed => Some(ANATOMICAL_RED),
            SessionStream::FicTrac | SessionStream::Video => None,
        }
    }

    pub fn from_imaging_spec(spec: &ImagingStreamSpec) -> Self {
        match spec.photon_series_index {
            0 => SessionStream::FunctionalGreen,
            1 => SessionStream::FunctionalRed,
            2 => SessionStream::AnatomicalGreen,
            _ => SessionStream::AnatomicalRed,
        }
    }
}

impl fmt::Display for SessionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Starting-time offset in seconds of each stream relative to the session start
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlignmentOffsets(BTreeMap<SessionStream, f64>);

impl AlignmentOffsets {
    pub fn get(&self, stream: SessionStream) -> Option<f64> {
        self.0.get(&stream).copied()
    }

    pub fn set(&mut self, stream: SessionStream, offset: f64) {
        self.0.insert(stream, offset);
    }

    pub fn iter(&self) -> impl Iterator<Item = (SessionStream, f64)> + '_ {
        self.0.iter().map(|(stream, offset)| (*stream, *offset))
    }
}

/// Everything the writer needs to place streams on one time axis
#[derive(Debug, Clone)]
pub struct SessionTimeline {
    pub timezone: Tz,
    pub session_start: DateTime<Tz>,
    pub offsets: AlignmentOffsets,
    /// Shared by the FicTrac spatial series and the video
    pub behavior_timestamps: Vec<f64>,
}

impl SessionTimeline {
    pub fn session_epoch(&self) -> f64 {
        epoch_seconds(&self.session_start)
    }

    pub fn offset(&self, stream: SessionStream) -> f64 {
        self.offsets.get(stream).unwrap_or(0.0)
    }
}

/// Offsets of `imaging` streams relative to the functional green start,
/// plus the synthetic behavioural timeline for `fictrac_rows` rows
pub fn align_session(
    imaging: &[&ImagingStream],
    fictrac_rows: usize,
    timezone: Tz,
) -> Result<SessionTimeline> {
    let reference = imaging
        .iter()
        .find(|stream| stream.spec == FUNCTIONAL_GREEN)
        .ok_or_else(|| {
            ConversionError::Metadata("functional green stream is required as the session reference".to_string())
        })?;

    let session_start = localize(reference.start_time(), timezone)?;
    let session_epoch = epoch_seconds(&session_start);

    let mut offsets = AlignmentOffsets::default();
    for stream in imaging {
        let key = SessionStream::from_imaging_spec(&stream.spec);
        let offset = if stream.spec == FUNCTIONAL_GREEN {
            0.0
        } else {
            epoch_seconds(&localize(stream.start_time(), timezone)?) - session_epoch
        };
        tracing::info!("{key} starts at {offset:+.3} s");
        offsets.set(key, offset);
    }
    offsets.set(SessionStream::FicTrac, 0.0);
    offsets.set(SessionStream::Video, 0.0);

    Ok(SessionTimeline {
        timezone,
        session_start,
        offsets,
        behavior_timestamps: synthetic_timestamps(fictrac_rows, FICTRAC_NOMINAL_RATE_HZ),
    })
}
