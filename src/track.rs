use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use geo::Point;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::TrackError;

/// WGS84 coordinate, latitude first like the GPX and matcher formats.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// geo uses x = longitude, y = latitude
    pub fn to_point(self) -> Point<f64> {
        Point::new(self.lon, self.lat)
    }
}

/// A recorded GPS trace.
///
/// Samples and timestamps are parallel and always of equal length. Only the
/// matched points change after construction, once per successful match.
#[derive(Debug, Clone)]
pub struct GpsTrack {
    name: String,
    points: Vec<LatLon>,
    timestamps: Vec<DateTime<Utc>>,
    track_type: Option<String>,
    date: Option<DateTime<Utc>>,
    filepath: Option<PathBuf>,
    matched_points: Option<Vec<LatLon>>,
}

impl GpsTrack {
    pub fn new(
        name: impl Into<String>,
        points: Vec<LatLon>,
        timestamps: Vec<DateTime<Utc>>,
        track_type: Option<String>,
        date: Option<DateTime<Utc>>,
    ) -> Result<Self, TrackError> {
        let name = name.into();
        if points.len() != timestamps.len() {
            return Err(TrackError::LengthMismatch {
                name,
                points: points.len(),
                timestamps: timestamps.len(),
            });
        }

        Ok(Self {
            name,
            points,
            timestamps,
            track_type,
            date,
            filepath: None,
            matched_points: None,
        })
    }

    pub fn with_filepath(mut self, path: impl Into<PathBuf>) -> Self {
        self.filepath = Some(path.into());
        self
    }

    /// Parse a GPX file. Track points without a timestamp are skipped.
    pub fn from_gpx(path: &Path) -> Result<Self, TrackError> {
        let file = File::open(path).map_err(|source| TrackError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let fallback_name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown");

        Ok(Self::from_gpx_reader(BufReader::new(file), path, fallback_name)?.with_filepath(path))
    }

    fn from_gpx_reader<R: Read>(
        reader: R,
        path: &Path,
        fallback_name: &str,
    ) -> Result<Self, TrackError> {
        let gpx_error = |message: String| TrackError::Gpx {
            path: path.to_path_buf(),
            message,
        };
        let parse_time = |time: &gpx::Time| -> Result<DateTime<Utc>, TrackError> {
            let iso = time.format().map_err(|e| gpx_error(e.to_string()))?;
            Ok(DateTime::parse_from_rfc3339(&iso)
                .map_err(|e| gpx_error(e.to_string()))?
                .with_timezone(&Utc))
        };

        let gpx = gpx::read(reader).map_err(|e| gpx_error(e.to_string()))?;

        let first_track = gpx.tracks.first();
        let name = first_track
            .and_then(|t| t.name.clone())
            .or_else(|| gpx.metadata.as_ref().and_then(|m| m.name.clone()))
            .unwrap_or_else(|| fallback_name.to_string());
        let track_type = first_track.and_then(|t| t.type_.clone());

        let mut points = Vec::new();
        let mut timestamps = Vec::new();
        let mut untimed = 0;
        for waypoint in gpx
            .tracks
            .iter()
            .flat_map(|t| &t.segments)
            .flat_map(|s| &s.points)
        {
            let Some(time) = &waypoint.time else {
                untimed += 1;
                continue;
            };
            let point = waypoint.point();
            points.push(LatLon::new(point.y(), point.x()));
            timestamps.push(parse_time(time)?);
        }
        if untimed > 0 {
            warn!(
                "{}: skipped {} track points without timestamp",
                path.display(),
                untimed
            );
        }

        let date = match gpx.metadata.as_ref().and_then(|m| m.time.as_ref()) {
            Some(time) => Some(parse_time(time)?),
            None => timestamps.first().copied(),
        };

        Self::new(name, points, timestamps, track_type, date)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn points(&self) -> &[LatLon] {
        &self.points
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn track_type(&self) -> Option<&str> {
        self.track_type.as_deref()
    }

    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.date
    }

    pub fn filepath(&self) -> Option<&Path> {
        self.filepath.as_deref()
    }

    pub fn matched_points(&self) -> Option<&[LatLon]> {
        self.matched_points.as_deref()
    }

    pub(crate) fn record_matched_points(&mut self, points: Vec<LatLon>) {
        self.matched_points = Some(points);
    }

    /// File path if known, else the track name. Used in log lines.
    pub fn label(&self) -> String {
        match self.filepath() {
            Some(path) => format!("{} - '{}'", path.display(), self.name),
            None => format!("'{}'", self.name),
        }
    }
}

impl fmt::Display for GpsTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpsTrack(name={}, date={}, type={}, points={} points)",
            self.name,
            self.date
                .map(|d| d.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
            self.track_type.as_deref().unwrap_or("-"),
            self.points.len()
        )
    }
}

/// Which parsed tracks take part in a run
#[derive(Debug, Clone, Default)]
pub struct TrackFilter {
    /// Keep only tracks with exactly this name
    pub name: Option<String>,
    /// Keep only tracks recorded at or after this instant
    pub not_before: Option<DateTime<Utc>>,
}

impl TrackFilter {
    fn rejection(&self, track: &GpsTrack) -> Option<String> {
        if let Some(name) = &self.name {
            if track.name() != name {
                return Some(format!("is not called '{}'", name));
            }
        }
        if track.points().is_empty() {
            return Some("has no points".to_string());
        }
        if let Some(not_before) = self.not_before {
            match track.date() {
                Some(date) if date < not_before => {
                    return Some(format!("earlier than {}", not_before));
                }
                None => return Some("has no recording date".to_string()),
                _ => {}
            }
        }
        None
    }
}

/// Parse every `*.gpx` file in `dir` and keep the tracks accepted by `filter`.
///
/// Files that fail to parse are logged and skipped.
pub fn load_tracks(dir: &Path, filter: &TrackFilter) -> Result<Vec<GpsTrack>, TrackError> {
    let io_error = |source| TrackError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error)? {
        let path = entry.map_err(io_error)?.path();
        if path.extension().is_some_and(|ext| ext == "gpx") {
            files.push(path);
        }
    }
    files.sort();
    info!("Found {} gpx files in {}", files.len(), dir.display());

    let parsed: Vec<_> = files.par_iter().map(|path| GpsTrack::from_gpx(path)).collect();

    let mut tracks = Vec::new();
    for result in parsed {
        match result {
            Ok(track) => match filter.rejection(&track) {
                Some(reason) => info!("Track {} {}, ignoring", track.label(), reason),
                None => {
                    debug!("Loaded {}", track);
                    tracks.push(track);
                }
            },
            Err(e) => warn!("{}", e),
        }
    }

    Ok(tracks)
}
