//! Epoch filtering and kinematics derivation for free-vertical fish tracking
//! recordings.
//!
//! The input is a per-frame table covering one recording session, with frames
//! grouped into contiguous tracking epochs. [`analyze_recording`] trims and
//! filters the epochs, derives per-frame kinematics (velocity, step distance,
//! radial displacement, angular velocity and acceleration), scales everything
//! to physical units, and estimates a per-epoch fish body length. Raw file
//! ingestion and output persistence are the caller's concern.

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod pipeline;
mod stats;

pub use pipeline::{group_epochs, EpochSpan};
pub use stats::{nan_max, nan_mean, quantile, rolling_median, smooth};

#[derive(Error, Debug)]
pub enum VfError {
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("failed to parse timestamp from file name: {0}")]
    TimestampParse(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// One captured frame of the raw tracking table.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RawFrame {
    /// Tracking epoch identifier; frames of one epoch are contiguous.
    pub epoch_num: i64,
    /// Elapsed seconds since the start of the recording.
    pub time: f64,
    /// Body centroid, pixels.
    pub abs_x: f64,
    pub abs_y: f64,
    /// Head position, pixels.
    pub abs_head_x: f64,
    pub abs_head_y: f64,
    /// Heading angle.
    pub ang: f64,
    /// Number of detected subjects in the frame; NaN when detection failed.
    pub fish_num: f64,
    /// Captured body length, pixels; NaN when unavailable.
    pub fish_len: f64,
}

/// One analyzed frame of the filtered, scaled output table.
///
/// Lengths and velocities are in mm and mm/s after scaling; `y`, `head_y` and
/// `y_vel` are sign-flipped so that positive means upward. Values that have no
/// defined predecessor (first frame of an epoch, incomplete smoothing windows)
/// are NaN.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Frame {
    /// Row index in the raw input table.
    pub ori_index: usize,
    pub epoch_num: i64,
    pub abs_time: NaiveDateTime,
    /// Elapsed seconds since the start of the recording.
    pub time: f64,
    /// Raw heading angle, carried through unscaled.
    pub ang: f64,
    /// Raw vertical centroid in pixels, carried through unscaled.
    pub abs_y: f64,
    /// Time since the previous frame of the epoch, seconds.
    pub delta_t: f64,
    pub x: f64,
    pub y: f64,
    pub head_x: f64,
    pub head_y: f64,
    pub centered_ang: f64,
    pub x_vel: f64,
    pub y_vel: f64,
    /// Straight-line step length between consecutive frames.
    pub dist: f64,
    /// Signed change in radial distance from the epoch origin.
    pub displ: f64,
    pub ang_vel: f64,
    pub ang_vel_smoothed: f64,
    pub ang_accel: f64,
    pub fish_len: f64,
    pub swim_speed: f64,
    /// Signed radial velocity, `displ / delta_t`.
    pub velocity: f64,
}

/// Per-epoch body length estimate.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FishLength {
    pub epoch_num: i64,
    /// 70th percentile of the epoch's scaled per-frame lengths, mm.
    pub fish_len_est: f64,
}

/// Counts of epochs removed at each filter stage. Filtering itself stays
/// silent; these counts are the only record of what was excluded.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct StageDiagnostics {
    pub epochs_in: usize,
    pub structural_removed: usize,
    pub gap_removed: usize,
    pub direction_removed: usize,
    pub displacement_removed: usize,
    pub ang_vel_removed: usize,
    pub ang_accel_removed: usize,
    pub epochs_out: usize,
}

/// Result of one recording's pipeline run. All epochs being filtered out is a
/// valid outcome: both tables are simply empty.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Analysis {
    pub frames: Vec<Frame>,
    pub fish_lengths: Vec<FishLength>,
    pub diagnostics: StageDiagnostics,
}

/// Pipeline configuration. Defaults match the BlackFly vertical fish rigs.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Params {
    /// Capture frame rate, Hz.
    pub frame_rate_hz: f64,
    /// Minimum epoch duration after edge trimming, seconds.
    pub min_duration_s: f64,
    /// Maximum subject count allowed anywhere in an epoch.
    pub max_fish: f64,
    /// Maximum instantaneous radial displacement, pixels.
    pub max_inst_displ_px: f64,
    /// Maximum smoothed angular velocity magnitude.
    pub max_ang_vel: f64,
    /// Maximum angular acceleration magnitude.
    pub max_ang_accel: f64,
    /// Maximum gap between consecutive frame timestamps, seconds.
    pub max_delta_t_s: f64,
    /// Maximum deviation of step distance from its rolling median, pixels.
    pub max_dist_travel_px: f64,
    /// Frames trimmed from each end of every epoch.
    pub epoch_buf_frames: usize,
    /// Pixels per millimeter.
    pub scale_px_per_mm: f64,
    /// Smoothing window for the angular-velocity plausibility filter; odd.
    pub filter_smooth_window: usize,
    /// Smoothing window for the stored smoothed angular velocity; odd.
    pub ang_vel_smooth_window: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            frame_rate_hz: 40.0,
            min_duration_s: 2.5,
            max_fish: 1.0,
            max_inst_displ_px: 35.0,
            max_ang_vel: 100.0,
            max_ang_accel: 32000.0,
            max_delta_t_s: 0.05,
            max_dist_travel_px: 26.0,
            epoch_buf_frames: 2,
            scale_px_per_mm: 60.0,
            filter_smooth_window: 9,
            ang_vel_smooth_window: 3,
        }
    }
}

impl Params {
    /// Minimum surviving frame count implied by the duration bound.
    pub(crate) fn min_duration_frames(&self) -> f64 {
        self.min_duration_s * self.frame_rate_hz
    }

    fn validate(&self) -> Result<(), VfError> {
        if !(self.frame_rate_hz > 0.0) {
            return Err(VfError::InvalidParameter(format!(
                "frame_rate_hz must be positive, got {}",
                self.frame_rate_hz
            )));
        }
        if !(self.scale_px_per_mm > 0.0) {
            return Err(VfError::InvalidParameter(format!(
                "scale_px_per_mm must be positive, got {}",
                self.scale_px_per_mm
            )));
        }
        for (name, window) in [
            ("filter_smooth_window", self.filter_smooth_window),
            ("ang_vel_smooth_window", self.ang_vel_smooth_window),
        ] {
            if window == 0 || window % 2 == 0 {
                return Err(VfError::InvalidParameter(format!(
                    "{name} must be a positive odd number, got {window}"
                )));
            }
        }
        Ok(())
    }
}

/// Parse the recording start timestamp embedded in the source file name.
///
/// The stamp occupies the fixed-width slice just before the 4-character
/// extension, e.g. `..._200528 14.30.15.dlm`, formatted `%y%m%d %H.%M.%S`.
/// Anything that does not match is a hard failure; no timestamp is guessed.
pub fn parse_start_time(file_name: &str) -> Result<NaiveDateTime, VfError> {
    let stamp = file_name
        .len()
        .checked_sub(19)
        .and_then(|start| file_name.get(start..file_name.len() - 4))
        .ok_or_else(|| {
            VfError::TimestampParse(format!("file name too short for a timestamp: {file_name}"))
        })?;
    NaiveDateTime::parse_from_str(stamp, "%y%m%d %H.%M.%S")
        .map_err(|e| VfError::TimestampParse(format!("{file_name}: {e}")))
}

/// Run the full epoch-filtering and kinematics pipeline over one recording.
///
/// `raw` is the complete per-frame table for the session, in capture order.
/// `file_name` supplies the recording start timestamp (see
/// [`parse_start_time`]). Returns the filtered, scaled per-frame table, the
/// per-epoch fish-length table, and the per-stage removal counts.
pub fn analyze_recording(
    raw: &[RawFrame],
    file_name: &str,
    params: &Params,
) -> Result<Analysis, VfError> {
    params.validate()?;
    let start_time = parse_start_time(file_name)?;
    for (i, frame) in raw.iter().enumerate() {
        for (name, value) in [
            ("time", frame.time),
            ("abs_x", frame.abs_x),
            ("abs_y", frame.abs_y),
            ("abs_head_x", frame.abs_head_x),
            ("abs_head_y", frame.abs_head_y),
            ("ang", frame.ang),
        ] {
            if !value.is_finite() {
                return Err(VfError::MalformedInput(format!(
                    "non-finite {name} at row {i}"
                )));
            }
        }
    }
    pipeline::run(raw, start_time, params)
}

pub(crate) fn frame_time_offset(seconds: f64) -> Duration {
    Duration::nanoseconds((seconds * 1e9).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn parses_timestamp_from_file_name() {
        let t = parse_start_time("free_vertical_07dpf_200528 14.30.15.dlm").unwrap();
        let expected = NaiveDate::from_ymd_opt(2020, 5, 28)
            .unwrap()
            .and_hms_opt(14, 30, 15)
            .unwrap();
        assert_eq!(t, expected);
    }

    #[test]
    fn rejects_short_or_mismatched_file_names() {
        assert!(matches!(
            parse_start_time("tiny.dlm"),
            Err(VfError::TimestampParse(_))
        ));
        assert!(matches!(
            parse_start_time("fish_20xx28 14.3x.15.dlm"),
            Err(VfError::TimestampParse(_))
        ));
    }

    #[test]
    fn rejects_even_smoothing_window() {
        let params = Params {
            filter_smooth_window: 8,
            ..Params::default()
        };
        let err = analyze_recording(&[], "x_200528 14.30.15.dlm", &params).unwrap_err();
        assert!(matches!(err, VfError::InvalidParameter(_)));
    }

    #[test]
    fn rejects_non_finite_time() {
        let frame = RawFrame {
            epoch_num: 1,
            time: f64::NAN,
            abs_x: 0.0,
            abs_y: 0.0,
            abs_head_x: 0.0,
            abs_head_y: 0.0,
            ang: 0.0,
            fish_num: 1.0,
            fish_len: 100.0,
        };
        let err =
            analyze_recording(&[frame], "x_200528 14.30.15.dlm", &Params::default()).unwrap_err();
        assert!(matches!(err, VfError::MalformedInput(_)));
    }

    #[test]
    fn empty_input_yields_empty_analysis() {
        let out = analyze_recording(&[], "x_200528 14.30.15.dlm", &Params::default()).unwrap();
        assert!(out.frames.is_empty());
        assert!(out.fish_lengths.is_empty());
        assert_eq!(out.diagnostics.epochs_in, 0);
        assert_eq!(out.diagnostics.epochs_out, 0);
    }
}
