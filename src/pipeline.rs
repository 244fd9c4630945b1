//! The epoch-filtering and kinematics-derivation pipeline.
//!
//! Each stage consumes the surviving epochs of the previous stage and never
//! reconsiders an excluded epoch. Filters are predicates over whole epochs;
//! removal is silent apart from the stage counters and trace events.

use std::collections::HashSet;
use std::ops::Range;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::stats::{nan_max, nan_mean, quantile, rolling_median, smooth};
use crate::{
    frame_time_offset, Analysis, FishLength, Frame, Params, RawFrame, StageDiagnostics, VfError,
};

/// A maximal contiguous run of frames sharing one epoch identifier, as a range
/// of row indices into the raw table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochSpan {
    pub epoch_num: i64,
    pub range: Range<usize>,
}

/// Partition the raw table into epochs, preserving first-occurrence epoch
/// order and the original frame order within each epoch.
///
/// An epoch identifier reappearing after a different epoch has started
/// violates the contiguity invariant and is rejected as malformed input.
pub fn group_epochs(raw: &[RawFrame]) -> Result<Vec<EpochSpan>, VfError> {
    let mut spans: Vec<EpochSpan> = Vec::new();
    let mut seen = HashSet::new();
    for (i, frame) in raw.iter().enumerate() {
        match spans.last_mut() {
            Some(span) if span.epoch_num == frame.epoch_num => span.range.end = i + 1,
            _ => {
                if !seen.insert(frame.epoch_num) {
                    return Err(VfError::MalformedInput(format!(
                        "epoch {} reappears non-contiguously at row {i}",
                        frame.epoch_num
                    )));
                }
                spans.push(EpochSpan {
                    epoch_num: frame.epoch_num,
                    range: i..i + 1,
                });
            }
        }
    }
    Ok(spans)
}

struct Epoch {
    num: i64,
    frames: Vec<Frame>,
}

pub(crate) fn run(
    raw: &[RawFrame],
    start_time: NaiveDateTime,
    params: &Params,
) -> Result<Analysis, VfError> {
    let mut diag = StageDiagnostics::default();
    let spans = group_epochs(raw)?;
    diag.epochs_in = spans.len();
    debug!(epochs = diag.epochs_in, "grouped epochs");

    let kept = structural_filter(raw, spans, params, &mut diag);
    debug!(removed = diag.structural_removed, "structural filter");

    let mut epochs = init_frames(raw, &kept, start_time);
    timing_direction_filter(&mut epochs, params, &mut diag);
    debug!(
        gap = diag.gap_removed,
        direction = diag.direction_removed,
        "orientation/timing filter"
    );

    derive_kinematics(&mut epochs, params);
    plausibility_filter(&mut epochs, params, &mut diag);
    debug!(
        displacement = diag.displacement_removed,
        ang_vel = diag.ang_vel_removed,
        ang_accel = diag.ang_accel_removed,
        "plausibility filter"
    );

    diag.epochs_out = epochs.len();
    let (frames, fish_lengths) = scale_and_summarize(epochs, raw, params);
    info!(
        epochs = diag.epochs_out,
        frames = frames.len(),
        "recording analyzed"
    );
    Ok(Analysis {
        frames,
        fish_lengths,
        diagnostics: diag,
    })
}

/// Trim the buffer frames from both ends of every epoch, then drop epochs that
/// are too short or were ever tracked with more than the allowed subject
/// count. An all-NaN subject count cannot be verified and also drops.
fn structural_filter(
    raw: &[RawFrame],
    spans: Vec<EpochSpan>,
    params: &Params,
    diag: &mut StageDiagnostics,
) -> Vec<EpochSpan> {
    let before = spans.len();
    let min_frames = params.min_duration_frames();
    let kept: Vec<EpochSpan> = spans
        .into_iter()
        .filter_map(|span| {
            let start = span.range.start + params.epoch_buf_frames;
            let end = span.range.end.saturating_sub(params.epoch_buf_frames);
            if start >= end || ((end - start) as f64) < min_frames {
                return None;
            }
            let single_subject = nan_max(raw[start..end].iter().map(|f| f.fish_num))
                .is_some_and(|m| m <= params.max_fish);
            single_subject.then(|| EpochSpan {
                epoch_num: span.epoch_num,
                range: start..end,
            })
        })
        .collect();
    diag.structural_removed = before - kept.len();
    kept
}

/// Kinematics stage 1: per-frame time deltas, absolute timestamps, and
/// coordinates re-centered on each epoch's first surviving frame.
fn init_frames(raw: &[RawFrame], spans: &[EpochSpan], start_time: NaiveDateTime) -> Vec<Epoch> {
    spans
        .iter()
        .map(|span| {
            let origin = raw[span.range.start];
            let frames = span
                .range
                .clone()
                .map(|i| {
                    let r = raw[i];
                    let delta_t = if i == span.range.start {
                        f64::NAN
                    } else {
                        r.time - raw[i - 1].time
                    };
                    Frame {
                        ori_index: i,
                        epoch_num: span.epoch_num,
                        abs_time: start_time + frame_time_offset(r.time),
                        time: r.time,
                        ang: r.ang,
                        abs_y: r.abs_y,
                        delta_t,
                        x: r.abs_x - origin.abs_x,
                        y: r.abs_y - origin.abs_y,
                        head_x: r.abs_head_x - origin.abs_head_x,
                        head_y: r.abs_head_y - origin.abs_head_y,
                        centered_ang: r.ang - origin.ang,
                        x_vel: f64::NAN,
                        y_vel: f64::NAN,
                        dist: f64::NAN,
                        displ: f64::NAN,
                        ang_vel: f64::NAN,
                        ang_vel_smoothed: f64::NAN,
                        ang_accel: f64::NAN,
                        fish_len: f64::NAN,
                        swim_speed: f64::NAN,
                        velocity: f64::NAN,
                    }
                })
                .collect();
            Epoch {
                num: span.epoch_num,
                frames,
            }
        })
        .collect()
}

/// Drop epochs with frame-capture dropouts (an inter-frame gap above the
/// bound), then epochs whose average facing direction disagrees with the sign
/// of the net horizontal travel, which indicates a tracking identity swap.
fn timing_direction_filter(epochs: &mut Vec<Epoch>, params: &Params, diag: &mut StageDiagnostics) {
    let before = epochs.len();
    epochs.retain(|e| {
        nan_max(e.frames.iter().map(|f| f.delta_t)).is_some_and(|m| m <= params.max_delta_t_s)
    });
    diag.gap_removed = before - epochs.len();

    let before = epochs.len();
    epochs.retain(|e| {
        let head_bias = nan_mean(e.frames.iter().map(|f| f.head_x));
        let body_mean = nan_mean(e.frames.iter().map(|f| f.x));
        match (head_bias, body_mean, e.frames.last()) {
            (Some(head), Some(body), Some(last)) => (head - body) * last.x >= 0.0,
            _ => false,
        }
    });
    diag.direction_removed = before - epochs.len();
}

/// Kinematics stage 2: velocities, step distance, radial displacement, angular
/// velocity and its smoothed copy, and angular acceleration, all resetting at
/// epoch boundaries. Angular acceleration differentiates the raw angular
/// velocity, not the smoothed one.
fn derive_kinematics(epochs: &mut [Epoch], params: &Params) {
    for epoch in epochs.iter_mut() {
        let n = epoch.frames.len();
        let radial: Vec<f64> = epoch.frames.iter().map(|f| f.x.hypot(f.y)).collect();
        for i in 1..n {
            let prev = epoch.frames[i - 1];
            let f = &mut epoch.frames[i];
            let dx = f.x - prev.x;
            let dy = f.y - prev.y;
            f.x_vel = dx / f.delta_t;
            f.y_vel = dy / f.delta_t;
            f.dist = dx.hypot(dy);
            f.displ = radial[i] - radial[i - 1];
            f.ang_vel = (f.ang - prev.ang) / f.delta_t;
        }
        let ang_vel: Vec<f64> = epoch.frames.iter().map(|f| f.ang_vel).collect();
        for i in 1..n {
            epoch.frames[i].ang_accel = (ang_vel[i] - ang_vel[i - 1]) / epoch.frames[i].delta_t;
        }
        // The first frame's angular velocity is undefined and excluded before
        // smoothing; its slot stays NaN.
        if n > 1 {
            let smoothed = smooth(&ang_vel[1..], params.ang_vel_smooth_window);
            for (f, v) in epoch.frames[1..].iter_mut().zip(smoothed.iter()) {
                f.ang_vel_smoothed = *v;
            }
        }
    }
}

/// Kinematic-bound predicates, short-circuiting in order: instantaneous
/// displacement and distance-travel anomaly, smoothed angular velocity,
/// angular acceleration. Every maximum is NaN-aware; an epoch whose predicate
/// column holds no defined value fails the bound.
fn plausibility_filter(epochs: &mut Vec<Epoch>, params: &Params, diag: &mut StageDiagnostics) {
    let before = epochs.len();
    epochs.retain(|e| displacement_ok(e, params));
    diag.displacement_removed = before - epochs.len();

    let before = epochs.len();
    epochs.retain(|e| {
        let ang_vel: Vec<f64> = e.frames.iter().skip(1).map(|f| f.ang_vel).collect();
        let smoothed = smooth(&ang_vel, params.filter_smooth_window);
        nan_max(smoothed.iter().map(|v| v.abs())).is_some_and(|m| m <= params.max_ang_vel)
    });
    diag.ang_vel_removed = before - epochs.len();

    let before = epochs.len();
    epochs.retain(|e| {
        nan_max(e.frames.iter().map(|f| f.ang_accel.abs()))
            .is_some_and(|m| m <= params.max_ang_accel)
    });
    diag.ang_accel_removed = before - epochs.len();
}

fn displacement_ok(epoch: &Epoch, params: &Params) -> bool {
    let displ_ok = nan_max(epoch.frames.iter().map(|f| f.displ.abs()))
        .is_some_and(|m| m <= params.max_inst_displ_px);
    if !displ_ok {
        return false;
    }
    // Sudden single-frame jumps show up as step distances far from the local
    // rolling median; the median is undefined at the two epoch edges.
    let dist: Vec<f64> = epoch.frames.iter().map(|f| f.dist).collect();
    let median = rolling_median(&dist, 3);
    nan_max(dist.iter().zip(median.iter()).map(|(d, m)| (d - m).abs()))
        .is_some_and(|m| m < params.max_dist_travel_px)
}

/// Convert pixel columns to millimeters (flipping the y axis so positive is
/// upward), derive swim speed and radial velocity, pull per-frame body lengths
/// from the raw table by original row index, and estimate one body length per
/// epoch as the 70th percentile of its scaled lengths.
fn scale_and_summarize(
    epochs: Vec<Epoch>,
    raw: &[RawFrame],
    params: &Params,
) -> (Vec<Frame>, Vec<FishLength>) {
    let scale = params.scale_px_per_mm;
    let mut frames = Vec::new();
    let mut fish_lengths = Vec::with_capacity(epochs.len());
    for mut epoch in epochs {
        for f in &mut epoch.frames {
            f.fish_len = raw[f.ori_index].fish_len / scale;
            f.x /= scale;
            f.head_x /= scale;
            f.x_vel /= scale;
            f.displ /= scale;
            f.dist /= scale;
            f.y *= -1.0 / scale;
            f.head_y *= -1.0 / scale;
            f.y_vel *= -1.0 / scale;
            f.swim_speed = f.dist / f.delta_t;
            f.velocity = f.displ / f.delta_t;
        }
        let lens: Vec<f64> = epoch.frames.iter().map(|f| f.fish_len).collect();
        fish_lengths.push(FishLength {
            epoch_num: epoch.num,
            fish_len_est: quantile(&lens, 0.7),
        });
        frames.extend(epoch.frames);
    }
    (frames, fish_lengths)
}
