//! Numeric kernels shared by the filter and derivation stages.

use ndarray::Array1;
use ordered_float::OrderedFloat;

/// Maximum over the non-NaN values of `data`, or `None` if every value is NaN
/// (or the slice is empty). Filter predicates use the `None` case to fail a
/// bound explicitly instead of leaning on NaN comparison semantics.
pub fn nan_max(data: impl IntoIterator<Item = f64>) -> Option<f64> {
    data.into_iter()
        .filter(|v| !v.is_nan())
        .fold(None, |acc, v| Some(acc.map_or(v, |m: f64| m.max(v))))
}

/// Mean over the non-NaN values of `data`, or `None` if none exist.
pub fn nan_mean(data: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, count) = data
        .into_iter()
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Centered moving average with the legacy shrinking-window edge rule.
///
/// Interior positions with a full window use the plain `window`-point average.
/// The first `(window-1)/2` positions use expanding means over the first
/// `1, 3, ..., window-2` values; the last positions mirror that rule over the
/// suffix. A constant sequence is a fixed point at every position, edges
/// included.
///
/// `window` must be odd and positive (validated at the pipeline entry).
/// Sequences shorter than `window` cannot populate any full window and yield
/// an all-NaN output of the same length.
pub fn smooth(data: &[f64], window: usize) -> Array1<f64> {
    debug_assert!(window % 2 == 1, "smoothing window must be odd");
    let n = data.len();
    if n < window {
        return Array1::from_elem(n, f64::NAN);
    }
    let half = (window - 1) / 2;
    let mut out = Vec::with_capacity(n);
    for k in 0..half {
        let len = 2 * k + 1;
        out.push(data[..len].iter().sum::<f64>() / len as f64);
    }
    let inv = 1.0 / window as f64;
    for i in half..n - half {
        out.push(data[i - half..=i + half].iter().sum::<f64>() * inv);
    }
    for k in (0..half).rev() {
        let len = 2 * k + 1;
        out.push(data[n - len..].iter().sum::<f64>() / len as f64);
    }
    Array1::from_vec(out)
}

/// Centered rolling median. Positions whose window extends past either end of
/// the sequence, or whose window contains any NaN, are NaN.
pub fn rolling_median(data: &[f64], window: usize) -> Array1<f64> {
    debug_assert!(window % 2 == 1, "rolling median window must be odd");
    let n = data.len();
    let half = window / 2;
    let mut out = Array1::from_elem(n, f64::NAN);
    if n < window {
        return out;
    }
    let mut buf = vec![0.0; window];
    for i in half..n - half {
        let slice = &data[i - half..=i + half];
        if slice.iter().any(|v| v.is_nan()) {
            continue;
        }
        buf.copy_from_slice(slice);
        buf.sort_by_key(|v| OrderedFloat(*v));
        out[i] = buf[half];
    }
    out
}

/// Quantile with linear interpolation between order statistics, ignoring NaN
/// values. Returns NaN when no finite values are present.
pub fn quantile(data: &[f64], q: f64) -> f64 {
    let mut vals: Vec<f64> = data.iter().copied().filter(|v| !v.is_nan()).collect();
    if vals.is_empty() {
        return f64::NAN;
    }
    vals.sort_by_key(|v| OrderedFloat(*v));
    let pos = q.clamp(0.0, 1.0) * (vals.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let frac = pos - lo as f64;
    if lo + 1 < vals.len() {
        vals[lo] + frac * (vals[lo + 1] - vals[lo])
    } else {
        vals[lo]
    }
}
