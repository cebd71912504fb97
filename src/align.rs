//! Nearest-bin timestamp alignment.

/// Returns the element of `bins` nearest to `target`.
///
/// `bins` must be sorted ascending; callers keep the key set sorted and
/// reuse it across lookups rather than re-sorting per call. A target below
/// the first element maps to the first, above the last to the last. Ties
/// between two equidistant bins resolve to the lower one. Returns `None`
/// for an empty slice.
pub fn nearest(bins: &[i64], target: f64) -> Option<i64> {
    let first = *bins.first()?;
    let last = *bins.last()?;

    if target <= first as f64 {
        return Some(first);
    }
    if target >= last as f64 {
        return Some(last);
    }

    // Index of the first bin strictly above the target; the boundary checks
    // above guarantee a straddling pair exists.
    let above_idx = bins.partition_point(|&bin| (bin as f64) <= target);
    let below = bins[above_idx - 1];
    let above = bins[above_idx];

    if target - below as f64 <= above as f64 - target {
        Some(below)
    } else {
        Some(above)
    }
}
