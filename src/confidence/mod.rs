// Confidence estimation
// A heuristic derived from retrieval distances, not a calibrated probability


use crate::index::{DistanceMetric, SearchResult};

/// Confidence for an answer built from `used_results`.
///
/// Only defined for metrics with a normalized distance range. Returns
/// `Some(0.0)` when nothing was used, and `None` when the metric gives no
/// principled way to map distances into `[0, 1]`.
#[inline]
pub fn estimate(used_results: &[SearchResult], metric: DistanceMetric) -> Option<f32> {
    metric.normalized_range()?;
    if used_results.is_empty() {
        return Some(0.0);
    }

    let mean = used_results.iter().map(|r| r.distance).sum::<f32>() / used_results.len() as f32;
    metric.relevance(mean)
}
