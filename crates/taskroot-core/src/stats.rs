//! Runtime statistics helpers shared by the store and exporters.

use crate::models::TaskStats;

/// Nearest-rank percentile over an ascending slice.
///
/// `rank = ceil(p / 100 * n)`, value taken at index `rank - 1`. Returns
/// `None` for an empty slice.
pub fn nearest_rank(sorted: &[f64], percentile: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = ((percentile / 100.0) * n as f64).ceil() as usize;
    let index = rank.clamp(1, n) - 1;
    Some(sorted[index])
}

/// Summarize a set of runtimes. Input order does not matter.
pub fn summarize_runtimes(mut runtimes: Vec<f64>) -> TaskStats {
    runtimes.retain(|r| r.is_finite());
    if runtimes.is_empty() {
        return TaskStats::default();
    }
    runtimes.sort_by(|a, b| a.total_cmp(b));

    let count = runtimes.len();
    let sum: f64 = runtimes.iter().sum();
    TaskStats {
        count: count as i64,
        min_runtime: runtimes.first().copied(),
        max_runtime: runtimes.last().copied(),
        avg_runtime: Some(sum / count as f64),
        p95: nearest_rank(&runtimes, 95.0),
        p99: nearest_rank(&runtimes, 99.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_rank_small_sets() {
        assert_eq!(nearest_rank(&[], 95.0), None);
        assert_eq!(nearest_rank(&[1.5], 95.0), Some(1.5));
        assert_eq!(nearest_rank(&[1.0, 2.0], 50.0), Some(1.0));
        assert_eq!(nearest_rank(&[1.0, 2.0], 51.0), Some(2.0));
    }

    #[test]
    fn test_nearest_rank_hundred() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(nearest_rank(&values, 95.0), Some(95.0));
        assert_eq!(nearest_rank(&values, 99.0), Some(99.0));
        assert_eq!(nearest_rank(&values, 100.0), Some(100.0));
        assert_eq!(nearest_rank(&values, 0.0), Some(1.0));
    }

    #[test]
    fn test_summarize_runtimes() {
        let stats = summarize_runtimes(vec![3.0, 1.0, 2.0]);
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min_runtime, Some(1.0));
        assert_eq!(stats.max_runtime, Some(3.0));
        assert_eq!(stats.avg_runtime, Some(2.0));
        assert_eq!(stats.p95, Some(3.0));
    }

    #[test]
    fn test_summarize_empty() {
        let stats = summarize_runtimes(Vec::new());
        assert_eq!(stats, TaskStats::default());
        assert_eq!(stats.count, 0);
    }
}
