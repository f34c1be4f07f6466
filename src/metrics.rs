//! Small statistical helpers shared by the ambient CLI shell's text-output
//! mode. Percentile-grade summaries for the saved report live in `stats.rs`;
//! these are the cheap mean/median/quartile figures printed live as a
//! session runs.

fn percentile_sorted(sorted: &[f64], pct: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = pct * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] + (sorted[hi] - sorted[lo]) * frac
    }
}

/// Mean, median, p25, p75 over a flat sample set (e.g. round-trip times).
pub fn compute_latency_metrics(samples: &[f64]) -> Option<(f64, f64, f64, f64)> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
    Some((
        mean,
        percentile_sorted(&sorted, 0.50),
        percentile_sorted(&sorted, 0.25),
        percentile_sorted(&sorted, 0.75),
    ))
}

/// Mean, median, p25, p75 over a series of `(elapsed_seconds, mbps)` points.
pub fn compute_throughput_metrics(points: &[(f64, f64)]) -> Option<(f64, f64, f64, f64)> {
    if points.is_empty() {
        return None;
    }
    let values: Vec<f64> = points.iter().map(|(_, v)| *v).collect();
    compute_latency_metrics(&values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_none() {
        assert!(compute_latency_metrics(&[]).is_none());
        assert!(compute_throughput_metrics(&[]).is_none());
    }

    #[test]
    fn single_value_returns_itself_everywhere() {
        let (mean, median, p25, p75) = compute_latency_metrics(&[42.0]).unwrap();
        assert_eq!(mean, 42.0);
        assert_eq!(median, 42.0);
        assert_eq!(p25, 42.0);
        assert_eq!(p75, 42.0);
    }

    #[test]
    fn quartiles_over_evenly_spaced_values() {
        let samples = vec![10.0, 20.0, 30.0, 40.0, 50.0];
        let (mean, median, p25, p75) = compute_latency_metrics(&samples).unwrap();
        assert_eq!(mean, 30.0);
        assert_eq!(median, 30.0);
        assert_eq!(p25, 20.0);
        assert_eq!(p75, 40.0);
    }
}
