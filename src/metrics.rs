/// Compute summary metrics (mean, median, 25th percentile, 75th percentile) from samples.
pub fn compute_metrics(samples: &[f64]) -> Option<(f64, f64, f64, f64)> {
    if samples.len() < 2 {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    let mean = samples.iter().sum::<f64>() / n as f64;
    let median = sorted[n / 2];
    let p25 = sorted[n / 4];
    let p75 = sorted[3 * n / 4];
    Some((mean, median, p25, p75))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_two_samples() {
        assert_eq!(compute_metrics(&[]), None);
        assert_eq!(compute_metrics(&[1.0]), None);
    }

    #[test]
    fn test_quartiles() {
        let samples = [4.0, 1.0, 3.0, 2.0];
        assert_eq!(compute_metrics(&samples), Some((2.5, 3.0, 2.0, 4.0)));
    }
}
