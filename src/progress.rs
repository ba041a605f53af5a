/// Percentage reported after forcing `current_step` of `total_steps`.
///
/// Steps 0 through 3 map to fixed buckets regardless of `total_steps`, so short
/// runs (three steps or fewer) never report 100 here and longer runs can dip
/// after step 3. Callers that need a non-decreasing value must clamp against
/// what they already published.
pub fn progress(current_step: usize, total_steps: usize) -> u8 {
    match current_step {
        0 => 0,
        1 => 25,
        2 => 50,
        3 => 75,
        _ if current_step == total_steps => 100,
        _ if total_steps == 0 => 100,
        _ => {
            let pct = (current_step as f64 / total_steps as f64 * 100.0).round();
            pct.min(100.0) as u8
        }
    }
}

#[cfg(test)]
mod tests {
    use super::progress;

    #[test]
    fn fixed_buckets_for_first_steps() {
        for total in [4, 10, 50] {
            assert_eq!(progress(0, total), 0);
            assert_eq!(progress(1, total), 25);
            assert_eq!(progress(2, total), 50);
            assert_eq!(progress(3, total), 75);
            assert_eq!(progress(total, total), 100);
        }
    }

    #[test]
    fn proportional_after_bucket_range() {
        assert_eq!(progress(5, 10), 50);
        assert_eq!(progress(7, 9), 78);
        assert_eq!(progress(49, 50), 98);
    }

    #[test]
    fn overshoot_is_capped() {
        assert_eq!(progress(12, 10), 100);
    }

    #[test]
    fn short_runs_keep_bucket_values() {
        // Buckets win over the completion row for totals of three or fewer.
        assert_eq!(
            (1..=1).map(|s| progress(s, 1)).collect::<Vec<_>>(),
            vec![25]
        );
        assert_eq!(
            (1..=2).map(|s| progress(s, 2)).collect::<Vec<_>>(),
            vec![25, 50]
        );
        assert_eq!(
            (1..=3).map(|s| progress(s, 3)).collect::<Vec<_>>(),
            vec![25, 50, 75]
        );
    }

    #[test]
    fn long_runs_dip_after_step_three() {
        assert_eq!(progress(3, 8), 75);
        assert_eq!(progress(4, 8), 50);
    }
}
