use std::collections::HashMap;

use crate::types::PeriodId;

/// Aggregate skew metrics for per-period record counts.
#[derive(Clone, Debug, PartialEq)]
pub struct PeriodSkew {
    pub total: usize,
    pub periods: usize,
    pub min: usize,
    pub max: usize,
    pub mean: f64,
    pub max_share: f64,
    pub min_share: f64,
    pub ratio: f64,
    pub per_period: Vec<PeriodShare>,
}

/// Per-period share of the canonical dataset for skew inspection.
#[derive(Clone, Debug, PartialEq)]
pub struct PeriodShare {
    pub period: PeriodId,
    pub count: usize,
    pub share: f64,
}

/// Compute skew metrics from per-period record counts, as reported by the
/// load pipeline's period distribution.
pub fn period_skew(counts: &HashMap<PeriodId, usize>) -> Option<PeriodSkew> {
    if counts.is_empty() {
        return None;
    }
    let total: usize = counts.values().sum();
    let periods = counts.len();
    let min = *counts.values().min().expect("counts non-empty");
    let max = *counts.values().max().expect("counts non-empty");
    let mean = total as f64 / periods as f64;
    let max_share = if total == 0 {
        0.0
    } else {
        max as f64 / total as f64
    };
    let min_share = if total == 0 {
        0.0
    } else {
        min as f64 / total as f64
    };
    let ratio = if min == 0 {
        f64::INFINITY
    } else {
        max as f64 / min as f64
    };
    let mut per_period: Vec<PeriodShare> = counts
        .iter()
        .map(|(period, count)| PeriodShare {
            period: period.clone(),
            count: *count,
            share: if total == 0 {
                0.0
            } else {
                *count as f64 / total as f64
            },
        })
        .collect();
    per_period.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.period.cmp(&b.period)));
    Some(PeriodSkew {
        total,
        periods,
        min,
        max,
        mean,
        max_share,
        min_share,
        ratio,
        per_period,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_skew_reports_balance() {
        let mut counts = HashMap::new();
        counts.insert("2023".to_string(), 2);
        counts.insert("2024".to_string(), 2);
        let skew = period_skew(&counts).expect("skew");
        assert_eq!(skew.total, 4);
        assert_eq!(skew.periods, 2);
        assert_eq!(skew.min, 2);
        assert_eq!(skew.max, 2);
        assert!((skew.max_share - 0.5).abs() < 1e-6);
        assert!((skew.ratio - 1.0).abs() < 1e-6);
        assert!(
            skew.per_period
                .iter()
                .all(|entry| (entry.share - 0.5).abs() < 1e-6)
        );
    }

    #[test]
    fn period_skew_reports_imbalance() {
        let mut counts = HashMap::new();
        counts.insert("2022".to_string(), 4);
        counts.insert("2023".to_string(), 2);
        counts.insert("2024".to_string(), 2);
        let skew = period_skew(&counts).expect("skew");
        assert_eq!(skew.total, 8);
        assert_eq!(skew.periods, 3);
        assert!((skew.max_share - 0.5).abs() < 1e-6);
        assert!((skew.ratio - 2.0).abs() < 1e-6);
        assert_eq!(skew.per_period[0].period, "2022");
        assert_eq!(skew.per_period[0].count, 4);
    }

    #[test]
    fn empty_counts_yield_no_skew() {
        assert!(period_skew(&HashMap::new()).is_none());
    }
}
