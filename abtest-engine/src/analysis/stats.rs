//! Descriptive statistics and the pooled two-sample t-test.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

/// Summary of one variant's metric values.
///
/// Every statistic is `None` for an empty sample; variance and standard
/// deviation are also `None` below two observations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptiveStats {
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub std_dev: Option<f64>,
    pub variance: Option<f64>,
    pub count: usize,
}

impl DescriptiveStats {
    pub fn from_values(values: &[f64]) -> Self {
        let count = values.len();
        if count == 0 {
            return Self::default();
        }

        let n = count as f64;
        let mean = values.iter().sum::<f64>() / n;

        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let mid = count / 2;
        let median = if count % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        // Sample variance (n - 1 denominator)
        let variance = (count >= 2).then(|| {
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
        });

        Self {
            mean: Some(mean),
            median: Some(median),
            min: sorted.first().copied(),
            max: sorted.last().copied(),
            std_dev: variance.map(f64::sqrt),
            variance,
            count,
        }
    }
}

/// Result of comparing a variant against the control
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TTest {
    pub t_value: f64,
    pub degrees_of_freedom: f64,
    pub p_value: f64,
}

/// Pooled-variance t-test of `control` against `variant`.
///
/// `t = (mean_control - mean_variant) / se`. The p-value is
/// `1 - CDF(|t|, df)`, i.e. one tail evaluated on |t|; a conventional
/// two-tailed p would be twice this. Returns `None` when either side has
/// fewer than two observations or the standard error is zero.
pub fn pooled_t_test(control: &DescriptiveStats, variant: &DescriptiveStats) -> Option<TTest> {
    if control.count < 2 || variant.count < 2 {
        return None;
    }
    let (mean_c, var_c) = (control.mean?, control.variance?);
    let (mean_v, var_v) = (variant.mean?, variant.variance?);

    let n1 = control.count as f64;
    let n2 = variant.count as f64;
    let df = n1 + n2 - 2.0;

    let pooled = ((n1 - 1.0) * var_c + (n2 - 1.0) * var_v) / df;
    let se = (pooled * (1.0 / n1 + 1.0 / n2)).sqrt();
    if se == 0.0 || !se.is_finite() {
        return None;
    }

    let t_value = (mean_c - mean_v) / se;
    let dist = StudentsT::new(0.0, 1.0, df).ok()?;
    let p_value = 1.0 - dist.cdf(t_value.abs());

    Some(TTest {
        t_value,
        degrees_of_freedom: df,
        p_value,
    })
}
