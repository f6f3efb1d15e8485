//! Pearson's chi-square goodness-of-fit test, used to check that resampled ancestor counts
//! are consistent with their expected frequencies.

use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Stores the result of a chi-square test, indicating whether the null was rejected,
/// along with the test statistic, p-value, degrees of freedom and the chosen level.
#[derive(Debug, Clone, PartialEq)]
pub struct TestResult {
    pub is_rejected: bool,
    pub statistic: f64,
    pub p_value: f64,
    pub level: f64,
    pub dof: usize,
}

/// Tests observed category counts against expected counts at the given significance level.
///
/// Categories with an expected count of zero must also be observed zero times; they do not
/// contribute a degree of freedom.
pub fn chi_square_test(observed: &[u64], expected: &[f64], level: f64) -> Result<TestResult, String> {
    if observed.len() != expected.len() {
        return Err(format!(
            "Expected {} observed counts, got {}.",
            expected.len(),
            observed.len()
        ));
    }
    if !(0.0..=1.0).contains(&level) {
        return Err(format!("Expected level in [0, 1], got {level}."));
    }

    let mut statistic = 0.0;
    let mut categories = 0usize;
    for (&o, &e) in observed.iter().zip(expected) {
        if !(e >= 0.0 && e.is_finite()) {
            return Err(format!("Bad expected count {e}."));
        }
        if e == 0.0 {
            if o > 0 {
                return Err("Observed a category with zero expected count.".into());
            }
            continue;
        }
        let diff = o as f64 - e;
        statistic += diff * diff / e;
        categories += 1;
    }
    if categories < 2 {
        return Err("Expected at least two categories with positive expected count.".into());
    }

    let dof = categories - 1;
    let dist = ChiSquared::new(dof as f64).map_err(|e| e.to_string())?;
    let p_value = dist.sf(statistic);
    Ok(TestResult {
        is_rejected: p_value < level,
        statistic,
        p_value,
        level,
        dof,
    })
}

/// Tests whether `counts` are consistent with a uniform distribution over its categories.
pub fn chi_square_uniform_test(counts: &[u64], level: f64) -> Result<TestResult, String> {
    let total: u64 = counts.iter().sum();
    let expected = vec![total as f64 / counts.len().max(1) as f64; counts.len()];
    chi_square_test(counts, &expected, level)
}
