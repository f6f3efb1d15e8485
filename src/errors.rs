//! Error types shared by every stage of a forward pass.
//!
//! All errors abort the pass they occur in. Configuration problems are reported
//! before any tensor is touched; shape and numerical problems are reported at the
//! first operation that observes them.

/// Crate-wide result alias.
pub type SmcResult<T> = Result<T, SmcError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SmcError {
    // ---- Configuration ----
    /// A setting is invalid on its own (e.g. `n_particles < 1`).
    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },

    /// The requested flow type is not one of MAF, IAF or RealNVP.
    #[error("Unknown flow type {0:?}; expected one of \"MAF\", \"IAF\", \"RealNVP\"")]
    UnknownFlowType(String),

    /// Two components disagree on a declared dimension.
    #[error("Dimension mismatch in {context}: expected {expected}, found {found}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    // ---- Shape ----
    /// Runtime tensors do not line up.
    #[error("Shape mismatch in {context}: expected {expected:?}, found {found:?}")]
    Shape {
        context: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    // ---- Numerical ----
    /// Log-weights at time step `t` contain NaN or infinite entries.
    #[error("{count} non-finite log-weights at time step {t}")]
    NonFiniteLogWeights { t: usize, count: usize },

    /// Normalized weights of batch element `batch` cannot be formed (NaN, or all zero).
    #[error("Degenerate weights for batch element {batch}")]
    DegenerateWeights { batch: usize },

    /// A distribution parameter left its valid range (e.g. a Poisson rate `<= 0`).
    #[error("Invalid {context} value {value}")]
    InvalidParameter { context: &'static str, value: f32 },

    /// The accumulated log-evidence is NaN or infinite.
    #[error("{count} non-finite log-evidence values")]
    NonFiniteLogEvidence { count: usize },

    /// The innovation covariance of the Kalman filter is not positive definite.
    #[error("Innovation covariance is not positive definite at time step {t}")]
    KalmanSingular { t: usize },
}

impl SmcError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        SmcError::Configuration {
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors raised before any computation starts.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SmcError::Configuration { .. }
                | SmcError::UnknownFlowType(_)
                | SmcError::DimensionMismatch { .. }
        )
    }

    /// Returns `true` for NaN/Inf failures.
    pub fn is_numerical(&self) -> bool {
        matches!(
            self,
            SmcError::NonFiniteLogWeights { .. }
                | SmcError::NonFiniteLogEvidence { .. }
                | SmcError::DegenerateWeights { .. }
                | SmcError::InvalidParameter { .. }
                | SmcError::KalmanSingular { .. }
        )
    }
}

/// Checks that `found` equals `expected`, reporting both on failure.
pub(crate) fn check_shape(
    context: &'static str,
    expected: &[usize],
    found: &[usize],
) -> SmcResult<()> {
    if expected == found {
        Ok(())
    } else {
        Err(SmcError::Shape {
            context,
            expected: expected.to_vec(),
            found: found.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(SmcError::config("n_particles must be at least 1").is_configuration());
        assert!(SmcError::UnknownFlowType("NICE".into()).is_configuration());
        assert!(SmcError::NonFiniteLogWeights { t: 3, count: 2 }.is_numerical());
        assert!(!SmcError::Shape {
            context: "emission",
            expected: vec![1, 2],
            found: vec![2, 1],
        }
        .is_configuration());
    }

    #[test]
    fn test_check_shape_reports_dims() {
        let err = check_shape("transition input", &[10, 5, 2], &[10, 4, 2]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Shape mismatch in transition input: expected [10, 5, 2], found [10, 4, 2]"
        );
        assert!(check_shape("transition input", &[3], &[3]).is_ok());
    }
}
