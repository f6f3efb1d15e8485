//! Exact inference for linear-Gaussian state-space models.
//!
//! ```text
//! x_0 ~ N(x0_mean, x0_cov)
//! x_t = A x_{t-1} + N(0, Q)      (t >= 1)
//! y_t = B x_t     + N(0, Σ)
//! ```
//!
//! The Kalman filter gives the exact log marginal likelihood `log p(y_0, …, y_{T-1})`, the
//! value the particle estimator converges to for such models.

use crate::errors::{SmcError, SmcResult};
use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::StandardNormal;
use std::f64::consts::PI;

#[derive(Debug, Clone, PartialEq)]
pub struct LinearGaussianModel {
    pub a: DMatrix<f64>,
    pub q: DMatrix<f64>,
    pub b: DMatrix<f64>,
    pub sigma: DMatrix<f64>,
    pub x0_mean: DVector<f64>,
    pub x0_cov: DMatrix<f64>,
}

impl LinearGaussianModel {
    /// Checks that all matrices agree on the state size `Dx = a.nrows()` and the observation
    /// size `Dy = b.nrows()`.
    pub fn new(
        a: DMatrix<f64>,
        q: DMatrix<f64>,
        b: DMatrix<f64>,
        sigma: DMatrix<f64>,
        x0_mean: DVector<f64>,
        x0_cov: DMatrix<f64>,
    ) -> SmcResult<Self> {
        let dx = a.nrows();
        let dy = b.nrows();
        let checks: [(&'static str, usize, usize); 9] = [
            ("transition matrix columns", dx, a.ncols()),
            ("transition covariance rows", dx, q.nrows()),
            ("transition covariance columns", dx, q.ncols()),
            ("emission matrix columns", dx, b.ncols()),
            ("emission covariance rows", dy, sigma.nrows()),
            ("emission covariance columns", dy, sigma.ncols()),
            ("initial mean", dx, x0_mean.len()),
            ("initial covariance rows", dx, x0_cov.nrows()),
            ("initial covariance columns", dx, x0_cov.ncols()),
        ];
        for (context, expected, found) in checks {
            if expected != found {
                return Err(SmcError::DimensionMismatch {
                    context,
                    expected,
                    found,
                });
            }
        }
        Ok(Self {
            a,
            q,
            b,
            sigma,
            x0_mean,
            x0_cov,
        })
    }

    pub fn state_dim(&self) -> usize {
        self.a.nrows()
    }

    pub fn obs_dim(&self) -> usize {
        self.b.nrows()
    }

    /// Exact `log p(y_0, …, y_{T-1})`.
    pub fn log_likelihood(&self, obs: &[DVector<f64>]) -> SmcResult<f64> {
        let dy = self.obs_dim();
        let mut mean = self.x0_mean.clone();
        let mut cov = self.x0_cov.clone();
        let mut ll = 0.0;

        for (t, y) in obs.iter().enumerate() {
            if y.len() != dy {
                return Err(SmcError::Shape {
                    context: "Kalman observation",
                    expected: vec![dy],
                    found: vec![y.len()],
                });
            }
            if t > 0 {
                mean = &self.a * &mean;
                cov = &self.a * &cov * self.a.transpose() + &self.q;
            }

            let innovation = y - &self.b * &mean;
            let s = &self.b * &cov * self.b.transpose() + &self.sigma;
            let chol = s.cholesky().ok_or(SmcError::KalmanSingular { t })?;
            let log_det: f64 = 2.0 * chol.l().diagonal().iter().map(|v| v.ln()).sum::<f64>();
            let solved = chol.solve(&innovation);
            ll -= 0.5 * (dy as f64 * (2.0 * PI).ln() + log_det + innovation.dot(&solved));

            // K = P Bᵀ S⁻¹ = (S⁻¹ B P)ᵀ
            let bp = &self.b * &cov;
            let gain = chol.solve(&bp).transpose();
            mean += &gain * innovation;
            cov -= &gain * bp;
            cov = (&cov + cov.transpose()) * 0.5;
        }
        Ok(ll)
    }

    /// Draws a hidden trajectory and its observations of length `t_len`.
    pub fn simulate(
        &self,
        t_len: usize,
        rng: &mut SmallRng,
    ) -> SmcResult<(Vec<DVector<f64>>, Vec<DVector<f64>>)> {
        let chol_factor = |m: &DMatrix<f64>, context: &'static str| {
            m.clone()
                .cholesky()
                .map(|c| c.l())
                .ok_or_else(|| SmcError::config(format!("{context} is not positive definite")))
        };
        let l0 = chol_factor(&self.x0_cov, "initial covariance")?;
        let lq = chol_factor(&self.q, "transition covariance")?;
        let ls = chol_factor(&self.sigma, "emission covariance")?;
        let mut noise = |dim: usize| DVector::from_fn(dim, |_, _| rng.sample::<f64, _>(StandardNormal));

        let mut hidden = Vec::with_capacity(t_len);
        let mut obs = Vec::with_capacity(t_len);
        let mut x = &self.x0_mean + &l0 * noise(self.state_dim());
        for t in 0..t_len {
            if t > 0 {
                x = &self.a * &x + &lq * noise(self.state_dim());
            }
            let y = &self.b * &x + &ls * noise(self.obs_dim());
            hidden.push(x.clone());
            obs.push(y);
        }
        Ok((hidden, obs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    fn scalar_model(a: f64, q: f64, b: f64, s: f64) -> LinearGaussianModel {
        LinearGaussianModel::new(
            DMatrix::from_element(1, 1, a),
            DMatrix::from_element(1, 1, q),
            DMatrix::from_element(1, 1, b),
            DMatrix::from_element(1, 1, s),
            DVector::from_element(1, 0.0),
            DMatrix::from_element(1, 1, q),
        )
        .unwrap()
    }

    #[test]
    fn test_single_observation() {
        // y_0 ~ N(0, b² q + s)
        let model = scalar_model(0.9, 2.0, 1.5, 0.5);
        let y = 1.3;
        let var: f64 = 1.5 * 1.5 * 2.0 + 0.5;
        let expected = -0.5 * ((2.0 * PI * var).ln() + y * y / var);
        let ll = model.log_likelihood(&[DVector::from_element(1, y)]).unwrap();
        assert_abs_diff_eq!(ll, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_two_observations_match_joint_gaussian() {
        // (y_0, y_1) is jointly Gaussian with
        // var(y_0) = q + s, var(y_1) = a² q + q + s, cov = a q   (b = 1)
        let (a, q, s) = (0.7, 1.2, 0.3);
        let model = scalar_model(a, q, 1.0, s);
        let (y0, y1) = (0.4, -1.1);
        let c00 = q + s;
        let c11 = a * a * q + q + s;
        let c01 = a * q;
        let det: f64 = c00 * c11 - c01 * c01;
        let maha = (c11 * y0 * y0 - 2.0 * c01 * y0 * y1 + c00 * y1 * y1) / det;
        let expected = -0.5 * (2.0 * (2.0 * PI).ln() + det.ln() + maha);

        let obs = [DVector::from_element(1, y0), DVector::from_element(1, y1)];
        assert_abs_diff_eq!(model.log_likelihood(&obs).unwrap(), expected, epsilon = 1e-10);
    }

    #[test]
    fn test_dimension_checks() {
        let err = LinearGaussianModel::new(
            DMatrix::identity(2, 2),
            DMatrix::identity(2, 2),
            DMatrix::identity(3, 3),
            DMatrix::identity(3, 3),
            DVector::zeros(2),
            DMatrix::identity(2, 2),
        )
        .unwrap_err();
        assert!(err.is_configuration());

        let model = scalar_model(1.0, 1.0, 1.0, 1.0);
        assert!(matches!(
            model.log_likelihood(&[DVector::zeros(2)]),
            Err(SmcError::Shape { .. })
        ));
    }

    #[test]
    fn test_singular_innovation() {
        let model = scalar_model(1.0, 0.0, 1.0, 0.0);
        assert_eq!(
            model.log_likelihood(&[DVector::zeros(1)]).unwrap_err(),
            SmcError::KalmanSingular { t: 0 }
        );
    }

    #[test]
    fn test_simulate_shapes_and_reproducibility() {
        let model = scalar_model(0.5, 1.0, 2.0, 0.1);
        let (h1, o1) = model.simulate(10, &mut SmallRng::seed_from_u64(9)).unwrap();
        let (h2, o2) = model.simulate(10, &mut SmallRng::seed_from_u64(9)).unwrap();
        assert_eq!(h1.len(), 10);
        assert_eq!(o1.len(), 10);
        assert_eq!(h1, h2);
        assert_eq!(o1, o2);
    }
}
