/// Bounded Levenberg-Marquardt least squares
///
/// Shared by the PSF fitter (2-D star profiles) and the focus curve fitters
/// (1-D hyperbola and Gaussian). Models provide their value and, optionally, an
/// analytic gradient; otherwise central finite differences are used.
use nalgebra::{DMatrix, DVector};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SolverError {
    #[error("not enough data points for fitting: {points} points for {params} parameters")]
    NotEnoughPoints { points: usize, params: usize },
    #[error("parameter, bound and data lengths do not agree")]
    ShapeMismatch,
    #[error("model is not finite at the initial guess")]
    NonFiniteStart,
}

/// A parametric model `f(input; params)`
pub trait Model: Send + Sync {
    type Input;

    fn value(&self, input: &Self::Input, params: &[f64]) -> f64;

    /// Partial derivatives of `value` with respect to each parameter
    fn gradient(&self, input: &Self::Input, params: &[f64], grad: &mut [f64]) {
        let mut probe = params.to_vec();
        for j in 0..params.len() {
            let h = 1e-6 * params[j].abs().max(1e-3);
            probe[j] = params[j] + h;
            let up = self.value(input, &probe);
            probe[j] = params[j] - h;
            let down = self.value(input, &probe);
            probe[j] = params[j];
            grad[j] = (up - down) / (2.0 * h);
        }
    }
}

/// Result of a converged (or best-effort) fit
#[derive(Debug, Clone)]
pub struct Solution {
    pub params: Vec<f64>,
    /// Weighted sum of squared residuals at `params`
    pub sum_squared_error: f64,
    pub iterations: usize,
}

pub struct LevenbergMarquardt {
    max_iterations: usize,
    tolerance: f64,
    lambda: f64,
    lambda_factor: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-10,
            lambda: 1e-3,
            lambda_factor: 10.0,
        }
    }
}

impl LevenbergMarquardt {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Fit `model` to `(inputs, values)`.
    ///
    /// `weights`, when given, multiply each squared residual. Parameters are
    /// clamped into `[lower, upper]` after every step.
    #[allow(clippy::too_many_arguments)]
    pub fn fit<M: Model>(
        &self,
        model: &M,
        inputs: &[M::Input],
        values: &[f64],
        weights: Option<&[f64]>,
        initial_params: &[f64],
        lower_bounds: &[f64],
        upper_bounds: &[f64],
    ) -> Result<Solution, SolverError> {
        let n_params = initial_params.len();
        let n_points = inputs.len();

        if values.len() != n_points
            || lower_bounds.len() != n_params
            || upper_bounds.len() != n_params
            || weights.is_some_and(|w| w.len() != n_points)
        {
            return Err(SolverError::ShapeMismatch);
        }
        if n_points < n_params {
            return Err(SolverError::NotEnoughPoints {
                points: n_points,
                params: n_params,
            });
        }

        let sqrt_weights: Vec<f64> = match weights {
            Some(w) => w.iter().map(|&w| w.max(0.0).sqrt()).collect(),
            None => vec![1.0; n_points],
        };

        let clamp = |params: &mut [f64]| {
            for i in 0..n_params {
                params[i] = params[i].max(lower_bounds[i]).min(upper_bounds[i]);
            }
        };

        let error_of = |params: &[f64]| -> f64 {
            inputs
                .iter()
                .zip(values)
                .zip(&sqrt_weights)
                .map(|((input, observed), sw)| {
                    let residual = (observed - model.value(input, params)) * sw;
                    residual * residual
                })
                .sum()
        };

        let mut params = initial_params.to_vec();
        clamp(&mut params);
        let mut error = error_of(&params);
        if !error.is_finite() {
            return Err(SolverError::NonFiniteStart);
        }

        let mut lambda = self.lambda;
        let mut jacobian = DMatrix::<f64>::zeros(n_points, n_params);
        let mut residuals = DVector::<f64>::zeros(n_points);
        let mut gradient = vec![0.0; n_params];
        let mut iterations = 0;

        'outer: for iter in 0..self.max_iterations {
            iterations = iter + 1;

            for (i, (input, observed)) in inputs.iter().zip(values).enumerate() {
                let sw = sqrt_weights[i];
                residuals[i] = (observed - model.value(input, &params)) * sw;
                model.gradient(input, &params, &mut gradient);
                for (j, &g) in gradient.iter().enumerate() {
                    jacobian[(i, j)] = if g.is_finite() { g * sw } else { 0.0 };
                }
            }

            let jt = jacobian.transpose();
            let jtj = &jt * &jacobian;
            let jtr = &jt * &residuals;

            loop {
                // Marquardt scaling keeps the damping meaningful when parameters
                // live on very different scales
                let mut h = jtj.clone();
                for i in 0..n_params {
                    h[(i, i)] += lambda * jtj[(i, i)].max(1e-12);
                }

                let Some(delta) = h.lu().solve(&jtr) else {
                    lambda *= self.lambda_factor;
                    if lambda > 1e12 {
                        break 'outer;
                    }
                    continue;
                };

                let mut candidate: Vec<f64> =
                    params.iter().zip(delta.iter()).map(|(p, d)| p + d).collect();
                clamp(&mut candidate);
                let candidate_error = error_of(&candidate);

                if candidate_error.is_finite() && candidate_error <= error {
                    let improvement = (error - candidate_error) / error.max(f64::MIN_POSITIVE);
                    let step: f64 = params
                        .iter()
                        .zip(&candidate)
                        .map(|(p, c)| ((c - p) / p.abs().max(1e-9)).abs())
                        .fold(0.0, f64::max);

                    params = candidate;
                    error = candidate_error;
                    lambda = (lambda / self.lambda_factor).max(1e-15);

                    if improvement < self.tolerance || step < self.tolerance {
                        break 'outer;
                    }
                    break;
                }

                lambda *= self.lambda_factor;
                if lambda > 1e12 {
                    break 'outer;
                }
            }
        }

        Ok(Solution {
            params,
            sum_squared_error: error,
            iterations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Line;

    impl Model for Line {
        type Input = f64;

        fn value(&self, x: &f64, params: &[f64]) -> f64 {
            params[0] * x + params[1]
        }
    }

    struct Exponential;

    impl Model for Exponential {
        type Input = f64;

        fn value(&self, x: &f64, params: &[f64]) -> f64 {
            params[0] * (params[1] * x).exp()
        }

        fn gradient(&self, x: &f64, params: &[f64], grad: &mut [f64]) {
            let e = (params[1] * x).exp();
            grad[0] = e;
            grad[1] = params[0] * x * e;
        }
    }

    #[test]
    fn test_fits_line_with_numeric_gradient() {
        let xs: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 3.0 * x - 2.0).collect();
        let solution = LevenbergMarquardt::default()
            .fit(
                &Line,
                &xs,
                &ys,
                None,
                &[1.0, 0.0],
                &[f64::NEG_INFINITY; 2],
                &[f64::INFINITY; 2],
            )
            .unwrap();
        assert!((solution.params[0] - 3.0).abs() < 1e-6);
        assert!((solution.params[1] + 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_fits_exponential() {
        let xs: Vec<f64> = (0..20).map(|i| i as f64 * 0.1).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 2.0 * (0.7 * x).exp()).collect();
        let solution = LevenbergMarquardt::default()
            .fit(
                &Exponential,
                &xs,
                &ys,
                None,
                &[1.0, 0.1],
                &[0.0, -10.0],
                &[100.0, 10.0],
            )
            .unwrap();
        assert!((solution.params[0] - 2.0).abs() < 1e-4);
        assert!((solution.params[1] - 0.7).abs() < 1e-4);
        assert!(solution.sum_squared_error < 1e-8);
    }

    #[test]
    fn test_respects_bounds() {
        let xs: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 3.0 * x).collect();
        let solution = LevenbergMarquardt::default()
            .fit(&Line, &xs, &ys, None, &[1.0, 0.0], &[0.0, 0.0], &[2.0, 0.0])
            .unwrap();
        assert!(solution.params[0] <= 2.0);
        assert_eq!(solution.params[1], 0.0);
    }

    #[test]
    fn test_rejects_underdetermined_problem() {
        let result = LevenbergMarquardt::default().fit(
            &Line,
            &[1.0],
            &[1.0],
            None,
            &[1.0, 0.0],
            &[f64::NEG_INFINITY; 2],
            &[f64::INFINITY; 2],
        );
        assert_eq!(
            result.unwrap_err(),
            SolverError::NotEnoughPoints {
                points: 1,
                params: 2
            }
        );
    }
}
