/// Hyperbolic focus curve `y = a/b · sqrt((x − x0)² + b²) + y0`
///
/// The asymptotic slopes of a defocused star's HFR are `±a/b`, and the minimum
/// `a + y0` sits at `x0`. The uneven variant gives each side its own slope
/// (`a/b` left, `a/c` right) blended across one focuser step around `x0`.
use serde::Serialize;

use super::{
    inverse_variance_weights, r_squared, AxisScale, CurveFit, DataPoint, FitPoint,
    FittingOptions, MIN_FIT_POINTS,
};
use crate::solver::{LevenbergMarquardt, Model};

/// Symmetric hyperbola over unit-scaled positions; params `[a, b, x0, y0]`
struct SymmetricHyperbola;

impl Model for SymmetricHyperbola {
    type Input = f64;

    fn value(&self, u: &f64, p: &[f64]) -> f64 {
        let (a, b, x0, y0) = (p[0], p[1], p[2], p[3]);
        let d = u - x0;
        a / b * (d * d + b * b).sqrt() + y0
    }

    fn gradient(&self, u: &f64, p: &[f64], grad: &mut [f64]) {
        let (a, b, x0) = (p[0], p[1], p[2]);
        let d = u - x0;
        let r = (d * d + b * b).sqrt();
        grad[0] = r / b;
        grad[1] = -a * d * d / (r * b * b);
        grad[2] = -a * d / (b * r);
        grad[3] = 1.0;
    }
}

/// Uneven hyperbola; params `[a, b, c, x0, y0]`, numeric gradient
struct UnevenHyperbola {
    /// Blend ramp width in unit-scaled positions
    ramp_width: f64,
}

impl UnevenHyperbola {
    fn right_weight(&self, u: f64, x0: f64) -> f64 {
        if self.ramp_width <= 0.0 {
            return if u < x0 { 0.0 } else { 1.0 };
        }
        ((u - x0) / self.ramp_width + 0.5).clamp(0.0, 1.0)
    }
}

impl Model for UnevenHyperbola {
    type Input = f64;

    fn value(&self, u: &f64, p: &[f64]) -> f64 {
        let (a, b, c, x0, y0) = (p[0], p[1], p[2], p[3], p[4]);
        let d = u - x0;
        let left = a / b * (d * d + b * b).sqrt();
        let right = a / c * (d * d + c * c).sqrt();
        let w = self.right_weight(*u, x0);
        (1.0 - w) * left + w * right + y0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HyperbolicFitting {
    pub a: f64,
    /// Left-side shape parameter (both sides when even)
    pub b: f64,
    /// Right-side shape parameter, equal to `b` for the even model
    pub c: f64,
    pub x0: f64,
    pub y0: f64,
    pub uneven: bool,
    pub step_size: f64,
    pub r_squared: f64,
}

impl HyperbolicFitting {
    /// Fit a hyperbola to `points`. `None` with fewer than three points or when
    /// the solver cannot start.
    pub fn calculate(points: &[FitPoint], options: &FittingOptions) -> Option<Self> {
        if points.len() < MIN_FIT_POINTS {
            return None;
        }

        let axis = AxisScale::from_points(points);
        let inputs: Vec<f64> = points.iter().map(|p| axis.to_unit(p.x)).collect();
        let values: Vec<f64> = points.iter().map(|p| p.y).collect();
        let weights = if options.weighted {
            inverse_variance_weights(points)
        } else {
            None
        };

        let (a0, b0, x00) = initial_guess(points, &axis);
        let y_min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let y_max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let y0_lower = -10.0 * y_max.abs().max(1.0);

        // LM needs at least as many points as parameters; an uneven fit on a
        // handful of samples falls back to the even model
        let uneven = options.uneven_hyperbolic && points.len() >= 5;
        let solver = LevenbergMarquardt::default().with_max_iterations(500);

        let (a, b, c, x0, y0) = if uneven {
            let model = UnevenHyperbola {
                ramp_width: options.step_size / axis.scale,
            };
            let solution = solver
                .fit(
                    &model,
                    &inputs,
                    &values,
                    weights.as_deref(),
                    &[a0, b0, b0, x00, 0.0],
                    &[1e-9, 1e-9, 1e-9, -3.0, y0_lower],
                    &[f64::MAX, f64::MAX, f64::MAX, 3.0, y_min],
                )
                .map_err(|e| tracing::debug!("Uneven hyperbolic fit failed: {}", e))
                .ok()?;
            let p = solution.params;
            (p[0], p[1], p[2], p[3], p[4])
        } else {
            let solution = solver
                .fit(
                    &SymmetricHyperbola,
                    &inputs,
                    &values,
                    weights.as_deref(),
                    &[a0, b0, x00, 0.0],
                    &[1e-9, 1e-9, -3.0, y0_lower],
                    &[f64::MAX, f64::MAX, 3.0, y_min],
                )
                .map_err(|e| tracing::debug!("Hyperbolic fit failed: {}", e))
                .ok()?;
            let p = solution.params;
            (p[0], p[1], p[1], p[2], p[3])
        };

        let mut fitting = Self {
            a,
            b: b * axis.scale,
            c: c * axis.scale,
            x0: axis.from_unit(x0),
            y0,
            uneven,
            step_size: options.step_size,
            r_squared: 0.0,
        };
        fitting.r_squared = r_squared(points, |x| fitting.evaluate(x));
        Some(fitting)
    }
}

/// Analytic starting point from the lowest and highest samples.
///
/// With `y0 = 0` the hyperbola through the lowest sample `(xl, yl)` as vertex
/// and the highest `(xh, yh)` gives `a = yl` and
/// `b = |xh − xl| · a / sqrt(yh² − a²)`.
fn initial_guess(points: &[FitPoint], axis: &AxisScale) -> (f64, f64, f64) {
    let lowest = points
        .iter()
        .min_by(|l, r| l.y.total_cmp(&r.y))
        .copied()
        .unwrap_or(FitPoint::new(axis.center, 1.0, 0.0));
    let highest = points
        .iter()
        .max_by(|l, r| l.y.total_cmp(&r.y))
        .copied()
        .unwrap_or(lowest);

    let a = lowest.y.max(1e-6);
    let x0 = axis.to_unit(lowest.x);
    let dx = (axis.to_unit(highest.x) - x0).abs();
    let rise = highest.y * highest.y - a * a;
    let b = if dx > 0.0 && rise > 0.0 {
        dx * a / rise.sqrt()
    } else {
        0.5
    };
    (a, b.max(1e-6), x0)
}

impl CurveFit for HyperbolicFitting {
    fn expression(&self) -> String {
        if self.uneven {
            format!(
                "y = {:.4}/({:.4} | {:.4}) * sqrt((x - {:.2})^2 + ({:.4} | {:.4})^2) + {:.4}",
                self.a, self.b, self.c, self.x0, self.b, self.c, self.y0
            )
        } else {
            format!(
                "y = {:.4}/{:.4} * sqrt((x - {:.2})^2 + {:.4}^2) + {:.4}",
                self.a, self.b, self.x0, self.b, self.y0
            )
        }
    }

    fn extremum(&self) -> DataPoint {
        DataPoint::new(self.x0, self.a + self.y0)
    }

    fn r_squared(&self) -> f64 {
        self.r_squared
    }

    fn evaluate(&self, x: f64) -> f64 {
        let d = x - self.x0;
        let left = self.a / self.b * (d * d + self.b * self.b).sqrt();
        if !self.uneven {
            return left + self.y0;
        }
        let right = self.a / self.c * (d * d + self.c * self.c).sqrt();
        let w = if self.step_size > 0.0 {
            (d / self.step_size + 0.5).clamp(0.0, 1.0)
        } else if d < 0.0 {
            0.0
        } else {
            1.0
        };
        (1.0 - w) * left + w * right + self.y0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hyperbola(a: f64, b: f64, x0: f64, y0: f64, x: f64) -> f64 {
        a / b * ((x - x0).powi(2) + b * b).sqrt() + y0
    }

    fn sample(a: f64, b: f64, x0: f64, y0: f64) -> Vec<FitPoint> {
        (0..11)
            .map(|i| {
                let x = 10_000.0 + i as f64 * 100.0;
                // Deterministic jitter far below the curve's scale
                let jitter = if i % 2 == 0 { 1e-4 } else { -1e-4 };
                FitPoint::new(x, hyperbola(a, b, x0, y0, x) + jitter, 0.05)
            })
            .collect()
    }

    #[test]
    fn test_recovers_known_hyperbola() {
        let points = sample(2.0, 200.0, 10_480.0, 0.5);
        let fit = HyperbolicFitting::calculate(&points, &FittingOptions::default()).unwrap();
        assert!(
            (fit.x0 - 10_480.0).abs() < 5.0,
            "x0 = {} expected 10480",
            fit.x0
        );
        assert!(fit.r_squared > 0.999, "R² = {}", fit.r_squared);
        assert!((fit.extremum().y - 2.5).abs() < 0.05);
    }

    #[test]
    fn test_weighted_fit_recovers_center() {
        let points = sample(1.5, 150.0, 10_520.0, 1.0);
        let options = FittingOptions {
            weighted: true,
            ..Default::default()
        };
        let fit = HyperbolicFitting::calculate(&points, &options).unwrap();
        assert!((fit.x0 - 10_520.0).abs() < 5.0, "x0 = {}", fit.x0);
        assert!(fit.r_squared > 0.999);
    }

    #[test]
    fn test_uneven_fit_tracks_asymmetric_slopes() {
        let points: Vec<FitPoint> = (0..11)
            .map(|i| {
                let x = 10_000.0 + i as f64 * 100.0;
                let b = if x < 10_500.0 { 150.0 } else { 300.0 };
                FitPoint::new(x, hyperbola(2.0, b, 10_500.0, 0.5, x), 0.05)
            })
            .collect();
        let options = FittingOptions {
            uneven_hyperbolic: true,
            step_size: 100.0,
            ..Default::default()
        };
        let fit = HyperbolicFitting::calculate(&points, &options).unwrap();
        assert!(fit.uneven);
        assert!((fit.x0 - 10_500.0).abs() < 50.0, "x0 = {}", fit.x0);
        assert!(fit.r_squared > 0.99, "R² = {}", fit.r_squared);
    }

    #[test]
    fn test_initial_guess_from_extreme_samples() {
        let points = vec![
            FitPoint::new(0.0, 5.0, 0.1),
            FitPoint::new(1.0, 3.0, 0.1),
            FitPoint::new(2.0, 4.0, 0.1),
        ];
        let axis = AxisScale::from_points(&points);
        let (a, b, x0) = initial_guess(&points, &axis);
        assert_eq!(a, 3.0);
        assert_eq!(x0, 0.0);
        // dx = 1 unit, b = 1 * 3 / sqrt(25 - 9)
        assert!((b - 0.75).abs() < 1e-12);
    }
}
