/// Gaussian curve `y = A · exp(−(x − μ)² / 2σ²) + offset` for contrast
/// detection, where the sharpest position is the curve's peak
use serde::Serialize;

use super::{r_squared, AxisScale, CurveFit, DataPoint, FitPoint, MIN_FIT_POINTS};
use crate::solver::{LevenbergMarquardt, Model};

/// Params `[amplitude, mean, sigma, offset]` over unit-scaled positions
struct GaussianCurve;

impl Model for GaussianCurve {
    type Input = f64;

    fn value(&self, u: &f64, p: &[f64]) -> f64 {
        let (amplitude, mean, sigma, offset) = (p[0], p[1], p[2], p[3]);
        let d = u - mean;
        amplitude * (-(d * d) / (2.0 * sigma * sigma)).exp() + offset
    }

    fn gradient(&self, u: &f64, p: &[f64], grad: &mut [f64]) {
        let (amplitude, mean, sigma) = (p[0], p[1], p[2]);
        let d = u - mean;
        let s2 = sigma * sigma;
        let e = (-(d * d) / (2.0 * s2)).exp();
        grad[0] = e;
        grad[1] = amplitude * e * d / s2;
        grad[2] = amplitude * e * d * d / (s2 * sigma);
        grad[3] = 1.0;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GaussianFitting {
    pub amplitude: f64,
    pub mean: f64,
    pub sigma: f64,
    pub offset: f64,
    pub r_squared: f64,
}

impl GaussianFitting {
    pub fn calculate(points: &[FitPoint]) -> Option<Self> {
        if points.len() < MIN_FIT_POINTS {
            return None;
        }

        let axis = AxisScale::from_points(points);
        let inputs: Vec<f64> = points.iter().map(|p| axis.to_unit(p.x)).collect();
        let values: Vec<f64> = points.iter().map(|p| p.y).collect();

        let peak = points.iter().max_by(|l, r| l.y.total_cmp(&r.y))?;
        let y_min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let y_max = peak.y;
        let span = y_max - y_min;

        let initial = [
            span.max(1e-9),
            axis.to_unit(peak.x),
            0.5,
            y_min,
        ];
        let lower = [1e-12, -3.0, 1e-3, f64::MIN];
        let upper = [f64::MAX, 3.0, 100.0, y_max];

        let solution = LevenbergMarquardt::default()
            .with_max_iterations(500)
            .fit(&GaussianCurve, &inputs, &values, None, &initial, &lower, &upper)
            .map_err(|e| tracing::debug!("Gaussian fit failed: {}", e))
            .ok()?;
        let p = solution.params;

        let mut fitting = Self {
            amplitude: p[0],
            mean: axis.from_unit(p[1]),
            sigma: p[2] * axis.scale,
            offset: p[3],
            r_squared: 0.0,
        };
        fitting.r_squared = r_squared(points, |x| fitting.evaluate(x));
        Some(fitting)
    }
}

impl CurveFit for GaussianFitting {
    fn expression(&self) -> String {
        format!(
            "y = {:.4} * exp(-(x - {:.2})^2 / (2 * {:.4}^2)) + {:.4}",
            self.amplitude, self.mean, self.sigma, self.offset
        )
    }

    /// The peak of the curve
    fn extremum(&self) -> DataPoint {
        DataPoint::new(self.mean, self.amplitude + self.offset)
    }

    fn r_squared(&self) -> f64 {
        self.r_squared
    }

    fn evaluate(&self, x: f64) -> f64 {
        let d = x - self.mean;
        self.amplitude * (-(d * d) / (2.0 * self.sigma * self.sigma)).exp() + self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovers_contrast_peak() {
        let points: Vec<FitPoint> = (0..11)
            .map(|i| {
                let x = 5_000.0 + i as f64 * 50.0;
                let y = 0.8 * (-(x - 5_230.0f64).powi(2) / (2.0 * 120.0f64.powi(2))).exp() + 0.1;
                FitPoint::new(x, y, 0.0)
            })
            .collect();
        let fit = GaussianFitting::calculate(&points).unwrap();
        assert!((fit.mean - 5_230.0).abs() < 1.0, "mean = {}", fit.mean);
        assert!((fit.sigma - 120.0).abs() < 1.0, "sigma = {}", fit.sigma);
        assert!((fit.extremum().y - 0.9).abs() < 1e-3);
        assert!(fit.r_squared > 0.9999);
    }

    #[test]
    fn test_too_few_points() {
        let points = vec![FitPoint::new(0.0, 1.0, 0.0), FitPoint::new(1.0, 2.0, 0.0)];
        assert!(GaussianFitting::calculate(&points).is_none());
    }
}
