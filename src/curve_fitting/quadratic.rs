/// Ordinary least squares parabola `y = A·x² + B·x + C`
use nalgebra::{DMatrix, DVector};
use serde::Serialize;

use super::{r_squared, AxisScale, CurveFit, DataPoint, FitPoint, MIN_FIT_POINTS};
use crate::options::AutoFocusMethod;

#[derive(Debug, Clone, Serialize)]
pub struct QuadraticFitting {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub r_squared: f64,
    pub vertex: DataPoint,
}

impl QuadraticFitting {
    /// Fit a parabola to `points`. `None` with fewer than three points or a
    /// singular system.
    ///
    /// For star HFR the vertex must be a minimum; an upside-down parabola
    /// reports a NaN vertex so it can never be accepted as a focus point.
    pub fn calculate(points: &[FitPoint], method: AutoFocusMethod) -> Option<Self> {
        if points.len() < MIN_FIT_POINTS {
            return None;
        }

        let axis = AxisScale::from_points(points);
        let design = DMatrix::from_fn(points.len(), 3, |i, j| {
            axis.to_unit(points[i].x).powi(2 - j as i32)
        });
        let observed = DVector::from_iterator(points.len(), points.iter().map(|p| p.y));

        let svd = design.svd(true, true);
        let coefficients = svd.solve(&observed, 1e-12).ok()?;
        let (ua, ub, uc) = (coefficients[0], coefficients[1], coefficients[2]);

        // Undo the axis scaling: u = (x - m) / s
        let (m, s) = (axis.center, axis.scale);
        let a = ua / (s * s);
        let b = ub / s - 2.0 * ua * m / (s * s);
        let c = ua * m * m / (s * s) - ub * m / s + uc;

        let opens_correctly = match method {
            AutoFocusMethod::StarHfr => ua > 0.0,
            AutoFocusMethod::ContrastDetection => ua < 0.0,
        };
        let vertex = if opens_correctly {
            let x = axis.from_unit(-ub / (2.0 * ua));
            DataPoint::new(x, a * x * x + b * x + c)
        } else {
            DataPoint::new(f64::NAN, f64::NAN)
        };

        let r_squared = r_squared(points, |x| a * x * x + b * x + c);

        Some(Self {
            a,
            b,
            c,
            r_squared,
            vertex,
        })
    }
}

impl CurveFit for QuadraticFitting {
    fn expression(&self) -> String {
        format!("y = {:e} * x^2 + {:e} * x + {:e}", self.a, self.b, self.c)
    }

    fn extremum(&self) -> DataPoint {
        self.vertex
    }

    fn r_squared(&self) -> f64 {
        self.r_squared
    }

    fn evaluate(&self, x: f64) -> f64 {
        self.a * x * x + self.b * x + self.c
    }
}
