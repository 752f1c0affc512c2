/// Piecewise trendline fitting: independent lines on each side of the best
/// sample, intersected to estimate the focus point.
use serde::Serialize;

use super::{r_squared, CurveFit, DataPoint, FitPoint};
use crate::options::AutoFocusMethod;

/// Samples within this HFR of the minimum belong to neither trend
const HFR_TREND_TOLERANCE: f64 = 0.1;
/// Samples within this contrast of the maximum belong to neither trend
const CONTRAST_TREND_TOLERANCE: f64 = 0.01;

/// Weighted least squares line through one side of the curve
#[derive(Debug, Clone, Serialize)]
pub struct Trendline {
    pub slope: f64,
    pub offset: f64,
    pub r_squared: f64,
    pub data_points: Vec<FitPoint>,
}

impl Trendline {
    pub fn new(points: Vec<FitPoint>) -> Self {
        if points.len() < 2 {
            return Self {
                slope: 0.0,
                offset: 0.0,
                r_squared: 0.0,
                data_points: points,
            };
        }

        let weights: Vec<f64> = match super::inverse_variance_weights(&points) {
            Some(w) => w,
            None => vec![1.0; points.len()],
        };

        let sum_w: f64 = weights.iter().sum();
        let mean_x = points.iter().zip(&weights).map(|(p, w)| p.x * w).sum::<f64>() / sum_w;
        let mean_y = points.iter().zip(&weights).map(|(p, w)| p.y * w).sum::<f64>() / sum_w;

        let (sxy, sxx) = points
            .iter()
            .zip(&weights)
            .fold((0.0, 0.0), |(sxy, sxx), (p, w)| {
                let dx = p.x - mean_x;
                (sxy + w * dx * (p.y - mean_y), sxx + w * dx * dx)
            });

        let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
        let offset = mean_y - slope * mean_x;
        let r_squared = r_squared(&points, |x| slope * x + offset);

        Self {
            slope,
            offset,
            r_squared,
            data_points: points,
        }
    }

    pub fn len(&self) -> usize {
        self.data_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data_points.is_empty()
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        self.slope * x + self.offset
    }

    /// Intersection with another line, `None` when parallel
    pub fn intersect(&self, other: &Trendline) -> Option<DataPoint> {
        let slope_delta = self.slope - other.slope;
        if slope_delta.abs() < f64::EPSILON {
            return None;
        }
        let x = (other.offset - self.offset) / slope_delta;
        Some(DataPoint::new(x, self.evaluate(x)))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendlineFitting {
    pub left: Trendline,
    pub right: Trendline,
    /// Best sample: lowest HFR or highest contrast
    pub best: DataPoint,
    pub intersection: Option<DataPoint>,
    #[serde(skip)]
    pub method: AutoFocusMethod,
}

impl TrendlineFitting {
    /// Split `points` around the best sample and fit each side.
    ///
    /// Samples too close to the best value are left out of both trends; they sit
    /// on the flat bottom of the curve and would bend the lines.
    pub fn calculate(points: &[FitPoint], method: AutoFocusMethod) -> Self {
        let valid: Vec<FitPoint> = points.iter().copied().filter(FitPoint::is_valid).collect();

        let best = match method {
            AutoFocusMethod::StarHfr => valid.iter().min_by(|a, b| a.y.total_cmp(&b.y)),
            AutoFocusMethod::ContrastDetection => valid.iter().max_by(|a, b| a.y.total_cmp(&b.y)),
        }
        .map(|p| DataPoint::new(p.x, p.y))
        .unwrap_or(DataPoint::new(f64::NAN, f64::NAN));

        let on_trend = |p: &FitPoint| match method {
            AutoFocusMethod::StarHfr => p.y > best.y + HFR_TREND_TOLERANCE,
            AutoFocusMethod::ContrastDetection => p.y < best.y - CONTRAST_TREND_TOLERANCE,
        };

        let left = Trendline::new(
            valid
                .iter()
                .copied()
                .filter(|p| p.x < best.x && on_trend(p))
                .collect(),
        );
        let right = Trendline::new(
            valid
                .iter()
                .copied()
                .filter(|p| p.x > best.x && on_trend(p))
                .collect(),
        );

        let intersection = if left.len() >= 2 && right.len() >= 2 {
            left.intersect(&right)
        } else {
            None
        };

        Self {
            left,
            right,
            best,
            intersection,
            method,
        }
    }
}

impl CurveFit for TrendlineFitting {
    fn expression(&self) -> String {
        format!(
            "left: y = {:.6} * x + {:.4}; right: y = {:.6} * x + {:.4}",
            self.left.slope, self.left.offset, self.right.slope, self.right.offset
        )
    }

    /// The intersection of both trends, NaN when the trends do not intersect
    fn extremum(&self) -> DataPoint {
        self.intersection
            .unwrap_or(DataPoint::new(f64::NAN, f64::NAN))
    }

    /// The weaker of the two sides
    fn r_squared(&self) -> f64 {
        self.left.r_squared.min(self.right.r_squared)
    }

    fn evaluate(&self, x: f64) -> f64 {
        if x < self.best.x {
            self.left.evaluate(x)
        } else {
            self.right.evaluate(x)
        }
    }
}
