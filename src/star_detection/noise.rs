/// Robust background noise estimation
use bumpalo::Bump;
use serde::Serialize;

const MAX_ITERATIONS: usize = 10;
const CONVERGENCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct NoiseEstimate {
    pub sigma: f64,
    pub background_mean: f64,
}

/// Iterative kappa-sigma clipping: drop samples above `mean + kappa * sigma`
/// and recompute until sigma settles
pub fn kappa_sigma(data: &[f64], kappa: f64) -> NoiseEstimate {
    let arena = Bump::new();
    let mut threshold = f64::MAX;
    let mut last = NoiseEstimate {
        sigma: 0.0,
        background_mean: 0.0,
    };

    for iteration in 0..MAX_ITERATIONS {
        let mut kept = bumpalo::collections::Vec::with_capacity_in(data.len(), &arena);
        if iteration == 0 {
            kept.extend_from_slice(data);
        } else {
            kept.extend(
                data.iter()
                    .copied()
                    .filter(|&v| v > f64::EPSILON && v < threshold - f64::EPSILON),
            );
        }
        if kept.is_empty() {
            break;
        }

        let n = kept.len() as f64;
        let mean = kept.iter().sum::<f64>() / n;
        let sigma = (kept.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();

        let converged = iteration > 0 && (sigma - last.sigma).abs() <= CONVERGENCE;
        last = NoiseEstimate {
            sigma,
            background_mean: mean,
        };
        if converged {
            break;
        }
        threshold = mean + kappa * sigma;
    }
    last
}

/// Median of `values`, reordering them in place. NaN for an empty slice.
pub fn median_in_place(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let len = values.len();
    let mid = len / 2;
    let (lower, upper, _) = values.select_nth_unstable_by(mid, f64::total_cmp);
    let upper = *upper;
    if len % 2 == 0 {
        let lower_max = lower.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        (lower_max + upper) / 2.0
    } else {
        upper
    }
}

pub fn median(values: &[f64]) -> f64 {
    median_in_place(&mut values.to_vec())
}
