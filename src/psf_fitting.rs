/// PSF (point spread function) fitting
///
/// Elliptical Gaussian and Moffat (beta = 4) profiles fitted around a detected
/// star with the shared Levenberg-Marquardt solver. Used for tilt and
/// aberration inspection; the focus measure itself is the HFR.
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::solver::{LevenbergMarquardt, Model};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PsfType {
    #[default]
    None,
    Gaussian,
    /// Moffat profile with beta = 4
    Moffat4,
}

impl std::str::FromStr for PsfType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(PsfType::None),
            "gaussian" => Ok(PsfType::Gaussian),
            "moffat" | "moffat4" | "moffat_4" => Ok(PsfType::Moffat4),
            _ => Err(format!("Unknown PSF type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PsfModel {
    pub psf_type: PsfType,
    /// Peak above background
    pub amplitude: f64,
    pub background: f64,
    /// Offset from the star centroid
    pub x0: f64,
    pub y0: f64,
    pub sigma_x: f64,
    pub sigma_y: f64,
    /// Rotation in radians
    pub theta: f64,
    pub r_squared: f64,
    pub rmse: f64,
    pub fwhm: f64,
    /// 0 for a round star
    pub eccentricity: f64,
}

impl PsfModel {
    fn calculate_fwhm(&self) -> f64 {
        let avg_sigma = (self.sigma_x + self.sigma_y) / 2.0;
        match self.psf_type {
            PsfType::Gaussian => avg_sigma * 2.0 * (2.0 * 2.0_f64.ln()).sqrt(),
            PsfType::Moffat4 => avg_sigma * 2.0 * (2.0_f64.powf(0.25) - 1.0).sqrt(),
            PsfType::None => 0.0,
        }
    }

    fn calculate_eccentricity(&self) -> f64 {
        let a = self.sigma_x.max(self.sigma_y);
        let b = self.sigma_x.min(self.sigma_y);
        if a > 0.0 {
            (1.0 - (b / a).powi(2)).sqrt()
        } else {
            0.0
        }
    }
}

/// Rotated coordinates relative to `(x0, y0)`
fn rotate(x: f64, y: f64, x0: f64, y0: f64, theta: f64) -> (f64, f64, f64, f64) {
    let (sin_t, cos_t) = theta.sin_cos();
    let dx = x - x0;
    let dy = y - y0;
    (
        dx * cos_t + dy * sin_t,
        -dx * sin_t + dy * cos_t,
        cos_t,
        sin_t,
    )
}

/// Params `[A, B, x0, y0, sigma_x, sigma_y, theta]`
struct GaussianPsf;

impl Model for GaussianPsf {
    type Input = (f64, f64);

    fn value(&self, &(x, y): &(f64, f64), p: &[f64]) -> f64 {
        let (xp, yp, _, _) = rotate(x, y, p[2], p[3], p[6]);
        let arg = -(xp * xp / (2.0 * p[4] * p[4]) + yp * yp / (2.0 * p[5] * p[5]));
        p[1] + p[0] * arg.exp()
    }

    fn gradient(&self, &(x, y): &(f64, f64), p: &[f64], grad: &mut [f64]) {
        let a = p[0];
        let (xp, yp, cos_t, sin_t) = rotate(x, y, p[2], p[3], p[6]);
        let sx2 = p[4] * p[4];
        let sy2 = p[5] * p[5];
        let e = (-(xp * xp / (2.0 * sx2) + yp * yp / (2.0 * sy2))).exp();

        grad[0] = e;
        grad[1] = 1.0;
        grad[2] = a * e * (xp * cos_t / sx2 - yp * sin_t / sy2);
        grad[3] = a * e * (xp * sin_t / sx2 + yp * cos_t / sy2);
        grad[4] = a * e * xp * xp / (sx2 * p[4]);
        grad[5] = a * e * yp * yp / (sy2 * p[5]);
        grad[6] = -a * e * xp * yp * (1.0 / sx2 - 1.0 / sy2);
    }
}

/// Same params as [`GaussianPsf`] with sigma as the Moffat core width
struct Moffat4Psf;

const MOFFAT_BETA: f64 = 4.0;

impl Model for Moffat4Psf {
    type Input = (f64, f64);

    fn value(&self, &(x, y): &(f64, f64), p: &[f64]) -> f64 {
        let (xp, yp, _, _) = rotate(x, y, p[2], p[3], p[6]);
        let d = 1.0 + xp * xp / (p[4] * p[4]) + yp * yp / (p[5] * p[5]);
        p[1] + p[0] / d.powf(MOFFAT_BETA)
    }

    fn gradient(&self, &(x, y): &(f64, f64), p: &[f64], grad: &mut [f64]) {
        let a = p[0];
        let (u, v) = (p[4], p[5]);
        let (xp, yp, cos_t, sin_t) = rotate(x, y, p[2], p[3], p[6]);
        let u2 = u * u;
        let v2 = v * v;
        let d = 1.0 + xp * xp / u2 + yp * yp / v2;
        let outer = -a * MOFFAT_BETA * d.powf(-MOFFAT_BETA - 1.0);

        grad[0] = d.powf(-MOFFAT_BETA);
        grad[1] = 1.0;
        // dd/dx0 = -2 xp cos / u² + 2 yp sin / v²
        grad[2] = outer * (-2.0 * xp * cos_t / u2 + 2.0 * yp * sin_t / v2);
        grad[3] = outer * (-2.0 * xp * sin_t / u2 - 2.0 * yp * cos_t / v2);
        grad[4] = outer * (-2.0 * xp * xp / (u2 * u));
        grad[5] = outer * (-2.0 * yp * yp / (v2 * v));
        grad[6] = outer * (2.0 * xp * yp * (1.0 / u2 - 1.0 / v2));
    }
}

/// Bilinear sample of a row-major image, clamped to its bounds
pub fn bilinear_sample(data: &[f64], width: usize, height: usize, x: f64, y: f64) -> f64 {
    let x = x.clamp(0.0, (width - 1) as f64);
    let y = y.clamp(0.0, (height - 1) as f64);

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let p0 = data[y0 * width + x0] * (1.0 - fx) + data[y0 * width + x1] * fx;
    let p1 = data[y1 * width + x0] * (1.0 - fx) + data[y1 * width + x1] * fx;
    p0 * (1.0 - fy) + p1 * fy
}

/// Sub-pixel samples around a star, positions relative to its centroid
fn extract_roi(
    data: &[f64],
    width: usize,
    height: usize,
    center: (f64, f64),
    roi_size: f64,
    spacing: f64,
) -> (Vec<(f64, f64)>, Vec<f64>) {
    let half = roi_size / 2.0;
    let steps = (roi_size / spacing).floor() as usize;
    let mut positions = Vec::with_capacity((steps + 1) * (steps + 1));
    let mut values = Vec::with_capacity((steps + 1) * (steps + 1));

    for j in 0..=steps {
        let dy = -half + j as f64 * spacing;
        for i in 0..=steps {
            let dx = -half + i as f64 * spacing;
            let sx = center.0 + dx;
            let sy = center.1 + dy;
            if sx >= 0.0 && sx < width as f64 && sy >= 0.0 && sy < height as f64 {
                positions.push((dx, dy));
                values.push(bilinear_sample(data, width, height, sx, sy));
            }
        }
    }
    (positions, values)
}

/// Star geometry the fitter seeds from
#[derive(Debug, Clone, Copy)]
pub struct PsfSeed {
    pub center: (f64, f64),
    pub bbox_width: f64,
    pub bbox_height: f64,
    pub background: f64,
    pub peak: f64,
}

pub struct PsfFitter {
    psf_type: PsfType,
    sample_spacing: f64,
}

impl PsfFitter {
    pub fn new(psf_type: PsfType) -> Self {
        Self {
            psf_type,
            sample_spacing: 0.5,
        }
    }

    /// Fit the configured profile to a star in normalized image data.
    /// `None` when PSF fitting is disabled or the fit cannot start.
    pub fn fit_star(
        &self,
        data: &[f64],
        width: usize,
        height: usize,
        seed: &PsfSeed,
    ) -> Option<PsfModel> {
        if self.psf_type == PsfType::None {
            return None;
        }

        // Sample twice the star box so the wings and background constrain the fit
        let roi_size = (seed.bbox_width.max(seed.bbox_height) * 2.0).clamp(8.0, 64.0);
        let (positions, values) = extract_roi(
            data,
            width,
            height,
            seed.center,
            roi_size,
            self.sample_spacing,
        );
        if positions.len() < 10 {
            return None;
        }

        let amplitude = (seed.peak - seed.background).max(f64::EPSILON);
        let initial = [
            amplitude,
            seed.background,
            0.0,
            0.0,
            seed.bbox_width / 3.0,
            seed.bbox_height / 3.0,
            0.0,
        ];
        let dx_limit = seed.bbox_width / 8.0;
        let dy_limit = seed.bbox_height / 8.0;
        let sigma_max = seed.bbox_width.hypot(seed.bbox_height) / 2.0;
        let lower = [0.0, 0.0, -dx_limit, -dy_limit, 0.1, 0.1, -PI / 2.0];
        let upper = [
            2.0 * amplitude,
            seed.peak.max(f64::EPSILON),
            dx_limit,
            dy_limit,
            sigma_max,
            sigma_max,
            PI / 2.0,
        ];

        let solver = LevenbergMarquardt::default().with_max_iterations(100);
        let result = match self.psf_type {
            PsfType::Gaussian => solver.fit(
                &GaussianPsf,
                &positions,
                &values,
                None,
                &initial,
                &lower,
                &upper,
            ),
            PsfType::Moffat4 => solver.fit(
                &Moffat4Psf,
                &positions,
                &values,
                None,
                &initial,
                &lower,
                &upper,
            ),
            PsfType::None => return None,
        };
        let solution = match result {
            Ok(solution) => solution,
            Err(e) => {
                tracing::debug!("PSF fit failed at {:?}: {}", seed.center, e);
                return None;
            }
        };
        let p = &solution.params;

        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let tss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
        let rss = solution.sum_squared_error;
        let r_squared = if tss > 0.0 { 1.0 - rss / tss } else { 0.0 };

        let mut model = PsfModel {
            psf_type: self.psf_type,
            amplitude: p[0],
            background: p[1],
            x0: p[2],
            y0: p[3],
            sigma_x: p[4].abs(),
            sigma_y: p[5].abs(),
            theta: p[6],
            r_squared,
            rmse: (rss / positions.len() as f64).sqrt(),
            fwhm: 0.0,
            eccentricity: 0.0,
        };
        model.fwhm = model.calculate_fwhm();
        model.eccentricity = model.calculate_eccentricity();
        Some(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gaussian_star(size: usize, cx: f64, cy: f64, sx: f64, sy: f64) -> Vec<f64> {
        let mut data = vec![0.1; size * size];
        for y in 0..size {
            for x in 0..size {
                let dx = x as f64 - cx;
                let dy = y as f64 - cy;
                data[y * size + x] +=
                    0.5 * (-(dx * dx / (2.0 * sx * sx) + dy * dy / (2.0 * sy * sy))).exp();
            }
        }
        data
    }

    #[test]
    fn test_gaussian_psf_recovers_sigma() {
        let data = gaussian_star(48, 24.0, 24.0, 2.0, 2.0);
        let seed = PsfSeed {
            center: (24.0, 24.0),
            bbox_width: 11.0,
            bbox_height: 11.0,
            background: 0.1,
            peak: 0.6,
        };
        let model = PsfFitter::new(PsfType::Gaussian)
            .fit_star(&data, 48, 48, &seed)
            .unwrap();
        assert!((model.sigma_x - 2.0).abs() < 0.15, "sigma_x {}", model.sigma_x);
        assert!((model.sigma_y - 2.0).abs() < 0.15, "sigma_y {}", model.sigma_y);
        assert!(model.r_squared > 0.99);
        assert!(model.eccentricity < 0.3);
        assert!((model.fwhm - 2.0 * 2.3548).abs() < 0.4);
    }

    #[test]
    fn test_disabled_psf_returns_none() {
        let data = gaussian_star(32, 16.0, 16.0, 2.0, 2.0);
        let seed = PsfSeed {
            center: (16.0, 16.0),
            bbox_width: 9.0,
            bbox_height: 9.0,
            background: 0.1,
            peak: 0.6,
        };
        assert!(PsfFitter::new(PsfType::None)
            .fit_star(&data, 32, 32, &seed)
            .is_none());
    }

    #[test]
    fn test_moffat_gradient_matches_numeric() {
        let params = [0.5, 0.1, 0.2, -0.1, 2.0, 2.5, 0.3];
        let input = (1.3, -0.7);
        let mut analytic = [0.0; 7];
        Moffat4Psf.gradient(&input, &params, &mut analytic);

        let mut probe = params;
        for j in 0..7 {
            let h = 1e-6;
            probe[j] = params[j] + h;
            let up = Moffat4Psf.value(&input, &probe);
            probe[j] = params[j] - h;
            let down = Moffat4Psf.value(&input, &probe);
            probe[j] = params[j];
            let numeric = (up - down) / (2.0 * h);
            assert!(
                (analytic[j] - numeric).abs() < 1e-5,
                "param {}: analytic {} numeric {}",
                j,
                analytic[j],
                numeric
            );
        }
    }

    #[test]
    fn test_bilinear_sample_midpoint() {
        let data = vec![0.0, 1.0, 2.0, 3.0];
        assert!((bilinear_sample(&data, 2, 2, 0.5, 0.5) - 1.5).abs() < 1e-12);
    }
}
