/// Candidate validation, centroiding and half-flux radius
use super::noise::{median_in_place, NoiseEstimate};
use super::scan::{Candidate, Rect};
use super::{Star, StarDetectorParams};

/// Fraction of the peak the pixel under the centroid must reach
const CENTER_BRIGHTNESS_RATIO: f64 = 0.85;
/// Pixels below `background + k * sigma` carry no centroid weight
const BARYCENTER_STRETCH_SIGMA: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    TooSmall,
    OnBorder,
    TooDistorted,
    Degenerate,
    Saturated,
    LowSensitivity,
    Uneven,
    TooFlat,
    HfrTooLow,
    HfrFailed,
}

/// Normalized image the candidates are measured against
pub struct MeasureImage<'a> {
    pub data: &'a [f64],
    pub width: usize,
    pub height: usize,
}

impl MeasureImage<'_> {
    fn at(&self, x: usize, y: usize) -> f64 {
        self.data[y * self.width + x]
    }
}

/// Run the rejection tests in order and measure the survivors
pub fn measure_candidate(
    candidate: &Candidate,
    image: &MeasureImage,
    noise: &NoiseEstimate,
    params: &StarDetectorParams,
) -> Result<Star, Rejection> {
    let bounds = candidate.bounds;
    let min_size = params.minimum_star_bounding_box_size;
    if bounds.width < min_size || bounds.height < min_size {
        return Err(Rejection::TooSmall);
    }

    if bounds.x == 0
        || bounds.y == 0
        || bounds.right() >= image.width - 1
        || bounds.bottom() >= image.height - 1
    {
        return Err(Rejection::OnBorder);
    }

    let density = candidate.pixels.len() as f64 / bounds.area() as f64;
    if density < params.max_distortion {
        return Err(Rejection::TooDistorted);
    }

    let background = background_median(image, &bounds, params.background_box_expansion)
        .unwrap_or(noise.background_mean);
    let values: Vec<f64> = candidate
        .pixels
        .iter()
        .map(|&(x, y)| image.at(x, y))
        .collect();
    let peak = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let (center_x, center_y) =
        barycenter(&candidate.pixels, &values, background + BARYCENTER_STRETCH_SIGMA * noise.sigma)
            .ok_or(Rejection::Degenerate)?;

    if peak >= params.saturation_threshold {
        return Err(Rejection::Saturated);
    }

    if (peak - background) / noise.sigma.max(f64::EPSILON) <= params.sensitivity {
        return Err(Rejection::LowSensitivity);
    }

    let cx = (center_x.round().max(0.0) as usize).min(image.width - 1);
    let cy = (center_y.round().max(0.0) as usize).min(image.height - 1);
    if image.at(cx, cy) < CENTER_BRIGHTNESS_RATIO * peak {
        return Err(Rejection::Uneven);
    }

    let mut sorted = values.clone();
    let star_median = median_in_place(&mut sorted);
    if star_median - background >= params.peak_response * (peak - background) {
        return Err(Rejection::TooFlat);
    }

    let hfr = half_flux_radius(image, &bounds, (center_x, center_y), background)
        .ok_or(Rejection::HfrFailed)?;
    if hfr <= params.min_hfr {
        return Err(Rejection::HfrTooLow);
    }

    Ok(Star {
        center_x,
        center_y,
        bounding_box: bounds,
        background,
        mean_brightness: values.iter().sum::<f64>() / values.len() as f64,
        peak,
        hfr,
        pixel_count: candidate.pixels.len(),
        psf: None,
    })
}

/// Median of the ring between the star box and the box grown by `expansion`
fn background_median(image: &MeasureImage, bounds: &Rect, expansion: usize) -> Option<f64> {
    let outer = bounds.expand(expansion, image.width, image.height);
    let mut ring = Vec::with_capacity(outer.area().saturating_sub(bounds.area()));
    for y in outer.y..=outer.bottom() {
        for x in outer.x..=outer.right() {
            if !bounds.contains(x, y) {
                ring.push(image.at(x, y));
            }
        }
    }
    if ring.is_empty() {
        None
    } else {
        Some(median_in_place(&mut ring))
    }
}

/// Flux-weighted centroid of the pixels above `floor`, after stretching them
/// linearly between their own minimum and maximum. `None` when no pixel
/// clears the floor or all of them are equal.
fn barycenter(pixels: &[(usize, usize)], values: &[f64], floor: f64) -> Option<(f64, f64)> {
    let included: Vec<((usize, usize), f64)> = pixels
        .iter()
        .copied()
        .zip(values.iter().copied())
        .filter(|&(_, v)| v > floor)
        .collect();
    if included.is_empty() {
        return None;
    }

    let min = included.iter().map(|&(_, v)| v).fold(f64::INFINITY, f64::min);
    let max = included.iter().map(|&(_, v)| v).fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    if range <= f64::EPSILON {
        return None;
    }

    let (mut sum_w, mut sum_x, mut sum_y) = (0.0, 0.0, 0.0);
    for &((x, y), v) in &included {
        let w = (v - min) / range;
        sum_w += w;
        sum_x += w * x as f64;
        sum_y += w * y as f64;
    }
    Some((sum_x / sum_w, sum_y / sum_w))
}

/// HFR over the star box: `Σ v·d / Σ v` for background-subtracted `v > 0`
/// within the box's farthest corner from the centroid
pub fn half_flux_radius(
    image: &MeasureImage,
    bounds: &Rect,
    center: (f64, f64),
    background: f64,
) -> Option<f64> {
    let corners = [
        (bounds.x, bounds.y),
        (bounds.right(), bounds.y),
        (bounds.x, bounds.bottom()),
        (bounds.right(), bounds.bottom()),
    ];
    let max_radius = corners
        .iter()
        .map(|&(x, y)| (x as f64 - center.0).hypot(y as f64 - center.1))
        .fold(0.0, f64::max);

    let (mut sum, mut weighted) = (0.0, 0.0);
    for y in bounds.y..=bounds.bottom() {
        for x in bounds.x..=bounds.right() {
            let value = image.at(x, y) - background;
            if value <= 0.0 {
                continue;
            }
            let distance = (x as f64 - center.0).hypot(y as f64 - center.1);
            if distance <= max_radius {
                sum += value;
                weighted += value * distance;
            }
        }
    }

    if sum > 0.0 {
        let hfr = weighted / sum;
        hfr.is_finite().then_some(hfr)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_barycenter_of_symmetric_cross() {
        let pixels = vec![(5, 4), (4, 5), (5, 5), (6, 5), (5, 6)];
        let values = vec![0.5, 0.5, 1.0, 0.5, 0.5];
        let (x, y) = barycenter(&pixels, &values, 0.0).unwrap();
        assert!((x - 5.0).abs() < 1e-12);
        assert!((y - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_barycenter_degenerate_when_flat() {
        let pixels = vec![(1, 1), (2, 1), (1, 2)];
        assert!(barycenter(&pixels, &[0.4, 0.4, 0.4], 0.1).is_none());
        assert!(barycenter(&pixels, &[0.05, 0.05, 0.06], 0.1).is_none());
    }

    #[test]
    fn test_hfr_of_single_bright_ring() {
        // Four pixels at distance 1 around the centroid
        let mut data = vec![0.0; 25];
        for idx in [7, 11, 13, 17] {
            data[idx] = 1.0;
        }
        let image = MeasureImage {
            data: &data,
            width: 5,
            height: 5,
        };
        let bounds = Rect {
            x: 1,
            y: 1,
            width: 3,
            height: 3,
        };
        let hfr = half_flux_radius(&image, &bounds, (2.0, 2.0), 0.0).unwrap();
        assert!((hfr - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_hfr_fails_without_flux() {
        let data = vec![0.1; 25];
        let image = MeasureImage {
            data: &data,
            width: 5,
            height: 5,
        };
        let bounds = Rect {
            x: 1,
            y: 1,
            width: 3,
            height: 3,
        };
        assert!(half_flux_radius(&image, &bounds, (2.0, 2.0), 0.1).is_none());
    }
}
