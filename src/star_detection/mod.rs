/// Star detection and half-flux radius measurement
///
/// Pipeline over a normalized copy of the frame:
/// - optional hot pixel suppression and noise reduction
/// - structure map (image minus a wide blur) with optional dilation
/// - kappa-sigma noise estimate and binarization
/// - scanline connected components
/// - ordered candidate rejection, barycenter and HFR
///
/// Detection is a pure function of the pixels and parameters.
pub mod measure;
pub mod noise;
pub mod preprocess;
pub mod scan;

use serde::{Deserialize, Serialize};

use crate::image_analysis::PreparedImage;
use crate::psf_fitting::{PsfFitter, PsfModel, PsfSeed, PsfType};
use measure::{measure_candidate, MeasureImage, Rejection};
pub use noise::NoiseEstimate;
pub use scan::Rect;

/// Lowest binarization threshold, one 16-bit step
const MIN_STRUCTURE_THRESHOLD: f64 = 1.0 / 65535.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StarDetectorParams {
    pub hotpixel_filtering: bool,
    /// Normalized deviation from the 3x3 median that marks a hot pixel
    pub hotpixel_threshold: f64,
    /// Gaussian noise reduction radius; 0 disables it
    pub noise_reduction_radius: usize,
    /// Measure stars on the noise-reduced image instead of the original
    pub star_measurement_noise_reduction: bool,
    /// Structure map blur radius is `1 + 2^structure_layers`
    pub structure_layers: usize,
    pub structure_dilation_count: usize,
    pub structure_dilation_size: usize,
    pub noise_clipping_multiplier: f64,
    pub minimum_star_bounding_box_size: usize,
    /// Minimum pixel count over bounding box area
    pub max_distortion: f64,
    pub background_box_expansion: usize,
    /// Minimum `(peak - background) / noise`
    pub sensitivity: f64,
    /// Reject as too flat when the star median reaches this fraction of the
    /// peak, both measured above background:
    /// `star_median - background >= peak_response * (peak - background)`
    pub peak_response: f64,
    /// Normalized peak at or above which a star counts as saturated
    pub saturation_threshold: f64,
    pub min_hfr: f64,
    pub psf_type: PsfType,
}

impl Default for StarDetectorParams {
    fn default() -> Self {
        Self {
            hotpixel_filtering: true,
            hotpixel_threshold: 0.001,
            noise_reduction_radius: 0,
            star_measurement_noise_reduction: false,
            structure_layers: 4,
            structure_dilation_count: 0,
            structure_dilation_size: 3,
            noise_clipping_multiplier: 4.0,
            minimum_star_bounding_box_size: 5,
            max_distortion: 0.5,
            background_box_expansion: 3,
            sensitivity: 10.0,
            peak_response: 0.75,
            saturation_threshold: 1.0,
            min_hfr: 1.5,
            psf_type: PsfType::None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Star {
    pub center_x: f64,
    pub center_y: f64,
    pub bounding_box: Rect,
    /// Normalized local background
    pub background: f64,
    pub mean_brightness: f64,
    pub peak: f64,
    pub hfr: f64,
    pub pixel_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub psf: Option<PsfModel>,
}

/// Per-pass candidate counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StarDetectorMetrics {
    pub candidates: usize,
    pub too_small: usize,
    pub on_border: usize,
    pub too_distorted: usize,
    pub degenerate: usize,
    pub saturated: usize,
    pub low_sensitivity: usize,
    pub uneven: usize,
    pub too_flat: usize,
    pub hfr_too_low: usize,
    pub hfr_failed: usize,
    pub detected: usize,
}

impl StarDetectorMetrics {
    fn record(&mut self, rejection: Rejection) {
        let counter = match rejection {
            Rejection::TooSmall => &mut self.too_small,
            Rejection::OnBorder => &mut self.on_border,
            Rejection::TooDistorted => &mut self.too_distorted,
            Rejection::Degenerate => &mut self.degenerate,
            Rejection::Saturated => &mut self.saturated,
            Rejection::LowSensitivity => &mut self.low_sensitivity,
            Rejection::Uneven => &mut self.uneven,
            Rejection::TooFlat => &mut self.too_flat,
            Rejection::HfrTooLow => &mut self.hfr_too_low,
            Rejection::HfrFailed => &mut self.hfr_failed,
        };
        *counter += 1;
    }

    pub fn rejected(&self) -> usize {
        self.candidates - self.detected
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StarDetectionResult {
    pub stars: Vec<Star>,
    pub metrics: StarDetectorMetrics,
    pub noise: NoiseEstimate,
    pub threshold: f64,
}

impl StarDetectionResult {
    /// Mean and standard deviation of the HFR of the `brightest` brightest
    /// stars, all stars when `brightest` is 0. `None` without stars.
    pub fn hfr_stats(&self, brightest: usize) -> Option<(f64, f64)> {
        if self.stars.is_empty() {
            return None;
        }
        let mut stars: Vec<&Star> = self.stars.iter().collect();
        if brightest > 0 && brightest < stars.len() {
            stars.sort_by(|a, b| b.mean_brightness.total_cmp(&a.mean_brightness));
            stars.truncate(brightest);
        }
        let n = stars.len() as f64;
        let mean = stars.iter().map(|s| s.hfr).sum::<f64>() / n;
        let variance = stars.iter().map(|s| (s.hfr - mean).powi(2)).sum::<f64>() / n;
        Some((mean, variance.sqrt()))
    }
}

pub fn detect(image: &PreparedImage, params: &StarDetectorParams) -> StarDetectionResult {
    detect_stars(&image.data, image.width, image.height, image.bit_depth, params)
}

pub fn detect_stars(
    data: &[u16],
    width: usize,
    height: usize,
    bit_depth: u8,
    params: &StarDetectorParams,
) -> StarDetectionResult {
    let mut src = preprocess::normalize(data, bit_depth);
    if params.hotpixel_filtering {
        src = preprocess::hotpixel_filter(&src, width, height, params.hotpixel_threshold);
    }

    let denoised = if params.noise_reduction_radius > 0 {
        let radius = params.noise_reduction_radius;
        Some(preprocess::gaussian_blur(
            &src,
            width,
            height,
            radius,
            radius as f64 / 2.0,
        ))
    } else {
        None
    };
    let detection_image: &[f64] = denoised.as_deref().unwrap_or(&src);
    let measure_data: &[f64] = if params.star_measurement_noise_reduction {
        detection_image
    } else {
        &src
    };

    let mut structure =
        preprocess::structure_map(detection_image, width, height, params.structure_layers);
    for _ in 0..params.structure_dilation_count {
        structure = preprocess::dilate(&structure, width, height, params.structure_dilation_size);
    }

    let noise = noise::kappa_sigma(&src, params.noise_clipping_multiplier);
    let threshold = (noise::median(&structure) + params.noise_clipping_multiplier * noise.sigma)
        .max(MIN_STRUCTURE_THRESHOLD);
    tracing::debug!(
        "Star detection: noise sigma {:.6}, background {:.5}, threshold {:.6}",
        noise.sigma,
        noise.background_mean,
        threshold
    );

    let mut mask: Vec<bool> = structure.iter().map(|&v| v > threshold).collect();
    let candidates = scan::find_candidates(&mut mask, width, height);

    let image = MeasureImage {
        data: measure_data,
        width,
        height,
    };
    let fitter = PsfFitter::new(params.psf_type);
    let mut metrics = StarDetectorMetrics {
        candidates: candidates.len(),
        ..Default::default()
    };
    let mut stars = Vec::new();

    for candidate in &candidates {
        match measure_candidate(candidate, &image, &noise, params) {
            Ok(mut star) => {
                if params.psf_type != PsfType::None {
                    let seed = PsfSeed {
                        center: (star.center_x, star.center_y),
                        bbox_width: star.bounding_box.width as f64,
                        bbox_height: star.bounding_box.height as f64,
                        background: star.background,
                        peak: star.peak,
                    };
                    star.psf = fitter.fit_star(measure_data, width, height, &seed);
                }
                stars.push(star);
            }
            Err(rejection) => metrics.record(rejection),
        }
    }
    metrics.detected = stars.len();
    tracing::debug!("Star detection metrics: {:?}", metrics);

    StarDetectionResult {
        stars,
        metrics,
        noise,
        threshold,
    }
}
