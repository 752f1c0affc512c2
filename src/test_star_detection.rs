// Synthetic-image tests for the star detector. Images are noise free unless a
// test adds seeded noise, so counts and radii are exact.

#[cfg(test)]
mod tests {
    use crate::star_detection::{detect_stars, StarDetectorParams};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    /// Normalized image rendered to 16-bit samples
    struct SyntheticImage {
        width: usize,
        height: usize,
        pixels: Vec<f64>,
    }

    impl SyntheticImage {
        fn new(width: usize, height: usize, background: f64) -> Self {
            Self {
                width,
                height,
                pixels: vec![background; width * height],
            }
        }

        fn add_uniform_noise(&mut self, amplitude: f64, seed: u64) {
            let mut rng = StdRng::seed_from_u64(seed);
            for p in self.pixels.iter_mut() {
                *p += (rng.gen::<f64>() - 0.5) * 2.0 * amplitude;
            }
        }

        fn add_gaussian_star(&mut self, cx: f64, cy: f64, sigma: f64, amplitude: f64) {
            self.add_profile(cx, cy, |r| amplitude * (-(r * r) / (2.0 * sigma * sigma)).exp());
        }

        fn add_square(&mut self, x: usize, y: usize, size: usize, value: f64) {
            for py in y..y + size {
                for px in x..x + size {
                    self.pixels[py * self.width + px] = value;
                }
            }
        }

        /// Flat top of `level` out to `radius`, falling linearly to nothing at `edge`
        fn add_plateau(&mut self, cx: f64, cy: f64, radius: f64, edge: f64, level: f64) {
            self.add_profile(cx, cy, |r| {
                if r <= radius {
                    level
                } else if r < edge {
                    level * (edge - r) / (edge - radius)
                } else {
                    0.0
                }
            });
        }

        fn add_profile<F: Fn(f64) -> f64>(&mut self, cx: f64, cy: f64, profile: F) {
            for y in 0..self.height {
                for x in 0..self.width {
                    let r = (x as f64 - cx).hypot(y as f64 - cy);
                    self.pixels[y * self.width + x] += profile(r);
                }
            }
        }

        fn to_u16(&self) -> Vec<u16> {
            self.pixels
                .iter()
                .map(|&v| (v.clamp(0.0, 1.0) * 65535.0).round() as u16)
                .collect()
        }
    }

    fn clean_params() -> StarDetectorParams {
        StarDetectorParams {
            hotpixel_filtering: false,
            noise_reduction_radius: 0,
            structure_dilation_count: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_single_gaussian_star_detected() {
        let mut image = SyntheticImage::new(64, 64, 0.1);
        image.add_gaussian_star(32.0, 32.0, 2.5, 0.4);

        let result = detect_stars(&image.to_u16(), 64, 64, 16, &clean_params());
        assert_eq!(result.metrics.detected, 1, "{:?}", result.metrics);
        let star = &result.stars[0];
        assert!((star.center_x - 32.0).abs() < 0.05);
        assert!((star.center_y - 32.0).abs() < 0.05);
        assert!((star.background - 0.1).abs() < 5e-3);
        assert!(star.hfr > 1.5 && star.hfr < 5.0, "hfr {}", star.hfr);
    }

    #[test]
    fn test_too_small_candidate_rejected() {
        let mut image = SyntheticImage::new(64, 64, 0.1);
        image.add_square(30, 30, 2, 0.6);

        let result = detect_stars(&image.to_u16(), 64, 64, 16, &clean_params());
        assert_eq!(result.metrics.too_small, 1, "{:?}", result.metrics);
        assert_eq!(result.metrics.candidates, 1);
        assert!(result.stars.is_empty());
    }

    #[test]
    fn test_saturated_star_rejected() {
        let mut image = SyntheticImage::new(64, 64, 0.1);
        image.add_gaussian_star(32.0, 32.0, 2.5, 2.0);

        let result = detect_stars(&image.to_u16(), 64, 64, 16, &clean_params());
        assert_eq!(result.metrics.saturated, 1, "{:?}", result.metrics);
        assert_eq!(result.metrics.candidates, 1);
        assert!(result.stars.is_empty());
    }

    #[test]
    fn test_flat_topped_source_rejected() {
        let mut image = SyntheticImage::new(64, 64, 0.1);
        image.add_plateau(32.0, 32.0, 6.0, 8.0, 0.4);

        let result = detect_stars(&image.to_u16(), 64, 64, 16, &clean_params());
        assert_eq!(result.metrics.too_flat, 1, "{:?}", result.metrics);
        assert_eq!(result.metrics.candidates, 1);
        assert!(result.stars.is_empty());
    }

    #[test]
    fn test_border_star_rejected() {
        let mut image = SyntheticImage::new(64, 64, 0.1);
        image.add_gaussian_star(2.0, 32.0, 2.0, 0.4);

        let result = detect_stars(&image.to_u16(), 64, 64, 16, &clean_params());
        assert_eq!(result.metrics.on_border, 1, "{:?}", result.metrics);
        assert!(result.stars.is_empty());
    }

    #[test]
    fn test_flat_field_has_no_candidates() {
        let image = SyntheticImage::new(48, 48, 0.2);
        let result = detect_stars(&image.to_u16(), 48, 48, 16, &clean_params());
        assert_eq!(result.metrics.candidates, 0);
        assert!(result.stars.is_empty());
    }

    #[test]
    fn test_hfr_grows_with_blur() {
        let params = StarDetectorParams {
            min_hfr: 0.5,
            ..clean_params()
        };
        let mut last_hfr = 0.0;
        for sigma in [1.5, 2.0, 2.5, 3.0, 3.5] {
            let mut image = SyntheticImage::new(96, 96, 0.1);
            image.add_gaussian_star(48.0, 48.0, sigma, 0.4);
            let result = detect_stars(&image.to_u16(), 96, 96, 16, &params);
            assert_eq!(result.stars.len(), 1, "sigma {}: {:?}", sigma, result.metrics);
            let hfr = result.stars[0].hfr;
            assert!(
                hfr >= last_hfr,
                "HFR {} at sigma {} below previous {}",
                hfr,
                sigma,
                last_hfr
            );
            last_hfr = hfr;
        }
    }

    #[test]
    fn test_star_field_with_noise() {
        let positions = [(30.0, 30.0), (90.0, 28.0), (60.0, 64.0), (28.0, 100.0), (96.0, 98.0)];
        let mut image = SyntheticImage::new(128, 128, 0.1);
        image.add_uniform_noise(0.003, 7);
        for &(x, y) in &positions {
            image.add_gaussian_star(x, y, 2.0, 0.3);
        }

        let result = detect_stars(&image.to_u16(), 128, 128, 16, &clean_params());
        assert_eq!(result.stars.len(), positions.len(), "{:?}", result.metrics);
        for &(x, y) in &positions {
            assert!(
                result
                    .stars
                    .iter()
                    .any(|s| (s.center_x - x).abs() < 0.5 && (s.center_y - y).abs() < 0.5),
                "no star near ({}, {})",
                x,
                y
            );
        }

        let (mean, stdev) = result.hfr_stats(0).unwrap();
        assert!(mean > 1.5);
        assert!(stdev < 0.3);
        let (brightest_mean, _) = result.hfr_stats(2).unwrap();
        assert!(brightest_mean > 1.5);
    }
}
