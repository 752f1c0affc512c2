use anyhow::{Context, Result};
use image::{ImageBuffer, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_circle_mut};
use std::path::Path;

use crate::image_analysis::PreparedImage;
use crate::mtf_stretch::{stretch_image, StretchParameters};
use crate::star_detection::StarDetectionResult;

pub const STAR_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

/// Stretched grayscale rendering of `image` with a circle around each detected
/// star, sized by its HFR
pub fn create_annotated_image(
    image: &PreparedImage,
    detection: &StarDetectionResult,
    color: Rgb<u8>,
) -> Result<RgbImage> {
    let stretched;
    let display: &[u16] = if image.stretched {
        &image.data
    } else {
        stretched = stretch_image(
            &image.data,
            &image.statistics,
            &StretchParameters::default(),
            image.bit_depth,
        );
        &stretched
    };

    let gray: Vec<u8> = display
        .iter()
        .flat_map(|&v| {
            let value = (v >> 8) as u8;
            [value, value, value]
        })
        .collect();
    let mut rgb_image =
        ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(image.width as u32, image.height as u32, gray)
            .context("Failed to create annotation buffer")?;

    for star in &detection.stars {
        let center = (star.center_x.round() as i32, star.center_y.round() as i32);
        // 2.5 HFR, at least 5 pixels
        let radius = (star.hfr * 2.5).max(5.0) as i32;
        draw_hollow_circle_mut(&mut rgb_image, center, radius, color);
        if radius < 8 {
            draw_filled_circle_mut(&mut rgb_image, center, 1, color);
        }
    }

    Ok(rgb_image)
}

pub fn save_annotated_image(
    image: &PreparedImage,
    detection: &StarDetectionResult,
    path: &Path,
) -> Result<()> {
    let annotated = create_annotated_image(image, detection, STAR_COLOR)?;
    annotated
        .save(path)
        .with_context(|| format!("Failed to save annotated image to: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_analysis::{ImageMetadata, ImageStatistics};
    use crate::star_detection::{NoiseEstimate, Rect, Star, StarDetectorMetrics};

    #[test]
    fn test_circle_drawn_around_star() {
        let (width, height) = (40, 40);
        let data = vec![4000u16; width * height];
        let image = PreparedImage {
            width,
            height,
            bit_depth: 16,
            statistics: ImageStatistics::calculate(&data, width, height),
            data,
            metadata: ImageMetadata::default(),
            stretched: true,
        };
        let detection = StarDetectionResult {
            stars: vec![Star {
                center_x: 20.0,
                center_y: 20.0,
                bounding_box: Rect {
                    x: 17,
                    y: 17,
                    width: 7,
                    height: 7,
                },
                background: 0.06,
                mean_brightness: 0.3,
                peak: 0.5,
                hfr: 2.0,
                pixel_count: 40,
                psf: None,
            }],
            metrics: StarDetectorMetrics::default(),
            noise: NoiseEstimate {
                sigma: 0.001,
                background_mean: 0.06,
            },
            threshold: 0.004,
        };

        let annotated = create_annotated_image(&image, &detection, STAR_COLOR).unwrap();
        assert_eq!(annotated.dimensions(), (40, 40));
        // Radius 5 ring passes through (25, 20); the center dot marks (20, 20)
        assert_eq!(*annotated.get_pixel(25, 20), STAR_COLOR);
        assert_eq!(*annotated.get_pixel(20, 20), STAR_COLOR);
        assert_ne!(*annotated.get_pixel(2, 2), STAR_COLOR);
    }
}
