/// Image conditioning ahead of candidate segmentation
use crate::image_analysis::max_value_for_bit_depth;

/// Scale raw samples into [0, 1]
pub fn normalize(data: &[u16], bit_depth: u8) -> Vec<f64> {
    let max = max_value_for_bit_depth(bit_depth);
    data.iter().map(|&v| (v as f64 / max).min(1.0)).collect()
}

/// 3x3 median filter that only replaces pixels deviating from their
/// neighborhood median by more than `threshold`. Border pixels are kept.
pub fn hotpixel_filter(src: &[f64], width: usize, height: usize, threshold: f64) -> Vec<f64> {
    let mut result = src.to_vec();
    if width < 3 || height < 3 {
        return result;
    }

    let mut neighborhood = [0.0f64; 9];
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let mut k = 0;
            for ny in y - 1..=y + 1 {
                for nx in x - 1..=x + 1 {
                    neighborhood[k] = src[ny * width + nx];
                    k += 1;
                }
            }
            neighborhood.sort_unstable_by(f64::total_cmp);
            let median = neighborhood[4];
            let idx = y * width + x;
            if (src[idx] - median).abs() > threshold {
                result[idx] = median;
            }
        }
    }
    result
}

fn gaussian_kernel(radius: usize, sigma: f64) -> Vec<f64> {
    let sigma = sigma.max(1e-3);
    let mut kernel: Vec<f64> = (0..=2 * radius)
        .map(|i| {
            let d = i as f64 - radius as f64;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = kernel.iter().sum();
    for k in kernel.iter_mut() {
        *k /= sum;
    }
    kernel
}

/// Separable Gaussian blur with edge clamping
pub fn gaussian_blur(src: &[f64], width: usize, height: usize, radius: usize, sigma: f64) -> Vec<f64> {
    if radius == 0 || src.is_empty() {
        return src.to_vec();
    }
    let kernel = gaussian_kernel(radius, sigma);
    let r = radius as isize;
    let clamp = |v: isize, max: usize| v.clamp(0, max as isize - 1) as usize;

    let mut horizontal = vec![0.0; src.len()];
    for y in 0..height {
        let row = y * width;
        for x in 0..width {
            horizontal[row + x] = kernel
                .iter()
                .enumerate()
                .map(|(k, w)| w * src[row + clamp(x as isize + k as isize - r, width)])
                .sum();
        }
    }

    let mut result = vec![0.0; src.len()];
    for y in 0..height {
        for x in 0..width {
            result[y * width + x] = kernel
                .iter()
                .enumerate()
                .map(|(k, w)| w * horizontal[clamp(y as isize + k as isize - r, height) * width + x])
                .sum();
        }
    }
    result
}

/// Kernel radius of the large-scale background removed from the structure map
pub fn structure_radius(layers: usize) -> usize {
    1 + (1usize << layers.min(10))
}

/// Emphasize star-scale features: the image minus a wide blur, clipped to [0, 1]
pub fn structure_map(src: &[f64], width: usize, height: usize, layers: usize) -> Vec<f64> {
    let radius = structure_radius(layers);
    let blurred = gaussian_blur(src, width, height, radius, radius as f64 / 3.0);
    src.iter()
        .zip(&blurred)
        .map(|(v, b)| (v - b).clamp(0.0, 1.0))
        .collect()
}

/// Grayscale dilation with an elliptical structuring element of odd `size`
pub fn dilate(map: &[f64], width: usize, height: usize, size: usize) -> Vec<f64> {
    let half = (size.max(3) / 2) as isize;
    let offsets: Vec<(isize, isize)> = (-half..=half)
        .flat_map(|dy| (-half..=half).map(move |dx| (dx, dy)))
        .filter(|(dx, dy)| dx * dx + dy * dy <= half * half)
        .collect();

    let mut result = vec![0.0; map.len()];
    for y in 0..height as isize {
        for x in 0..width as isize {
            let mut max = 0.0f64;
            for (dx, dy) in &offsets {
                let (nx, ny) = (x + dx, y + dy);
                if nx >= 0 && ny >= 0 && nx < width as isize && ny < height as isize {
                    max = max.max(map[ny as usize * width + nx as usize]);
                }
            }
            result[y as usize * width + x as usize] = max;
        }
    }
    result
}
