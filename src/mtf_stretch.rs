/// Midtones transfer function auto-stretch
use serde::{Deserialize, Serialize};

use crate::image_analysis::{max_value_for_bit_depth, ImageStatistics};

/// MAD to sigma for a normal distribution
const MAD_TO_SIGMA: f64 = 1.4826;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StretchParameters {
    /// Target histogram median position
    pub factor: f64,
    /// Shadow clipping in MAD units
    pub black_clipping: f64,
}

impl Default for StretchParameters {
    fn default() -> Self {
        Self {
            factor: 0.2,
            black_clipping: -2.8,
        }
    }
}

/// Stretch `data` so its median lands near `params.factor`; output spans the
/// full 16-bit range
pub fn stretch_image(
    data: &[u16],
    statistics: &ImageStatistics,
    params: &StretchParameters,
    bit_depth: u8,
) -> Vec<u16> {
    let map = stretch_map(statistics, params, bit_depth);
    data.iter().map(|&pixel| map[pixel as usize]).collect()
}

fn stretch_map(statistics: &ImageStatistics, params: &StretchParameters, bit_depth: u8) -> Vec<u16> {
    let max_val = max_value_for_bit_depth(bit_depth);
    let median = statistics.median / max_val;
    let mad = statistics.mad / max_val;

    let (shadows, midtones, highlights) = if median > 0.5 {
        // Inverted or overexposed
        let highlights = median - params.black_clipping * mad * MAD_TO_SIGMA;
        let midtones = midtones_transfer_function(params.factor, 1.0 - (highlights - median));
        (0.0, midtones, highlights)
    } else {
        let shadows = median + params.black_clipping * mad * MAD_TO_SIGMA;
        let midtones = midtones_transfer_function(params.factor, median - shadows);
        (shadows, midtones, 1.0)
    };
    tracing::trace!(
        "MTF: median={:.5} mad={:.5} shadows={:.5} midtones={:.5}",
        median,
        mad,
        shadows,
        midtones
    );

    (0..=u16::MAX)
        .map(|i| {
            let value = i as f64 / max_val;
            let input = (1.0 - highlights + value - shadows).clamp(0.0, 1.0);
            denormalize(midtones_transfer_function(midtones, input))
        })
        .collect()
}

fn denormalize(value: f64) -> u16 {
    (value.clamp(0.0, 1.0) * 65535.0).round() as u16
}

pub fn midtones_transfer_function(midtone_balance: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    (midtone_balance - 1.0) * x / ((2.0 * midtone_balance - 1.0) * x - midtone_balance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_midtones_transfer_function() {
        assert_eq!(midtones_transfer_function(0.5, 0.0), 0.0);
        assert_eq!(midtones_transfer_function(0.5, 1.0), 1.0);
        assert_eq!(midtones_transfer_function(0.5, 0.5), 0.5);

        let mtf = midtones_transfer_function(0.5, 0.25);
        assert!(mtf > 0.0 && mtf < 0.5);
        // Balance below one half lifts the midtones
        assert!(midtones_transfer_function(0.1, 0.25) > 0.25);
    }

    #[test]
    fn test_stretch_is_monotonic() {
        let data: Vec<u16> = (0..4096u16).map(|v| v * 16).collect();
        let stats = ImageStatistics::calculate(&data, 64, 64);
        let stretched = stretch_image(&data, &stats, &StretchParameters::default(), 16);
        assert!(stretched.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_denormalize() {
        assert_eq!(denormalize(0.0), 0);
        assert_eq!(denormalize(1.0), 65535);
        assert!((denormalize(0.5) as i32 - 32768).abs() <= 1);
    }
}
