use anyhow::Result;
use std::path::Path;

use crate::annotate::save_annotated_image;
use crate::image_analysis::{prepare_image, PrepareOptions, RawImage};
use crate::options::AutoFocusOptions;
use crate::star_detection::detect;

/// Run the star detector on a FITS file and print the result
pub fn detect_stars_in_file(
    fits_path: &Path,
    options: &AutoFocusOptions,
    json: bool,
    annotate: Option<&Path>,
    stretch: bool,
    brightest: usize,
) -> Result<()> {
    let raw = RawImage::from_fits(fits_path)?;
    tracing::info!(
        "Loaded {} ({}x{}, {} bit)",
        fits_path.display(),
        raw.width,
        raw.height,
        raw.bit_depth
    );

    let prepare = PrepareOptions {
        debayer: options.debayer,
        auto_stretch: stretch || options.auto_stretch,
        ..Default::default()
    };
    let image = prepare_image(raw, &prepare)?;
    let result = detect(&image, &options.star_detection);

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        let metrics = &result.metrics;
        println!("Stars detected: {}", metrics.detected);
        println!("Candidates:     {}", metrics.candidates);
        println!(
            "Rejected:       {} (small {}, border {}, distorted {}, degenerate {}, saturated {}, low signal {}, uneven {}, flat {}, HFR {})",
            metrics.rejected(),
            metrics.too_small,
            metrics.on_border,
            metrics.too_distorted,
            metrics.degenerate,
            metrics.saturated,
            metrics.low_sensitivity,
            metrics.uneven,
            metrics.too_flat,
            metrics.hfr_too_low + metrics.hfr_failed
        );
        println!(
            "Noise sigma:    {:.6} (threshold {:.6})",
            result.noise.sigma, result.threshold
        );
        match result.hfr_stats(brightest) {
            Some((mean, stdev)) => println!("HFR:            {:.3} ± {:.3}", mean, stdev),
            None => println!("HFR:            n/a"),
        }
    }

    if let Some(path) = annotate {
        save_annotated_image(&image, &result, path)?;
        tracing::info!("Annotated image saved to {}", path.display());
    }

    Ok(())
}
