use super::colormap::Colormap;
use super::saliency::SaliencyMap;
use crate::error::{Error, Result};
use base64::{engine::general_purpose, Engine as _};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, ImageOutputFormat, Luma, Rgb, RgbImage};
use std::io::Cursor;

/// A single-channel float image
pub type Intensity = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Bilinearly resize a saliency map to `width x height`
pub fn upsample(map: &SaliencyMap, width: u32, height: u32) -> Result<Intensity> {
    let small = Intensity::from_raw(map.width as u32, map.height as u32, map.values.clone())
        .ok_or_else(|| {
            Error::Explanation(format!(
                "saliency map of {} values is not {}x{}",
                map.values.len(),
                map.height,
                map.width
            ))
        })?;

    if small.dimensions() == (width, height) {
        return Ok(small);
    }
    Ok(imageops::resize(&small, width, height, FilterType::Triangle))
}

/// Paint an intensity image with a color scale
pub fn colorize(intensity: &Intensity, colormap: Colormap) -> RgbImage {
    let (width, height) = intensity.dimensions();
    RgbImage::from_fn(width, height, |x, y| colormap.rgb(intensity.get_pixel(x, y)[0]))
}

/// `original * (1 - heatmap_weight) + heatmap * heatmap_weight`, saturating
pub fn blend(original: &RgbImage, heatmap: &RgbImage, heatmap_weight: f32) -> Result<RgbImage> {
    if original.dimensions() != heatmap.dimensions() {
        return Err(Error::Explanation(format!(
            "cannot blend {:?} image with {:?} heatmap",
            original.dimensions(),
            heatmap.dimensions()
        )));
    }

    let w = heatmap_weight.clamp(0.0, 1.0);
    let (width, height) = original.dimensions();
    Ok(RgbImage::from_fn(width, height, |x, y| {
        let Rgb(o) = *original.get_pixel(x, y);
        let Rgb(h) = *heatmap.get_pixel(x, y);
        let mix = |o: u8, h: u8| {
            (o as f32 * (1.0 - w) + h as f32 * w)
                .round()
                .clamp(0.0, 255.0) as u8
        };
        Rgb([mix(o[0], h[0]), mix(o[1], h[1]), mix(o[2], h[2])])
    }))
}

/// Encode as PNG and wrap in a `data:` URI
pub fn to_data_uri(image: &RgbImage) -> Result<String> {
    let mut png: Vec<u8> = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), ImageOutputFormat::Png)
        .map_err(|e| Error::Explanation(format!("png encoding failed: {e}")))?;
    Ok(format!(
        "data:image/png;base64,{}",
        general_purpose::STANDARD.encode(png)
    ))
}
