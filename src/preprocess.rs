//! Turn uploaded image bytes into the tensor the classifier expects

use crate::error::{Error, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};
use tch::{Kind, Tensor};
use tracing::debug;

/// Spatial resolution of the network input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSize {
    pub height: u32,
    pub width: u32,
}

/// A preprocessed image: a `[1, 3, H, W]` float tensor in [0, 1], and the
/// resized 8-bit RGB image it was built from (used for the heatmap overlay)
#[derive(Debug)]
pub struct ImageTensor {
    tensor: Tensor,
    original: RgbImage,
}

impl ImageTensor {
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn original(&self) -> &RgbImage {
        &self.original
    }

    pub fn size(&self) -> InputSize {
        InputSize {
            height: self.original.height(),
            width: self.original.width(),
        }
    }
}

/// Decode `bytes` and preprocess the result
pub fn load_from_memory(bytes: &[u8], size: InputSize) -> Result<ImageTensor> {
    let image = image::load_from_memory(bytes).map_err(|e| Error::Format(e.to_string()))?;
    debug!(
        "decoded image: {}x{} {:?}",
        image.width(),
        image.height(),
        image.color()
    );
    from_image(&image, size)
}

/// Convert to RGB, resize to `size`, scale to [0, 1], and add a batch dimension
pub fn from_image(image: &DynamicImage, size: InputSize) -> Result<ImageTensor> {
    if size.height == 0 || size.width == 0 {
        return Err(Error::Inference(format!("invalid input size {size:?}")));
    }

    let rgb = image.to_rgb8();
    let resized = if rgb.dimensions() == (size.width, size.height) {
        rgb
    } else {
        imageops::resize(&rgb, size.width, size.height, FilterType::Triangle)
    };

    let tensor = to_tensor(&resized).map_err(|e| Error::Inference(e.to_string()))?;
    Ok(ImageTensor {
        tensor,
        original: resized,
    })
}

fn to_tensor(image: &RgbImage) -> std::result::Result<Tensor, tch::TchError> {
    let (width, height) = image.dimensions();
    Tensor::f_from_slice(image.as_raw())?
        .f_view([height as i64, width as i64, 3])?
        .f_permute([2, 0, 1])?
        .f_to_kind(Kind::Float)?
        .f_div_scalar(255.0)?
        .f_unsqueeze(0)?
        .f_contiguous()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, ImageOutputFormat, Luma, Rgb};
    use std::io::Cursor;

    fn png_bytes(image: DynamicImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_grayscale_is_resized_to_rgb_batch() {
        let gray = GrayImage::from_fn(40, 30, |x, _| Luma([(x * 6) as u8]));
        let bytes = png_bytes(DynamicImage::ImageLuma8(gray));

        let size = InputSize {
            height: 16,
            width: 24,
        };
        let input = load_from_memory(&bytes, size).unwrap();

        assert_eq!(input.tensor().size(), vec![1, 3, 16, 24]);
        assert_eq!(input.size(), size);
        let max = input.tensor().max().double_value(&[]);
        let min = input.tensor().min().double_value(&[]);
        assert!(min >= 0.0 && max <= 1.0);
    }

    #[test]
    fn test_channel_layout() {
        let image = RgbImage::from_pixel(4, 4, Rgb([255, 0, 51]));
        let input = from_image(
            &DynamicImage::ImageRgb8(image),
            InputSize {
                height: 4,
                width: 4,
            },
        )
        .unwrap();

        let t = input.tensor();
        assert!((t.double_value(&[0, 0, 1, 1]) - 1.0).abs() < 1e-6);
        assert!(t.double_value(&[0, 1, 1, 1]).abs() < 1e-6);
        assert!((t.double_value(&[0, 2, 1, 1]) - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_garbage_is_a_format_error() {
        let err = load_from_memory(
            b"definitely not an image",
            InputSize {
                height: 8,
                width: 8,
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }
}
