use crate::classifier::LayerGradient;
use crate::error::{Error, Result};

/// A non-negative `height x width` importance map, normalized to [0, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct SaliencyMap {
    pub height: usize,
    pub width: usize,
    pub values: Vec<f32>,
}

impl SaliencyMap {
    /// Largest value, or zero for an empty map
    pub fn max(&self) -> f32 {
        self.values.iter().copied().fold(0.0, f32::max)
    }

    pub fn is_zero(&self) -> bool {
        self.values.iter().all(|&v| v == 0.0)
    }
}

/// Gradient-weighted class activation map.
///
/// Each channel's weight is the spatial mean of its gradient. The weighted
/// activations are averaged over channels, negatives are clamped to zero, and
/// the result is divided by its maximum. A map with no positive value stays
/// all zero.
pub fn grad_cam(layer: &LayerGradient) -> Result<SaliencyMap> {
    let LayerGradient {
        channels,
        height,
        width,
        ..
    } = *layer;
    let spatial = height * width;
    let expected = channels * spatial;

    if channels == 0 || spatial == 0 {
        return Err(Error::Explanation(format!(
            "empty feature map: {channels} channels of {height}x{width}"
        )));
    }
    if layer.activations.len() != expected || layer.gradients.len() != expected {
        return Err(Error::Explanation(format!(
            "expected {expected} activation and gradient values, got {} and {}",
            layer.activations.len(),
            layer.gradients.len()
        )));
    }

    let weights: Vec<f32> = layer
        .gradients
        .chunks_exact(spatial)
        .map(|g| g.iter().sum::<f32>() / spatial as f32)
        .collect();

    let mut values = vec![0.0f32; spatial];
    for (activation, weight) in layer.activations.chunks_exact(spatial).zip(&weights) {
        for (v, a) in values.iter_mut().zip(activation) {
            *v += a * weight;
        }
    }

    for v in values.iter_mut() {
        *v /= channels as f32;
        if v.is_nan() || *v < 0.0 {
            *v = 0.0;
        }
    }

    let mut map = SaliencyMap {
        height,
        width,
        values,
    };
    let max = map.max();
    if !max.is_finite() {
        map.values.iter_mut().for_each(|v| *v = 0.0);
    } else if max > 0.0 {
        map.values.iter_mut().for_each(|v| *v = (*v / max).min(1.0));
    }
    Ok(map)
}
