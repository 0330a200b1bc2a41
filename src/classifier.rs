//! The classifier seam. The server only talks to a `Classifier`, so the torch
//! network can be swapped for a stub in tests.

use crate::error::{Error, Result};
use crate::preprocess::{ImageTensor, InputSize};
use serde::Serialize;
use std::collections::BTreeMap;

/// The activation of one convolutional layer together with the gradient of a
/// class score with respect to it. Both are laid out channel-major:
/// `channels x height x width`.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerGradient {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub activations: Vec<f32>,
    pub gradients: Vec<f32>,
}

/// A pretrained image classifier over a fixed, ordered label list
pub trait Classifier: Send + Sync {
    /// Spatial resolution the network expects
    fn input_size(&self) -> InputSize;

    /// Class labels, in output order
    fn labels(&self) -> &[String];

    /// Softmax probabilities, one per label
    fn probabilities(&self, input: &ImageTensor) -> Result<Vec<f32>>;

    /// Run a differentiable forward pass and backpropagate the score of
    /// `class` to the output of `layer`
    fn layer_gradient(&self, input: &ImageTensor, layer: &str, class: usize)
        -> Result<LayerGradient>;
}

/// The top class of a probability vector
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Prediction {
    pub index: usize,
    pub label: String,
    pub confidence: f32,
    pub all_probabilities: BTreeMap<String, f32>,
}

impl Prediction {
    pub fn new(labels: &[String], probabilities: &[f32]) -> Result<Self> {
        if labels.len() != probabilities.len() {
            return Err(Error::Inference(format!(
                "model returned {} probabilities for {} labels",
                probabilities.len(),
                labels.len()
            )));
        }

        let index = argmax(probabilities)
            .ok_or_else(|| Error::Inference("model returned no probabilities".into()))?;

        Ok(Prediction {
            index,
            label: labels[index].clone(),
            confidence: probabilities[index],
            all_probabilities: labels
                .iter()
                .cloned()
                .zip(probabilities.iter().copied())
                .collect(),
        })
    }
}

/// Index of the largest value. Ties go to the first index, NaNs are skipped
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}
