//! Grad-CAM explanations: which regions of the input pushed the classifier
//! towards a class, rendered as a color overlay on the input image.

use crate::classifier::{argmax, Classifier};
use crate::config::ExplainSettings;
use crate::error::{Error, Result};
use crate::preprocess::ImageTensor;
use image::RgbImage;
use tracing::{debug, warn};

mod colormap;
pub mod overlay;
pub mod saliency;

pub use colormap::Colormap;
pub use saliency::{grad_cam, SaliencyMap};

/// A rendered explanation for one class
#[derive(Debug, Clone)]
pub struct Explanation {
    pub class_index: usize,
    pub layer: String,
    pub saliency: SaliencyMap,
    /// The upsampled, color-mapped saliency on its own
    pub heatmap: RgbImage,
    /// `heatmap` blended over the original image
    pub overlay: RgbImage,
}

impl Explanation {
    /// The overlay as a `data:image/png;base64,...` string
    pub fn to_data_uri(&self) -> Result<String> {
        overlay::to_data_uri(&self.overlay)
    }
}

/// Computes explanations against one fixed layer of a classifier
#[derive(Debug, Clone)]
pub struct Explainer {
    layer: String,
    heatmap_weight: f32,
    colormap: Colormap,
}

impl Explainer {
    pub fn new(layer: impl Into<String>, settings: &ExplainSettings) -> Self {
        Explainer {
            layer: layer.into(),
            heatmap_weight: settings.heatmap_weight,
            colormap: settings.colormap,
        }
    }

    pub fn layer(&self) -> &str {
        &self.layer
    }

    /// Explain `class`, or the classifier's top class when `None`. Every
    /// failure comes back as `Error::Explanation`
    pub fn explain(
        &self,
        classifier: &dyn Classifier,
        input: &ImageTensor,
        class: Option<usize>,
    ) -> Result<Explanation> {
        self.try_explain(classifier, input, class)
            .map_err(|e| match e {
                Error::Explanation(_) => e,
                other => Error::Explanation(other.to_string()),
            })
    }

    fn try_explain(
        &self,
        classifier: &dyn Classifier,
        input: &ImageTensor,
        class: Option<usize>,
    ) -> Result<Explanation> {
        let class_index = match class {
            Some(class) => class,
            None => argmax(&classifier.probabilities(input)?)
                .ok_or_else(|| Error::Explanation("classifier returned no scores".into()))?,
        };

        let gradient = classifier.layer_gradient(input, &self.layer, class_index)?;
        debug!(
            "layer {} activation {}x{}x{}",
            self.layer, gradient.channels, gradient.height, gradient.width
        );

        let saliency = grad_cam(&gradient)?;
        if saliency.is_zero() {
            warn!(
                "saliency map for class {class_index} on layer {} is all zeros",
                self.layer
            );
        }

        let original = input.original();
        let (width, height) = original.dimensions();
        let upsampled = overlay::upsample(&saliency, width, height)?;
        let heatmap = overlay::colorize(&upsampled, self.colormap);
        let overlay = overlay::blend(original, &heatmap, self.heatmap_weight)?;

        Ok(Explanation {
            class_index,
            layer: self.layer.clone(),
            saliency,
            heatmap,
            overlay,
        })
    }
}
