//! The analyzer ties preprocessing, classification and explanation together.
//! It is built once at startup and shared read-only by every request.

use crate::classifier::{Classifier, Prediction};
use crate::config::Settings;
use crate::error::Result;
use crate::explain::Explainer;
use crate::preprocess;
use crate::torch::TorchModel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

/// Message returned instead of a heatmap for the no-finding class
pub const NO_FINDING_MESSAGE: &str = "No suspicious regions detected.";

/// The classification of one image
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Diagnosis {
    pub predicted_class: String,
    pub confidence: f32,
    pub all_probabilities: BTreeMap<String, f32>,
    /// Grad-CAM overlay as a `data:image/png;base64,...` URI
    pub heatmap: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}

pub struct Analyzer {
    classifier: Arc<dyn Classifier>,
    explainer: Explainer,
    no_finding: Option<String>,
}

impl Analyzer {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        explainer: Explainer,
        no_finding: Option<String>,
    ) -> Self {
        Analyzer {
            classifier,
            explainer,
            no_finding,
        }
    }

    /// Load the model named in `settings` and resolve its Grad-CAM layer
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let model = TorchModel::load(&settings.model.manifest)?;
        let manifest = model.manifest();
        let layer = manifest.resolve_target_layer(settings.model.target_layer.as_deref())?;
        info!("using layer {layer} for Grad-CAM");

        let explainer = Explainer::new(layer, &settings.explain);
        let no_finding = manifest.no_finding.clone();
        Ok(Self::new(Arc::new(model), explainer, no_finding))
    }

    pub fn explainer(&self) -> &Explainer {
        &self.explainer
    }

    /// Classify an encoded image, and explain the result unless it is the
    /// no-finding class. A failed explanation leaves `heatmap` empty
    pub fn analyze(&self, bytes: &[u8]) -> Result<Diagnosis> {
        let input = preprocess::load_from_memory(bytes, self.classifier.input_size())?;
        let probabilities = self.classifier.probabilities(&input)?;
        let prediction = Prediction::new(self.classifier.labels(), &probabilities)?;
        info!(
            "prediction: class={} confidence={:.4}",
            prediction.label, prediction.confidence
        );

        let mut diagnosis = Diagnosis {
            predicted_class: prediction.label.clone(),
            confidence: prediction.confidence,
            all_probabilities: prediction.all_probabilities,
            heatmap: None,
            message: None,
        };

        if self.no_finding.as_deref() == Some(prediction.label.as_str()) {
            info!("no finding, skipping heatmap generation");
            diagnosis.message = Some(NO_FINDING_MESSAGE.to_string());
            return Ok(diagnosis);
        }

        let heatmap = self
            .explainer
            .explain(self.classifier.as_ref(), &input, Some(prediction.index))
            .and_then(|explanation| explanation.to_data_uri());
        match heatmap {
            Ok(uri) => diagnosis.heatmap = Some(uri),
            Err(e) => error!("error generating heatmap: {e}"),
        }

        Ok(diagnosis)
    }
}
