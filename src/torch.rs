//! Code for loading and running (trained) libtorch classifiers described by a
//! model manifest

use crate::classifier::{Classifier, LayerGradient};
use crate::error::{Error, Result};
use crate::preprocess::{ImageTensor, InputSize};
use config::{Config, File, FileFormat};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tch::nn::{self, ConvConfig};
use tch::{no_grad, with_grad, Device, Kind, TchError, Tensor};
use tracing::{debug, info};

fn one() -> i64 {
    1
}

/// One layer of the network, in forward order
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LayerSpec {
    /// Unique name, also the variable-store path of the layer's parameters
    pub name: String,
    #[serde(flatten)]
    pub kind: LayerKind,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerKind {
    Conv2d {
        in_channels: i64,
        out_channels: i64,
        kernel_size: i64,
        #[serde(default = "one")]
        stride: i64,
        #[serde(default)]
        padding: i64,
    },
    BatchNorm2d {
        features: i64,
    },
    Relu,
    MaxPool2d {
        kernel_size: i64,
        /// Defaults to the kernel size
        #[serde(default)]
        stride: Option<i64>,
    },
    GlobalAvgPool2d,
    Flatten,
    Linear {
        in_features: i64,
        out_features: i64,
    },
    /// Identity at inference time
    Dropout {
        #[serde(default)]
        probability: f64,
    },
}

impl LayerKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            LayerKind::Conv2d { .. } => "conv2d",
            LayerKind::BatchNorm2d { .. } => "batch_norm2d",
            LayerKind::Relu => "relu",
            LayerKind::MaxPool2d { .. } => "max_pool2d",
            LayerKind::GlobalAvgPool2d => "global_avg_pool2d",
            LayerKind::Flatten => "flatten",
            LayerKind::Linear { .. } => "linear",
            LayerKind::Dropout { .. } => "dropout",
        }
    }

    pub fn is_conv(&self) -> bool {
        matches!(self, LayerKind::Conv2d { .. })
    }
}

/// Architecture, labels and weights of a classifier
#[derive(Debug, Clone, Deserialize)]
pub struct ModelManifest {
    pub name: String,
    /// Weights file, relative to the manifest
    #[serde(default)]
    pub weights: Option<PathBuf>,
    /// `[height, width]`
    pub input_size: [u32; 2],
    pub labels: Vec<String>,
    /// Label for which no explanation is produced
    #[serde(default)]
    pub no_finding: Option<String>,
    /// Grad-CAM layer. The last `conv2d` layer when absent
    #[serde(default)]
    pub target_layer: Option<String>,
    pub layers: Vec<LayerSpec>,
}

impl ModelManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let path_str = path
            .to_str()
            .ok_or_else(|| Error::Configuration(format!("invalid manifest path {path:?}")))?;
        let mut manifest: ModelManifest = Config::builder()
            .add_source(File::new(path_str, FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        if let (Some(weights), Some(dir)) = (manifest.weights.as_ref(), path.parent()) {
            if weights.is_relative() {
                manifest.weights = Some(dir.join(weights));
            }
        }
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn input_size(&self) -> InputSize {
        InputSize {
            height: self.input_size[0],
            width: self.input_size[1],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.labels.is_empty() {
            return Err(Error::Configuration(format!("model {} has no labels", self.name)));
        }
        if self.input_size.contains(&0) {
            return Err(Error::Configuration(format!(
                "model {} has an empty input size",
                self.name
            )));
        }
        if let Some(no_finding) = &self.no_finding {
            if !self.labels.contains(no_finding) {
                return Err(Error::Configuration(format!(
                    "no_finding label {no_finding:?} is not one of {:?}",
                    self.labels
                )));
            }
        }
        let mut seen = HashSet::new();
        for layer in &self.layers {
            // variable-store paths are dot separated
            if layer.name.is_empty() || layer.name.contains('.') {
                return Err(Error::Configuration(format!(
                    "invalid layer name {:?}",
                    layer.name
                )));
            }
            if !seen.insert(layer.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate layer name {:?}",
                    layer.name
                )));
            }
        }
        Ok(())
    }

    /// Pick the Grad-CAM layer. An explicit name (the `configured` override,
    /// then the manifest's `target_layer`) must exist; otherwise the layers are
    /// scanned from the output backwards for the first `conv2d`.
    pub fn resolve_target_layer(&self, configured: Option<&str>) -> Result<String> {
        if let Some(name) = configured.or(self.target_layer.as_deref()) {
            return match self.layers.iter().find(|l| l.name == name) {
                Some(layer) => Ok(layer.name.clone()),
                None => Err(Error::Configuration(format!(
                    "target layer {name:?} not found in model {}",
                    self.name
                ))),
            };
        }

        self.layers
            .iter()
            .rev()
            .find(|l| l.kind.is_conv())
            .map(|l| l.name.clone())
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "no convolutional layer found in model {}",
                    self.name
                ))
            })
    }
}

#[derive(Debug)]
enum Layer {
    Conv2d {
        conv: nn::Conv2D,
        stride: i64,
        padding: i64,
    },
    BatchNorm2d(nn::BatchNorm),
    Relu,
    MaxPool2d {
        kernel_size: i64,
        stride: i64,
    },
    GlobalAvgPool2d,
    Flatten,
    Linear(nn::Linear),
    Dropout(f64),
}

impl Layer {
    fn new(path: nn::Path<'_>, kind: &LayerKind) -> Self {
        match *kind {
            LayerKind::Conv2d {
                in_channels,
                out_channels,
                kernel_size,
                stride,
                padding,
            } => {
                let config = ConvConfig {
                    stride,
                    padding,
                    ..Default::default()
                };
                Layer::Conv2d {
                    conv: nn::conv2d(path, in_channels, out_channels, kernel_size, config),
                    stride,
                    padding,
                }
            }
            LayerKind::BatchNorm2d { features } => {
                Layer::BatchNorm2d(nn::batch_norm2d(path, features, Default::default()))
            }
            LayerKind::Relu => Layer::Relu,
            LayerKind::MaxPool2d {
                kernel_size,
                stride,
            } => Layer::MaxPool2d {
                kernel_size,
                stride: stride.unwrap_or(kernel_size),
            },
            LayerKind::GlobalAvgPool2d => Layer::GlobalAvgPool2d,
            LayerKind::Flatten => Layer::Flatten,
            LayerKind::Linear {
                in_features,
                out_features,
            } => Layer::Linear(nn::linear(
                path,
                in_features,
                out_features,
                Default::default(),
            )),
            LayerKind::Dropout { probability } => Layer::Dropout(probability),
        }
    }

    fn forward(&self, xs: &Tensor) -> std::result::Result<Tensor, TchError> {
        match self {
            Layer::Conv2d {
                conv,
                stride,
                padding,
            } => xs.f_conv2d(
                &conv.ws,
                conv.bs.as_ref(),
                [*stride, *stride],
                [*padding, *padding],
                [1, 1],
                1,
            ),
            Layer::BatchNorm2d(bn) => xs.f_batch_norm(
                bn.ws.as_ref(),
                bn.bs.as_ref(),
                Some(&bn.running_mean),
                Some(&bn.running_var),
                false,
                0.1,
                1e-5,
                false,
            ),
            Layer::Relu => xs.f_relu(),
            Layer::MaxPool2d {
                kernel_size,
                stride,
            } => xs.f_max_pool2d(
                [*kernel_size, *kernel_size],
                [*stride, *stride],
                [0, 0],
                [1, 1],
                false,
            ),
            Layer::GlobalAvgPool2d => xs.f_adaptive_avg_pool2d([1, 1]),
            Layer::Flatten => xs.f_flatten(1, -1),
            Layer::Linear(linear) => xs.f_linear(&linear.ws, linear.bs.as_ref()),
            Layer::Dropout(p) => xs.f_dropout(*p, false),
        }
    }
}

/// A loaded classifier network
pub struct TorchModel {
    manifest: ModelManifest,
    /// Owns the parameters referenced by `layers`
    vs: nn::VarStore,
    layers: Vec<(String, Layer)>,
}

impl std::fmt::Debug for TorchModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TorchModel {{ name: {:?}, layers: {}, device: {:?} }}",
            self.manifest.name,
            self.layers.len(),
            self.vs.device()
        )
    }
}

impl TorchModel {
    /// Load a manifest and its weights
    pub fn load(manifest_path: &Path) -> Result<Self> {
        let manifest = ModelManifest::load(manifest_path)?;
        let weights = manifest.weights.clone().ok_or_else(|| {
            Error::Configuration(format!("model {} has no weights file", manifest.name))
        })?;

        let mut model = Self::build(manifest, Device::Cpu)?;
        model.vs.load(&weights).map_err(|e| {
            Error::Configuration(format!("could not load weights from {weights:?}: {e}"))
        })?;
        model.check_output()?;

        info!(
            "loaded model {} ({} layers) from {:?}",
            model.manifest.name,
            model.layers.len(),
            weights
        );
        Ok(model)
    }

    /// Build the network with freshly initialized parameters
    pub fn build(manifest: ModelManifest, device: Device) -> Result<Self> {
        manifest.validate()?;
        let vs = nn::VarStore::new(device);
        let layers = {
            let root = vs.root();
            manifest
                .layers
                .iter()
                .map(|spec| (spec.name.clone(), Layer::new(&root / spec.name.as_str(), &spec.kind)))
                .collect()
        };

        Ok(TorchModel {
            manifest,
            vs,
            layers,
        })
    }

    pub fn manifest(&self) -> &ModelManifest {
        &self.manifest
    }

    /// Run a zero image through the network and make sure it yields one
    /// score per label
    pub fn check_output(&self) -> Result<()> {
        let size = self.manifest.input_size();
        let zeros = Tensor::zeros(
            [1, 3, size.height as i64, size.width as i64],
            (Kind::Float, Device::Cpu),
        );
        let (logits, _) = no_grad(|| self.forward(&zeros, None))
            .map_err(|e| Error::Configuration(format!("model {}: {e}", self.manifest.name)))?;

        let expected = [1, self.manifest.labels.len() as i64];
        if logits.size() != expected {
            return Err(Error::Configuration(format!(
                "model {} produces output of shape {:?}, expected {:?}",
                self.manifest.name,
                logits.size(),
                expected
            )));
        }
        Ok(())
    }

    /// Forward pass, also returning the output of `capture` if named
    fn forward(
        &self,
        input: &Tensor,
        capture: Option<&str>,
    ) -> std::result::Result<(Tensor, Option<Tensor>), TchError> {
        let mut xs = input.shallow_clone();
        let mut captured = None;
        for (name, layer) in &self.layers {
            xs = layer.forward(&xs)?;
            if capture == Some(name.as_str()) {
                captured = Some(xs.shallow_clone());
            }
        }
        Ok((xs, captured))
    }

    fn check_input(&self, input: &ImageTensor) -> Result<()> {
        let size = self.manifest.input_size();
        let expected = vec![1, 3, size.height as i64, size.width as i64];
        let actual = input.tensor().size();
        if actual != expected {
            return Err(Error::Inference(format!(
                "input tensor of shape {actual:?} does not match model input {expected:?}"
            )));
        }
        Ok(())
    }
}

fn to_vec(t: &Tensor) -> std::result::Result<Vec<f32>, TchError> {
    let flat = t
        .f_detach()?
        .f_to_kind(Kind::Float)?
        .f_reshape([-1])?;
    Vec::<f32>::try_from(&flat)
}

impl Classifier for TorchModel {
    fn input_size(&self) -> InputSize {
        self.manifest.input_size()
    }

    fn labels(&self) -> &[String] {
        &self.manifest.labels
    }

    fn probabilities(&self, input: &ImageTensor) -> Result<Vec<f32>> {
        self.check_input(input)?;
        let probabilities = no_grad(|| {
            let (logits, _) = self.forward(input.tensor(), None)?;
            to_vec(&logits.f_softmax(-1, Kind::Float)?)
        })
        .map_err(|e| Error::Inference(e.to_string()))?;

        if probabilities.len() != self.manifest.labels.len() {
            return Err(Error::Inference(format!(
                "model returned {} scores for {} labels",
                probabilities.len(),
                self.manifest.labels.len()
            )));
        }
        Ok(probabilities)
    }

    fn layer_gradient(
        &self,
        input: &ImageTensor,
        layer: &str,
        class: usize,
    ) -> Result<LayerGradient> {
        self.check_input(input)?;
        if class >= self.manifest.labels.len() {
            return Err(Error::Explanation(format!(
                "class index {class} out of range for {} labels",
                self.manifest.labels.len()
            )));
        }

        let (activation, gradient) = with_grad(|| {
            let (logits, activation) = self.forward(input.tensor(), Some(layer))?;
            let activation = match activation {
                Some(a) => a,
                None => return Ok(None),
            };
            // pre-softmax score of the target class
            let score = logits.f_select(1, class as i64)?.f_sum(Kind::Float)?;
            let mut grads = Tensor::f_run_backward(&[&score], &[&activation], false, false)?;
            Ok::<_, TchError>(grads.pop().map(|g| (activation, g)))
        })
        .map_err(|e| Error::Explanation(e.to_string()))?
        .ok_or_else(|| {
            Error::Explanation(format!(
                "layer {layer:?} not found in model {}",
                self.manifest.name
            ))
        })?;

        let shape = activation.size();
        let &[_, channels, height, width] = shape.as_slice() else {
            return Err(Error::Explanation(format!(
                "layer {layer:?} output of shape {shape:?} is not a feature map"
            )));
        };
        debug!("{layer} activation shape {shape:?}");

        Ok(LayerGradient {
            channels: channels as usize,
            height: height as usize,
            width: width as usize,
            activations: to_vec(&activation).map_err(|e| Error::Explanation(e.to_string()))?,
            gradients: to_vec(&gradient).map_err(|e| Error::Explanation(e.to_string()))?,
        })
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    fn layer(name: &str, kind: LayerKind) -> LayerSpec {
        LayerSpec {
            name: name.into(),
            kind,
        }
    }

    /// A small four-class CNN over 16x16 images
    pub(crate) fn tiny_manifest() -> ModelManifest {
        ModelManifest {
            name: "tiny".into(),
            weights: None,
            input_size: [16, 16],
            labels: ["glioma", "meningioma", "notumor", "pituitary"]
                .iter()
                .map(|l| l.to_string())
                .collect(),
            no_finding: Some("notumor".into()),
            target_layer: None,
            layers: vec![
                layer(
                    "conv1",
                    LayerKind::Conv2d {
                        in_channels: 3,
                        out_channels: 4,
                        kernel_size: 3,
                        stride: 1,
                        padding: 1,
                    },
                ),
                layer("bn1", LayerKind::BatchNorm2d { features: 4 }),
                layer("relu1", LayerKind::Relu),
                layer(
                    "pool1",
                    LayerKind::MaxPool2d {
                        kernel_size: 2,
                        stride: None,
                    },
                ),
                layer(
                    "conv2",
                    LayerKind::Conv2d {
                        in_channels: 4,
                        out_channels: 8,
                        kernel_size: 3,
                        stride: 1,
                        padding: 1,
                    },
                ),
                layer("relu2", LayerKind::Relu),
                layer("gap", LayerKind::GlobalAvgPool2d),
                layer("flatten", LayerKind::Flatten),
                layer("dropout", LayerKind::Dropout { probability: 0.5 }),
                layer(
                    "fc",
                    LayerKind::Linear {
                        in_features: 8,
                        out_features: 4,
                    },
                ),
            ],
        }
    }

    pub(crate) fn tiny_model() -> TorchModel {
        tch::manual_seed(7);
        TorchModel::build(tiny_manifest(), Device::Cpu).unwrap()
    }

    /// `tiny_manifest()` as TOML, with `relu2` as its Grad-CAM layer
    const TINY_MANIFEST: &str = r#"
name = "tiny"
weights = "tiny.safetensors"
input_size = [16, 16]
labels = ["glioma", "meningioma", "notumor", "pituitary"]
no_finding = "notumor"
target_layer = "relu2"

[[layers]]
name = "conv1"
type = "conv2d"
in_channels = 3
out_channels = 4
kernel_size = 3
padding = 1

[[layers]]
name = "bn1"
type = "batch_norm2d"
features = 4

[[layers]]
name = "relu1"
type = "relu"

[[layers]]
name = "pool1"
type = "max_pool2d"
kernel_size = 2

[[layers]]
name = "conv2"
type = "conv2d"
in_channels = 4
out_channels = 8
kernel_size = 3
padding = 1

[[layers]]
name = "relu2"
type = "relu"

[[layers]]
name = "gap"
type = "global_avg_pool2d"

[[layers]]
name = "flatten"
type = "flatten"

[[layers]]
name = "dropout"
type = "dropout"
probability = 0.5

[[layers]]
name = "fc"
type = "linear"
in_features = 8
out_features = 4
"#;

    /// Write `tiny_model()`'s weights and manifest to `dir`. Returns the
    /// manifest path and the in-memory model the weights came from
    pub(crate) fn save_tiny_model(dir: &Path) -> (PathBuf, TorchModel) {
        let model = tiny_model();
        model.vs.save(dir.join("tiny.safetensors")).unwrap();
        let path = dir.join("manifest.toml");
        std::fs::write(&path, TINY_MANIFEST).unwrap();
        (path, model)
    }
}
