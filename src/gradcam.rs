//! Inspect a model and render Grad-CAM maps for one image, for picking a good
//! explanation layer

use anyhow::{Context, Result};
use neuronav::config::Settings;
use neuronav::explain::Explainer;
use neuronav::preprocess;
use neuronav::torch::TorchModel;
use neuronav::util::init_tracing;
use std::path::Path;
use std::{env, fs, process};
use tracing::info;

const USAGE: &str = "usage: ./gradcam <manifest> <image> [layer ...]";

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        println!("{USAGE}");
        process::exit(1);
    }

    let settings = Settings::from_env()?;
    init_tracing(&settings.log.filter);

    let model = TorchModel::load(Path::new(&args[1]))?;
    let manifest = model.manifest();
    for layer in &manifest.layers {
        println!("{} {}", layer.name, layer.kind.type_name());
    }

    let bytes = fs::read(&args[2]).with_context(|| format!("reading {}", args[2]))?;
    let input = preprocess::load_from_memory(&bytes, manifest.input_size())?;

    let layers = if args.len() > 3 {
        args[3..].to_vec()
    } else {
        vec![manifest.resolve_target_layer(settings.model.target_layer.as_deref())?]
    };

    for layer in layers {
        let explainer = Explainer::new(layer.as_str(), &settings.explain);
        match explainer.explain(&model, &input, None) {
            Ok(explanation) => {
                let heatmap_path = format!("gradcam_heatmap_{layer}.png");
                let overlay_path = format!("gradcam_overlay_{layer}.png");
                explanation.heatmap.save(&heatmap_path)?;
                explanation.overlay.save(&overlay_path)?;
                info!(
                    "saved Grad-CAM for layer {layer} (class {}): {overlay_path}, {heatmap_path}",
                    manifest.labels[explanation.class_index]
                );
            }
            Err(e) => eprintln!("failed for layer {layer}: {e}"),
        }
    }

    Ok(())
}
