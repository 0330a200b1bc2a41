//! NeuroNav configuration. Settings are layered: built-in defaults, then an
//! optional TOML file, then `NEURONAV__SECTION__KEY` environment variables.

use crate::error::Result;
use crate::explain::Colormap;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

/// Config file read when no path is given on the command line
pub const DEFAULT_CONFIG_FILE: &str = "neuronav.toml";

/// Prefix of environment overrides, e.g. `NEURONAV__SERVER__PORT=9000`
pub const ENV_PREFIX: &str = "NEURONAV";

/// Default `tracing` filter when `RUST_LOG` is not set
pub const RUST_LOG: &str = "info,actix_web=info,actix_server=info";

pub const DEFAULT_PORT: i64 = 8000;

/// Uploads above this many bytes are rejected (100 MiB)
pub const MAX_UPLOAD_SIZE: i64 = 100 * 1024 * 1024;

/// Share of the colorized heatmap in the overlay blend
pub const HEATMAP_WEIGHT: f64 = 0.4;

/// Browser origins allowed by default. `*` allows any origin
pub const CORS_ORIGINS: [&str; 7] = [
    "http://localhost:3000",
    "http://localhost:5173",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:5173",
    "http://localhost:8000",
    "http://127.0.0.1:8000",
    "*",
];

/// Scan records kept in memory before the oldest finished ones are dropped
pub const MAX_SCAN_RECORDS: i64 = 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub cors: CorsSettings,
    pub scans: ScanSettings,
    pub model: ModelSettings,
    pub explain: ExplainSettings,
    pub uploads: UploadSettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Number of actix worker threads. Zero means one per core
    pub workers: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorsSettings {
    /// Comma separated when set from the environment
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanSettings {
    pub max_records: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelSettings {
    /// Path to the model manifest (architecture, labels, weights file)
    pub manifest: PathBuf,
    /// Overrides the manifest's Grad-CAM layer
    #[serde(default)]
    pub target_layer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExplainSettings {
    pub heatmap_weight: f32,
    pub colormap: Colormap,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadSettings {
    pub dir: PathBuf,
    pub max_upload_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    pub filter: String,
}

impl Settings {
    /// Load settings from `path`, or from `DEFAULT_CONFIG_FILE` if it exists
    pub fn load(path: Option<&str>) -> Result<Self> {
        let file = match path {
            Some(path) => File::with_name(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        Self::build(Some(file))
    }

    /// Built-in defaults plus environment overrides, without reading a file
    pub fn from_env() -> Result<Self> {
        Self::build(None)
    }

    fn build(file: Option<File<config::FileSourceFile, config::FileFormat>>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", DEFAULT_PORT)?
            .set_default("server.workers", 0i64)?
            .set_default("cors.allowed_origins", CORS_ORIGINS.to_vec())?
            .set_default("scans.max_records", MAX_SCAN_RECORDS)?
            .set_default("model.manifest", "models/manifest.toml")?
            .set_default("explain.heatmap_weight", HEATMAP_WEIGHT)?
            .set_default("explain.colormap", "jet")?
            .set_default("uploads.dir", "uploads")?
            .set_default("uploads.max_upload_size", MAX_UPLOAD_SIZE)?
            .set_default("log.filter", RUST_LOG)?;

        if let Some(file) = file {
            builder = builder.add_source(file);
        }

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("cors.allowed_origins"),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.explain.heatmap_weight) {
            return Err(crate::Error::Configuration(format!(
                "explain.heatmap_weight must be within [0, 1], got {}",
                self.explain.heatmap_weight
            )));
        }
        if let Some(origin) = self.cors.allowed_origins.iter().find(|o| {
            o.as_str() != "*" && !o.starts_with("http://") && !o.starts_with("https://")
        }) {
            return Err(crate::Error::Configuration(format!(
                "cors.allowed_origins: {origin:?} is not an http(s) origin or \"*\""
            )));
        }
        if self.scans.max_records == 0 {
            return Err(crate::Error::Configuration(
                "scans.max_records must be positive".into(),
            ));
        }
        if self.uploads.max_upload_size == 0 {
            return Err(crate::Error::Configuration(
                "uploads.max_upload_size must be positive".into(),
            ));
        }
        Ok(())
    }
}
