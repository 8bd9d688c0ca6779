//! TOML layer description for the `moe-dispatch` binary.
//!
//! ```toml
//! expert_count = 8
//! hidden_size = 256
//! max_concurrency = 2
//! sublayer_type = "T5FF"
//! weight_file = "experts.safetensors"
//!
//! # Either inline, row-major expert_count x D ...
//! centroids = [1.0, 0.0, 0.0, 1.0]
//! # ... or a tensor stored in an archive (defaults to weight_file).
//! centroids_tensor = "gate/centroids"
//! centroids_file = "gate.safetensors"
//! ```
//!
//! Relative paths are resolved against the TOML file's directory.

use std::fs;
use std::path::{Path, PathBuf};

use moe_core::experts::ExpertArchive;
use moe_core::{MoELayerConfig, SublayerType};
use serde::{Deserialize, Serialize};

/// Layer description as written in a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayerFile {
    pub expert_count: usize,
    pub hidden_size: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,

    #[serde(default)]
    pub sublayer_type: SublayerType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_file: Option<PathBuf>,

    /// Inline centroid table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub centroids: Option<Vec<f32>>,

    /// Name of a centroid tensor inside `centroids_file`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub centroids_tensor: Option<String>,

    /// Archive holding `centroids_tensor`; defaults to `weight_file`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub centroids_file: Option<PathBuf>,
}

impl LayerFile {
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Resolve paths against `base_dir`, read centroids and build the layer
    /// configuration.
    pub fn into_layer_config(self, base_dir: &Path) -> Result<MoELayerConfig, ConfigError> {
        let resolve = |p: PathBuf| if p.is_relative() { base_dir.join(p) } else { p };
        let weight_file = self.weight_file.map(resolve).unwrap_or_default();

        let centroids = match (self.centroids, self.centroids_tensor) {
            (Some(_), Some(_)) => return Err(ConfigError::AmbiguousCentroids),
            (Some(values), None) => values,
            (None, Some(name)) => {
                let file = self.centroids_file.map(resolve).unwrap_or_else(|| weight_file.clone());
                read_centroid_tensor(&file, &name, self.expert_count)?
            }
            (None, None) => return Err(ConfigError::MissingCentroids),
        };

        let mut config = MoELayerConfig::new(
            self.expert_count,
            self.hidden_size,
            centroids,
            weight_file,
            self.sublayer_type,
        );
        if let Some(k) = self.max_concurrency {
            config = config.with_max_concurrency(k);
        }
        config.validate()?;
        Ok(config)
    }
}

fn read_centroid_tensor(file: &Path, name: &str, expert_count: usize) -> Result<Vec<f32>, ConfigError> {
    let archive = ExpertArchive::load(file)?;
    let (dims, values) = archive.tensor(name).ok_or_else(|| ConfigError::MissingTensor {
        name: name.to_string(),
        file: file.to_path_buf(),
    })?;
    if dims.len() != 2 || dims[0] != expert_count {
        return Err(ConfigError::CentroidShape {
            dims: dims.to_vec(),
            expert_count,
        });
    }
    tracing::debug!(tensor = name, file = %file.display(), ?dims, "read centroid tensor");
    Ok(values.to_vec())
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("layer file sets both `centroids` and `centroids_tensor`")]
    AmbiguousCentroids,
    #[error("layer file needs `centroids` or `centroids_tensor`")]
    MissingCentroids,
    #[error("tensor {name} not found in {}", file.display())]
    MissingTensor { name: String, file: PathBuf },
    #[error("centroid tensor has shape {dims:?}, expected [{expert_count}, D]")]
    CentroidShape { dims: Vec<usize>, expert_count: usize },
    #[error(transparent)]
    Layer(#[from] moe_core::MoEError),
}
