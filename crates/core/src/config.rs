use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MoEError, Result};

/// Expert sub-layer implementation selected by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SublayerType {
    /// T5-style gated-GELU feed-forward block with RMS layer norm.
    #[default]
    #[serde(rename = "T5FF")]
    T5FeedForward,
    /// Copies the input through unchanged; carries no parameters.
    #[serde(rename = "Identity")]
    Identity,
}

impl SublayerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::T5FeedForward => "T5FF",
            Self::Identity => "Identity",
        }
    }
}

impl fmt::Display for SublayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SublayerType {
    type Err = MoEError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "T5FF" => Ok(Self::T5FeedForward),
            "Identity" => Ok(Self::Identity),
            other => Err(MoEError::config(format!(
                "unsupported sublayer type: {other}"
            ))),
        }
    }
}

fn default_max_concurrency() -> usize {
    2
}

/// Construction-time parameters of an MoE layer.
///
/// The embedding width `D` is not stored; it is implied by the centroid
/// table, which holds `expert_count × D` values in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoELayerConfig {
    /// Number of experts `E`.
    pub expert_count: usize,
    /// Inner width of each expert's feed-forward block (`D -> hidden_size -> D`).
    pub hidden_size: usize,
    /// Number of concurrency slots `K` used by the expert pipeline.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Packed archive holding every expert's parameters.
    #[serde(default)]
    pub weight_file: PathBuf,
    #[serde(default)]
    pub sublayer_type: SublayerType,
    /// Gating centroids, `expert_count × D` row-major.
    pub centroids: Vec<f32>,
}

impl MoELayerConfig {
    pub fn new(
        expert_count: usize,
        hidden_size: usize,
        centroids: Vec<f32>,
        weight_file: impl Into<PathBuf>,
        sublayer_type: SublayerType,
    ) -> Self {
        Self {
            expert_count,
            hidden_size,
            max_concurrency: default_max_concurrency(),
            weight_file: weight_file.into(),
            sublayer_type,
            centroids,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Model embedding width implied by the centroid table.
    pub fn embedding_size(&self) -> usize {
        if self.expert_count == 0 {
            return 0;
        }
        self.centroids.len() / self.expert_count
    }

    /// Check field counts and ranges.
    pub fn validate(&self) -> Result<()> {
        if self.expert_count == 0 {
            return Err(MoEError::config("expert_count must be > 0"));
        }
        if self.hidden_size == 0 {
            return Err(MoEError::config("hidden_size must be > 0"));
        }
        if self.max_concurrency == 0 {
            return Err(MoEError::config("max_concurrency must be > 0"));
        }
        if self.centroids.is_empty() {
            return Err(MoEError::config("expert centroids must not be empty"));
        }
        if self.centroids.len() % self.expert_count != 0 {
            return Err(MoEError::config(format!(
                "centroid count {} is not a multiple of expert_count {}",
                self.centroids.len(),
                self.expert_count
            )));
        }
        if i32::try_from(self.expert_count).is_err()
            || i32::try_from(self.hidden_size).is_err()
            || i32::try_from(self.max_concurrency).is_err()
        {
            return Err(MoEError::config("layer dimensions must fit in i32"));
        }
        if self.sublayer_type == SublayerType::T5FeedForward
            && self.weight_file.as_os_str().is_empty()
        {
            return Err(MoEError::config(
                "expert_weight_file is required for T5FF experts",
            ));
        }
        Ok(())
    }
}

/// Shape of the layer input: `(batch_size, sequence_length, embedding_size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputShape {
    pub batch_size: usize,
    pub sequence_length: usize,
    pub embedding_size: usize,
}

impl InputShape {
    pub fn new(batch_size: usize, sequence_length: usize, embedding_size: usize) -> Self {
        Self {
            batch_size,
            sequence_length,
            embedding_size,
        }
    }

    /// Build from a dims slice, which must be exactly 3-D.
    pub fn from_dims(dims: &[usize]) -> Result<Self> {
        match dims {
            [b, s, d] => Ok(Self::new(*b, *s, *d)),
            _ => Err(MoEError::config(format!(
                "expected 3-D input (batch, seq, embed), got {dims:?}"
            ))),
        }
    }

    /// Total tokens `N = batch_size × sequence_length`.
    pub fn token_count(&self) -> usize {
        self.batch_size * self.sequence_length
    }

    /// Total f32 elements in a buffer of this shape.
    pub fn numel(&self) -> usize {
        self.token_count() * self.embedding_size
    }

    pub fn dims(&self) -> [usize; 3] {
        [self.batch_size, self.sequence_length, self.embedding_size]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_config() -> MoELayerConfig {
        MoELayerConfig::new(2, 8, vec![1.0, 0.0, 0.0, 1.0], "", SublayerType::Identity)
    }

    #[test]
    fn embedding_size_from_centroids() {
        let config = identity_config();
        assert_eq!(config.embedding_size(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_ragged_centroids() {
        let mut config = identity_config();
        config.centroids.push(0.5);
        assert!(matches!(
            config.validate(),
            Err(MoEError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let config = identity_config().with_max_concurrency(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn t5ff_requires_weight_file() {
        let mut config = identity_config();
        config.sublayer_type = SublayerType::T5FeedForward;
        assert!(config.validate().is_err());
        config.weight_file = PathBuf::from("experts.safetensors");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn sublayer_type_names() {
        assert_eq!("T5FF".parse::<SublayerType>().unwrap(), SublayerType::T5FeedForward);
        assert_eq!("Identity".parse::<SublayerType>().unwrap(), SublayerType::Identity);
        assert!("Mixtral".parse::<SublayerType>().is_err());
        assert_eq!(SublayerType::T5FeedForward.to_string(), "T5FF");
    }

    #[test]
    fn deserialize_with_defaults() {
        let json = r#"{
            "expert_count": 2,
            "hidden_size": 16,
            "sublayer_type": "Identity",
            "centroids": [1.0, 0.0, 0.0, 1.0]
        }"#;
        let config: MoELayerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.sublayer_type, SublayerType::Identity);
        assert_eq!(config.embedding_size(), 2);
    }

    #[test]
    fn input_shape_from_dims() {
        let shape = InputShape::from_dims(&[2, 3, 4]).unwrap();
        assert_eq!(shape.token_count(), 6);
        assert_eq!(shape.numel(), 24);
        assert!(InputShape::from_dims(&[6, 4]).is_err());
    }
}
