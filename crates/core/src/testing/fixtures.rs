use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};

use crate::config::{MoELayerConfig, SublayerType};
use crate::error::Result;
use crate::experts::{DenseFeedForward, ExpertArchive};

/// Two experts over `D = 2` with centroids `[1, 0]` and `[0, 1]`.
pub fn two_expert_config(sublayer_type: SublayerType) -> MoELayerConfig {
    MoELayerConfig::new(2, 4, vec![1.0, 0.0, 0.0, 1.0], "", sublayer_type)
}

/// Deterministic pseudo-random values in `[-scale, scale]`.
pub fn wave(len: usize, seed: usize, scale: f32) -> Vec<f32> {
    (0..len)
        .map(|i| ((i * 7 + seed * 13) as f32 * 0.618).sin() * scale)
        .collect()
}

/// Parameter tensors for `expert_count` dense experts.
pub fn dense_expert_tensors(
    expert_count: usize,
    embedding_size: usize,
    hidden_size: usize,
) -> Result<HashMap<String, Tensor>> {
    let specs = DenseFeedForward::new(expert_count, embedding_size, hidden_size, "").param_specs();
    let mut tensors = HashMap::new();
    for expert in 0..expert_count {
        for (i, spec) in specs.iter().enumerate() {
            let values = if i == 0 {
                vec![1.0; spec.numel()]
            } else {
                wave(spec.numel(), expert * specs.len() + i, 0.3)
            };
            let tensor = Tensor::from_vec(values, spec.dims.clone(), &Device::Cpu)?;
            tensors.insert(ExpertArchive::key(expert, spec.name), tensor);
        }
    }
    Ok(tensors)
}

/// Write a dense-expert safetensors archive to `path`.
pub fn write_dense_archive(
    path: impl AsRef<Path>,
    expert_count: usize,
    embedding_size: usize,
    hidden_size: usize,
) -> Result<()> {
    let tensors = dense_expert_tensors(expert_count, embedding_size, hidden_size)?;
    candle_core::safetensors::save(&tensors, path.as_ref())?;
    Ok(())
}
