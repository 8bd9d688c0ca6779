//! Expert sub-layer implementations.
//!
//! The dispatch pipeline only talks to experts through
//! [`ExpertWeightProvider`]. A provider knows how large one expert's parameter
//! block is, how to copy a given expert's parameters into a slot buffer, and
//! how to run the expert over a contiguous run of tokens using whatever
//! parameters are currently resident in a slot.
//!
//! ## Submodules
//!
//! - [`dense`]: T5-style gated-GELU feed-forward expert
//! - [`identity`]: Parameter-free passthrough expert
//! - [`archive`]: Packed parameter archive (`.safetensors` / `.npz`)

pub mod archive;
mod dense;
mod identity;

pub use archive::{ExpertArchive, ParamSpec};
pub use dense::DenseFeedForward;
pub use identity::IdentityExpert;

use crate::config::{MoELayerConfig, SublayerType};
use crate::error::Result;

/// Capability interface implemented by every expert type.
///
/// `load_weights` and `compute` run on slot worker threads, possibly several
/// at once for different slots, so implementations must be `Send + Sync`.
/// Sizes are in bytes and must be pure functions of the configuration.
pub trait ExpertWeightProvider: Send + Sync {
    /// Bytes needed to hold one expert's parameters.
    fn weight_size(&self) -> usize;

    /// Bytes of scratch needed to run `token_count` tokens through one expert.
    fn working_size(&self, token_count: usize) -> usize;

    /// Copy the parameters of `expert_id` into `target`.
    ///
    /// `target` is exactly `weight_size()` bytes long, rounded up to a
    /// 4-byte word, and 4-byte aligned.
    fn load_weights(&self, target: &mut [u8], expert_id: usize) -> Result<()>;

    /// Run `token_count` tokens through the expert whose parameters sit in
    /// `weights`, reading `input` and writing `output` (both
    /// `token_count × D` f32). `working` holds at least
    /// `working_size(token_count)` bytes.
    fn compute(
        &self,
        token_count: usize,
        weights: &[u8],
        input: &[f32],
        output: &mut [f32],
        working: &mut [u8],
    ) -> Result<()>;

    /// Load the full parameter table into host memory. Called once per layer
    /// lifetime, before the first dispatch.
    fn initialize(&mut self) -> Result<()>;

    /// Release the parameter table.
    fn terminate(&mut self);
}

/// Build the provider named by `config.sublayer_type`.
pub fn build_provider(config: &MoELayerConfig) -> Box<dyn ExpertWeightProvider> {
    let embedding_size = config.embedding_size();
    match config.sublayer_type {
        SublayerType::T5FeedForward => Box::new(DenseFeedForward::new(
            config.expert_count,
            embedding_size,
            config.hidden_size,
            config.weight_file.clone(),
        )),
        SublayerType::Identity => Box::new(IdentityExpert::new(embedding_size)),
    }
}

/// Round a byte count up to the 4-byte word used by the workspace arena.
pub(crate) fn align_to_word(bytes: usize) -> usize {
    bytes.div_ceil(4) * 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_to_word_rounds_up() {
        assert_eq!(align_to_word(0), 0);
        assert_eq!(align_to_word(1), 4);
        assert_eq!(align_to_word(4), 4);
        assert_eq!(align_to_word(10), 12);
    }

    #[test]
    fn build_provider_by_type() {
        let config = MoELayerConfig::new(
            2,
            4,
            vec![0.0; 6],
            "experts.safetensors",
            SublayerType::T5FeedForward,
        );
        let dense = build_provider(&config);
        // D = 3, H = 4: (3 + 3 * 4 * 3) floats
        assert_eq!(dense.weight_size(), (3 + 36) * 4);

        let config = MoELayerConfig {
            sublayer_type: SublayerType::Identity,
            ..config
        };
        let identity = build_provider(&config);
        assert_eq!(identity.weight_size(), 0);
        assert_eq!(identity.working_size(128), 0);
    }
}
