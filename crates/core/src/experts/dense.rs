//! T5-style gated-GELU feed-forward expert.
//!
//! Each expert computes
//!
//! ```text
//! ln(x)  = w_ln * x / sqrt(mean(x^2) + eps)
//! out    = x + (gelu(ln(x) @ wi_0^T) * (ln(x) @ wi_1^T)) @ wo^T
//! ```
//!
//! Slot weight layout (f32, row-major):
//! `[layer_norm_weight: D][wi_0: H x D][wi_1: H x D][wo: D x H]`.
//!
//! Working layout for `T` tokens:
//! `[ln_out: T x D][gate: T x H][up: T x H]`.

use std::path::PathBuf;

use super::archive::{ExpertArchive, ParamSpec};
use super::{align_to_word, ExpertWeightProvider};
use crate::error::{MoEError, Result};

const LAYER_NORM_WEIGHT: &str = "layer_norm_weight";
const WI_0_WEIGHT: &str = "wi_0_weight";
const WI_1_WEIGHT: &str = "wi_1_weight";
const WO_WEIGHT: &str = "wo_weight";

const LAYER_NORM_EPS: f32 = 1e-6;

/// Dense feed-forward expert backed by a packed parameter archive.
pub struct DenseFeedForward {
    expert_count: usize,
    embedding_size: usize,
    hidden_size: usize,
    weight_file: PathBuf,
    archive: Option<ExpertArchive>,
}

impl DenseFeedForward {
    pub fn new(
        expert_count: usize,
        embedding_size: usize,
        hidden_size: usize,
        weight_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            expert_count,
            embedding_size,
            hidden_size,
            weight_file: weight_file.into(),
            archive: None,
        }
    }

    /// Use an already-loaded archive instead of reading `weight_file`.
    pub fn with_archive(mut self, archive: ExpertArchive) -> Result<Self> {
        archive.validate(self.expert_count, &self.param_specs())?;
        self.archive = Some(archive);
        Ok(self)
    }

    /// Declared per-expert parameter shapes, in slot layout order.
    pub fn param_specs(&self) -> [ParamSpec; 4] {
        let (d, h) = (self.embedding_size, self.hidden_size);
        [
            ParamSpec::new(LAYER_NORM_WEIGHT, vec![d]),
            ParamSpec::new(WI_0_WEIGHT, vec![h, d]),
            ParamSpec::new(WI_1_WEIGHT, vec![h, d]),
            ParamSpec::new(WO_WEIGHT, vec![d, h]),
        ]
    }

    fn weight_floats(&self) -> usize {
        self.embedding_size + 3 * self.hidden_size * self.embedding_size
    }

    fn working_floats(&self, token_count: usize) -> usize {
        token_count * self.embedding_size + 2 * token_count * self.hidden_size
    }
}

impl ExpertWeightProvider for DenseFeedForward {
    fn weight_size(&self) -> usize {
        self.weight_floats() * std::mem::size_of::<f32>()
    }

    fn working_size(&self, token_count: usize) -> usize {
        self.working_floats(token_count) * std::mem::size_of::<f32>()
    }

    fn load_weights(&self, target: &mut [u8], expert_id: usize) -> Result<()> {
        let archive = self
            .archive
            .as_ref()
            .ok_or_else(|| MoEError::data("expert parameters are not initialized"))?;
        if target.len() < align_to_word(self.weight_size()) {
            return Err(MoEError::resource(format!(
                "slot weight region holds {} bytes, expert needs {}",
                target.len(),
                self.weight_size()
            )));
        }
        let target: &mut [f32] = bytemuck::try_cast_slice_mut(target)
            .map_err(|e| MoEError::resource(format!("misaligned slot weight region: {e}")))?;

        let mut cursor = 0;
        for spec in self.param_specs() {
            let values = archive.get(expert_id, spec.name).ok_or_else(|| {
                MoEError::data(format!(
                    "missing expert parameter {}",
                    ExpertArchive::key(expert_id, spec.name)
                ))
            })?;
            if values.len() != spec.numel() {
                return Err(MoEError::data(format!(
                    "{} holds {} values, expected {}",
                    ExpertArchive::key(expert_id, spec.name),
                    values.len(),
                    spec.numel()
                )));
            }
            target[cursor..cursor + values.len()].copy_from_slice(values);
            cursor += values.len();
        }
        Ok(())
    }

    fn compute(
        &self,
        token_count: usize,
        weights: &[u8],
        input: &[f32],
        output: &mut [f32],
        working: &mut [u8],
    ) -> Result<()> {
        let (d, h) = (self.embedding_size, self.hidden_size);
        let t = token_count;
        if input.len() != t * d || output.len() != t * d {
            return Err(MoEError::data(format!(
                "expert buffers hold {}/{} values, expected {}",
                input.len(),
                output.len(),
                t * d
            )));
        }

        if weights.len() < self.weight_size() {
            return Err(MoEError::resource(format!(
                "slot weight region holds {} bytes, expert needs {}",
                weights.len(),
                self.weight_size()
            )));
        }
        let weights: &[f32] = bytemuck::try_cast_slice(&weights[..self.weight_size()])
            .map_err(|e| MoEError::resource(format!("misaligned slot weight region: {e}")))?;
        let (ln_weight, rest) = weights.split_at(d);
        let (wi_0, rest) = rest.split_at(h * d);
        let (wi_1, wo) = rest.split_at(h * d);

        let working_bytes = self.working_size(t);
        if working.len() < working_bytes {
            return Err(MoEError::resource(format!(
                "slot working region holds {} bytes, expert needs {working_bytes}",
                working.len()
            )));
        }
        let working: &mut [f32] = bytemuck::try_cast_slice_mut(&mut working[..working_bytes])
            .map_err(|e| MoEError::resource(format!("misaligned slot working region: {e}")))?;
        let (ln_out, rest) = working.split_at_mut(t * d);
        let (gate, up) = rest.split_at_mut(t * h);

        rms_norm(input, ln_weight, ln_out, d, LAYER_NORM_EPS);
        linear(ln_out, wi_0, gate, d, h);
        linear(ln_out, wi_1, up, d, h);
        gelu_mul(gate, up);

        output.copy_from_slice(input);
        linear_accumulate(up, wo, output, h, d);
        Ok(())
    }

    fn initialize(&mut self) -> Result<()> {
        if self.archive.is_some() {
            return Ok(());
        }
        let archive = ExpertArchive::load(&self.weight_file)?;
        archive.validate(self.expert_count, &self.param_specs())?;
        tracing::info!(
            path = %self.weight_file.display(),
            experts = self.expert_count,
            bytes_per_expert = self.weight_size(),
            "loaded dense expert parameters"
        );
        self.archive = Some(archive);
        Ok(())
    }

    fn terminate(&mut self) {
        self.archive = None;
    }
}

/// T5 layer norm: scale only, no mean subtraction, no bias.
fn rms_norm(input: &[f32], weight: &[f32], out: &mut [f32], width: usize, eps: f32) {
    for (x, y) in input.chunks_exact(width).zip(out.chunks_exact_mut(width)) {
        let mean_sq = x.iter().map(|v| v * v).sum::<f32>() / width as f32;
        let inv = 1.0 / (mean_sq + eps).sqrt();
        for ((y, &x), &w) in y.iter_mut().zip(x).zip(weight) {
            *y = w * x * inv;
        }
    }
}

/// `out[t][j] = Σ_k x[t][k] * w[j][k]` for `w` of shape `[out_width, in_width]`.
fn linear(x: &[f32], w: &[f32], out: &mut [f32], in_width: usize, out_width: usize) {
    for (row, out_row) in x.chunks_exact(in_width).zip(out.chunks_exact_mut(out_width)) {
        for (o, w_row) in out_row.iter_mut().zip(w.chunks_exact(in_width)) {
            *o = dot(row, w_row);
        }
    }
}

/// Like [`linear`] but adds into `out`.
fn linear_accumulate(x: &[f32], w: &[f32], out: &mut [f32], in_width: usize, out_width: usize) {
    for (row, out_row) in x.chunks_exact(in_width).zip(out.chunks_exact_mut(out_width)) {
        for (o, w_row) in out_row.iter_mut().zip(w.chunks_exact(in_width)) {
            *o += dot(row, w_row);
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `up = gelu(gate) * up`, tanh approximation.
fn gelu_mul(gate: &[f32], up: &mut [f32]) {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    for (u, &g) in up.iter_mut().zip(gate) {
        let inner = SQRT_2_OVER_PI * (g + 0.044_715 * g * g * g);
        *u *= 0.5 * g * (1.0 + inner.tanh());
    }
}
