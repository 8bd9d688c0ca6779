//! Gather + blend back to original token order.
//!
//! For every shuffled row `r` holding original token `t`:
//!
//! ```text
//! output[t] = mix[r] * post[r] + (1 - mix[r]) * pre[r]
//! ```
//!
//! This is the only place the inverse permutation is applied.

use crate::error::{MoEError, Result};

/// Shuffled-order inputs to [`combine`].
pub struct CombineSources<'a> {
    /// Original token index per shuffled row.
    pub positions: &'a [u32],
    /// Pre-expert features, `N × D`.
    pub pre: &'a [f32],
    /// Expert outputs, `N × D`.
    pub post: &'a [f32],
    /// Mixing coefficient per shuffled row.
    pub mix: &'a [f32],
}

/// Blend expert outputs with their inputs into `output` (original order).
pub fn combine(sources: CombineSources<'_>, embedding_size: usize, output: &mut [f32]) -> Result<()> {
    let n = sources.positions.len();
    let d = embedding_size;
    if sources.pre.len() != n * d
        || sources.post.len() != n * d
        || sources.mix.len() != n
        || output.len() != n * d
    {
        return Err(MoEError::data(format!(
            "combine buffers disagree with {n} tokens of width {d}"
        )));
    }

    for (row, &token) in sources.positions.iter().enumerate() {
        let token = token as usize;
        if token >= n {
            return Err(MoEError::data(format!("shuffled row {row} maps to token {token} of {n}")));
        }
        let coeff = sources.mix[row];
        let span = row * d..(row + 1) * d;
        let pre = &sources.pre[span.clone()];
        let post = &sources.post[span];
        let out = &mut output[token * d..(token + 1) * d];
        for ((o, &p), &q) in out.iter_mut().zip(pre).zip(post) {
            *o = coeff * q + (1.0 - coeff) * p;
        }
    }
    Ok(())
}
