//! Token shuffling by expert assignment.
//!
//! Reorders the batch so that all tokens routed to the same expert sit in one
//! contiguous bucket, buckets ordered by expert id. Within a bucket tokens keep
//! their original relative order, which makes the permutation deterministic.
//!
//! The shuffle is a counting sort:
//! 1. Count tokens per expert
//! 2. Exclusive prefix sum gives each bucket's start
//! 3. Scatter token features, mixing coefficients and original positions
//!    through per-expert cursors

use std::ops::Range;

use crate::error::{MoEError, Result};

/// Bucket boundaries produced by [`shuffle_tokens`].
///
/// `offsets` has `expert_count + 1` entries; expert `e` owns shuffled rows
/// `offsets[e]..offsets[e + 1]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpertBuckets {
    offsets: Vec<usize>,
}

impl ExpertBuckets {
    /// Build buckets from per-expert token counts.
    pub fn from_counts(counts: &[usize]) -> Self {
        let mut offsets = Vec::with_capacity(counts.len() + 1);
        offsets.push(0);
        let mut total = 0;
        for &count in counts {
            total += count;
            offsets.push(total);
        }
        Self { offsets }
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn expert_count(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Tokens routed to `expert`.
    pub fn count(&self, expert: usize) -> usize {
        self.offsets[expert + 1] - self.offsets[expert]
    }

    /// Shuffled row range owned by `expert`.
    pub fn range(&self, expert: usize) -> Range<usize> {
        self.offsets[expert]..self.offsets[expert + 1]
    }

    /// Experts with at least one token, ascending.
    pub fn non_empty_experts(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.expert_count()).filter(move |&e| self.count(e) > 0)
    }

    pub fn token_count(&self) -> usize {
        self.offsets[self.offsets.len() - 1]
    }
}

/// Buffers written by [`shuffle_tokens`], all in shuffled order.
pub struct ShuffleTargets<'a> {
    /// `N` original token indices.
    pub positions: &'a mut [u32],
    /// `N × D` token features.
    pub features: &'a mut [f32],
    /// `N` mixing coefficients.
    pub mix: &'a mut [f32],
}

/// Group `assignments.len()` tokens into contiguous per-expert buckets.
///
/// `input` holds the `N × D` features in original order and `mix` the
/// router's coefficients in original order.
pub fn shuffle_tokens(
    assignments: &[u32],
    mix: &[f32],
    input: &[f32],
    embedding_size: usize,
    expert_count: usize,
    targets: ShuffleTargets<'_>,
) -> Result<ExpertBuckets> {
    let n = assignments.len();
    let d = embedding_size;
    if mix.len() != n
        || input.len() != n * d
        || targets.positions.len() != n
        || targets.features.len() != n * d
        || targets.mix.len() != n
    {
        return Err(MoEError::data(format!(
            "shuffle buffers disagree with {n} tokens of width {d}"
        )));
    }

    let mut counts = vec![0usize; expert_count];
    for (token, &expert) in assignments.iter().enumerate() {
        let slot = counts.get_mut(expert as usize).ok_or_else(|| {
            MoEError::data(format!(
                "token {token} assigned to expert {expert}, layer has {expert_count}"
            ))
        })?;
        *slot += 1;
    }

    let buckets = ExpertBuckets::from_counts(&counts);
    let mut cursors = buckets.offsets[..expert_count].to_vec();

    for (token, &expert) in assignments.iter().enumerate() {
        let row = cursors[expert as usize];
        cursors[expert as usize] += 1;

        targets.positions[row] = token as u32;
        targets.mix[row] = mix[token];
        targets.features[row * d..(row + 1) * d].copy_from_slice(&input[token * d..(token + 1) * d]);
    }

    Ok(buckets)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Shuffled {
        buckets: ExpertBuckets,
        positions: Vec<u32>,
        features: Vec<f32>,
        mix: Vec<f32>,
    }

    fn run(assignments: &[u32], input: &[f32], d: usize, e: usize) -> Shuffled {
        let n = assignments.len();
        let mix: Vec<f32> = (0..n).map(|i| i as f32 / 10.0).collect();
        let mut positions = vec![0; n];
        let mut features = vec![0.0; n * d];
        let mut routed_mix = vec![0.0; n];
        let buckets = shuffle_tokens(
            assignments,
            &mix,
            input,
            d,
            e,
            ShuffleTargets {
                positions: &mut positions,
                features: &mut features,
                mix: &mut routed_mix,
            },
        )
        .unwrap();
        Shuffled {
            buckets,
            positions,
            features,
            mix: routed_mix,
        }
    }

    #[test]
    fn test_reference_scenario() {
        let input = [1.0, 0.0, 0.0, 1.0, 1.0, 1.0, -1.0, 0.0];
        let out = run(&[0, 1, 0, 1], &input, 2, 2);

        assert_eq!(out.buckets.offsets(), &[0, 2, 4]);
        assert_eq!(out.positions, vec![0, 2, 1, 3]);
        assert_eq!(out.features, vec![1.0, 0.0, 1.0, 1.0, 0.0, 1.0, -1.0, 0.0]);
        assert_eq!(out.mix, vec![0.0, 0.2, 0.1, 0.3]);
    }

    #[test]
    fn test_buckets_partition_tokens() {
        let assignments = [3, 0, 3, 3, 1, 0, 3, 1, 3];
        let input: Vec<f32> = (0..assignments.len()).map(|i| i as f32).collect();
        let out = run(&assignments, &input, 1, 5);

        assert_eq!(out.buckets.token_count(), assignments.len());
        assert_eq!(out.buckets.count(0), 2);
        assert_eq!(out.buckets.count(2), 0);
        assert_eq!(out.buckets.count(3), 5);
        assert_eq!(out.buckets.count(4), 0);
        assert_eq!(
            out.buckets.non_empty_experts().collect::<Vec<_>>(),
            vec![0, 1, 3]
        );

        for e in 0..5 {
            for row in out.buckets.range(e) {
                assert_eq!(assignments[out.positions[row] as usize], e as u32);
            }
        }

        let mut seen = out.positions.clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..assignments.len() as u32).collect::<Vec<_>>());
    }

    #[test]
    fn test_stable_within_bucket() {
        let out = run(&[1, 1, 0, 1, 0], &[0.0; 5], 1, 2);
        assert_eq!(out.positions, vec![2, 4, 0, 1, 3]);
    }

    #[test]
    fn test_features_follow_positions() {
        let d = 3;
        let assignments = [2, 0, 1, 2, 0];
        let input: Vec<f32> = (0..assignments.len() * d).map(|i| i as f32 * 0.5).collect();
        let out = run(&assignments, &input, d, 3);
        for (row, &token) in out.positions.iter().enumerate() {
            let token = token as usize;
            assert_eq!(
                &out.features[row * d..(row + 1) * d],
                &input[token * d..(token + 1) * d]
            );
            assert_eq!(out.mix[row], token as f32 / 10.0);
        }
    }

    #[test]
    fn test_empty_batch() {
        let out = run(&[], &[], 4, 3);
        assert_eq!(out.buckets.offsets(), &[0, 0, 0, 0]);
        assert_eq!(out.buckets.non_empty_experts().count(), 0);
    }

    #[test]
    fn test_rejects_out_of_range_expert() {
        let mut positions = vec![0; 1];
        let mut features = vec![0.0; 1];
        let mut mix = vec![0.0; 1];
        let err = shuffle_tokens(
            &[2],
            &[1.0],
            &[1.0],
            1,
            2,
            ShuffleTargets {
                positions: &mut positions,
                features: &mut features,
                mix: &mut mix,
            },
        )
        .unwrap_err();
        assert!(matches!(err, MoEError::Data(_)));
    }
}
