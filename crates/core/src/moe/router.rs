//! Centroid gating router.
//!
//! Scores every token against the expert centroid table with one dense
//! matmul and assigns the token to its best-scoring expert (top-1).
//!
//! ## Mixing coefficient
//!
//! The coefficient handed to the combiner is the softmax probability of the
//! winning expert over the token's affinity row:
//!
//! ```text
//! coeff[n] = 1 / Σ_e exp(affinity[n][e] - affinity[n][winner])
//! ```
//!
//! It lies in `(0, 1]`, is exactly 1 with a single expert, and is `1/k` for
//! a `k`-way tie. Ties go to the lowest expert id.

use candle_core::{CpuStorage, Device, Storage, Tensor};
use once_cell::sync::OnceCell;

use crate::error::{MoEError, Result};

/// Top-1 router over a fixed `E × D` centroid table.
///
/// The host copy of the table lives for the router's lifetime. The device
/// copy is created on first use and dropped by [`Self::release_device`].
pub struct CentroidRouter {
    host_centroids: Vec<f32>,
    expert_count: usize,
    embedding_size: usize,
    device: Device,
    /// Transposed `D × E` centroid table on `device`.
    device_centroids: OnceCell<Tensor>,
}

impl CentroidRouter {
    /// Create a router from a row-major `expert_count × D` centroid table.
    pub fn new(centroids: Vec<f32>, expert_count: usize, device: Device) -> Result<Self> {
        if expert_count == 0 || centroids.is_empty() || centroids.len() % expert_count != 0 {
            return Err(MoEError::config(format!(
                "{} centroid values cannot form {expert_count} expert rows",
                centroids.len()
            )));
        }
        let embedding_size = centroids.len() / expert_count;
        Ok(Self {
            host_centroids: centroids,
            expert_count,
            embedding_size,
            device,
            device_centroids: OnceCell::new(),
        })
    }

    pub fn expert_count(&self) -> usize {
        self.expert_count
    }

    pub fn embedding_size(&self) -> usize {
        self.embedding_size
    }

    /// Host copy of the centroid table.
    pub fn centroids(&self) -> &[f32] {
        &self.host_centroids
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Whether the device mirror has been created.
    pub fn is_mirrored(&self) -> bool {
        self.device_centroids.get().is_some()
    }

    /// Drop the device mirror; the next route re-creates it.
    pub fn release_device(&mut self) {
        self.device_centroids.take();
    }

    fn device_centroids(&self) -> Result<&Tensor> {
        self.device_centroids.get_or_try_init(|| {
            tracing::debug!(
                experts = self.expert_count,
                embedding = self.embedding_size,
                device = ?self.device,
                "mirroring expert centroids to device"
            );
            let table = Tensor::from_slice(
                &self.host_centroids,
                (self.expert_count, self.embedding_size),
                &self.device,
            )?;
            Ok(table.t()?.contiguous()?)
        })
    }

    /// Affinity scores `[num_tokens, expert_count]` for `num_tokens × D`
    /// row-major token features.
    pub fn affinities(&self, tokens: &[f32], num_tokens: usize) -> Result<Tensor> {
        let input = Tensor::from_slice(tokens, (num_tokens, self.embedding_size), &self.device)?;
        Ok(input.matmul(self.device_centroids()?)?)
    }

    /// Route `assignments.len()` tokens.
    ///
    /// Writes the full affinity matrix into `affinity`, the winning expert
    /// per token into `assignments`, and the winner's mixing coefficient into
    /// `mix`. Blocks until the affinity computation has finished.
    pub fn route(
        &self,
        tokens: &[f32],
        affinity: &mut [f32],
        assignments: &mut [u32],
        mix: &mut [f32],
    ) -> Result<()> {
        let num_tokens = assignments.len();
        let e = self.expert_count;
        if tokens.len() != num_tokens * self.embedding_size
            || affinity.len() != num_tokens * e
            || mix.len() != num_tokens
        {
            return Err(MoEError::data(format!(
                "router buffers disagree with {num_tokens} tokens of width {}",
                self.embedding_size
            )));
        }
        if num_tokens == 0 {
            return Ok(());
        }

        let scores = self.affinities(tokens, num_tokens)?;
        copy_scores(&scores, affinity)?;

        for (n, row) in affinity.chunks_exact(e).enumerate() {
            let winner = select_expert(row);
            assignments[n] = winner as u32;
            mix[n] = winner_confidence(row, winner);
        }
        Ok(())
    }
}

/// Copy an `N × E` score tensor into `affinity`.
fn copy_scores(scores: &Tensor, affinity: &mut [f32]) -> Result<()> {
    {
        let (storage, layout) = scores.storage_and_layout();
        if let (Storage::Cpu(CpuStorage::F32(data)), Some((start, end))) =
            (&*storage, layout.contiguous_offsets())
        {
            if end - start != affinity.len() {
                return Err(MoEError::data(format!(
                    "score tensor holds {} values, affinity region {}",
                    end - start,
                    affinity.len()
                )));
            }
            affinity.copy_from_slice(&data[start..end]);
            return Ok(());
        }
    }
    // Device scores come back through a single host transfer.
    let host = scores.flatten_all()?.to_vec1::<f32>()?;
    if host.len() != affinity.len() {
        return Err(MoEError::data(format!(
            "score tensor holds {} values, affinity region {}",
            host.len(),
            affinity.len()
        )));
    }
    affinity.copy_from_slice(&host);
    Ok(())
}

/// Softmax probability of `winner` over one affinity row.
pub fn winner_confidence(row: &[f32], winner: usize) -> f32 {
    let top = row[winner];
    1.0 / row.iter().map(|&a| (a - top).exp()).sum::<f32>()
}

impl Clone for CentroidRouter {
    /// Deep-copies the host table; the clone builds its own device mirror.
    fn clone(&self) -> Self {
        Self {
            host_centroids: self.host_centroids.clone(),
            expert_count: self.expert_count,
            embedding_size: self.embedding_size,
            device: self.device.clone(),
            device_centroids: OnceCell::new(),
        }
    }
}

/// Index of the highest score, preferring the lowest index on ties.
pub fn select_expert(scores: &[f32]) -> usize {
    let mut best = 0;
    for (e, &score) in scores.iter().enumerate().skip(1) {
        if score > scores[best] {
            best = e;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_expert_router() -> CentroidRouter {
        CentroidRouter::new(vec![1.0, 0.0, 0.0, 1.0], 2, Device::Cpu).unwrap()
    }

    fn route(router: &CentroidRouter, tokens: &[f32]) -> (Vec<f32>, Vec<u32>, Vec<f32>) {
        let n = tokens.len() / router.embedding_size();
        let mut affinity = vec![0.0; n * router.expert_count()];
        let mut assignments = vec![0; n];
        let mut mix = vec![0.0; n];
        router
            .route(tokens, &mut affinity, &mut assignments, &mut mix)
            .unwrap();
        (affinity, assignments, mix)
    }

    #[test]
    fn test_select_expert_lowest_id_on_tie() {
        assert_eq!(select_expert(&[1.0, 1.0]), 0);
        assert_eq!(select_expert(&[0.0, 2.0, 2.0]), 1);
        assert_eq!(select_expert(&[-1.0, 0.0]), 1);
        assert_eq!(select_expert(&[3.0]), 0);
    }

    #[test]
    fn test_route_reference_scenario() {
        let router = two_expert_router();
        let tokens = [1.0, 0.0, 0.0, 1.0, 1.0, 1.0, -1.0, 0.0];
        let (affinity, assignments, mix) = route(&router, &tokens);

        assert_eq!(affinity, vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0, -1.0, 0.0]);
        assert_eq!(assignments, vec![0, 1, 0, 1]);
        // Tie splits confidence evenly.
        assert!((mix[2] - 0.5).abs() < 1e-6);
        let expected = 1.0 / (1.0 + (-1.0f32).exp());
        assert!((mix[0] - expected).abs() < 1e-6);
        assert!((mix[3] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_winner_confidence_matches_softmax() {
        let row = [0.2f32, 1.7, -0.4, 1.1];
        let denom: f32 = row.iter().map(|a| a.exp()).sum();
        let expected = row[1].exp() / denom;
        assert!((winner_confidence(&row, 1) - expected).abs() < 1e-6);
        assert!((winner_confidence(&[3.0, 3.0, 3.0], 0) - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(winner_confidence(&[-5.0], 0), 1.0);
    }

    #[test]
    fn test_affinity_region_holds_routed_scores() {
        let router = CentroidRouter::new(vec![2.0, 0.5, -1.0, 3.0, 0.0, 1.0], 3, Device::Cpu).unwrap();
        let tokens = [1.0, 2.0, -0.5, 0.25];
        let (affinity, assignments, mix) = route(&router, &tokens);
        assert_eq!(affinity, vec![3.0, 5.0, 2.0, -0.875, 1.25, 0.25]);
        assert_eq!(assignments, vec![1, 1]);
        for (n, row) in affinity.chunks_exact(3).enumerate() {
            assert_eq!(mix[n], winner_confidence(row, assignments[n] as usize));
        }
    }

    #[test]
    fn test_single_expert_full_confidence() {
        let router = CentroidRouter::new(vec![0.3, -0.7, 2.0], 1, Device::Cpu).unwrap();
        let tokens: Vec<f32> = (0..15).map(|i| i as f32 * 0.1 - 0.5).collect();
        let (_, assignments, mix) = route(&router, &tokens);
        assert!(assignments.iter().all(|&a| a == 0));
        assert!(mix.iter().all(|&c| (c - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_route_is_deterministic() {
        let router = CentroidRouter::new(
            (0..12).map(|i| (i as f32 * 0.37).sin()).collect(),
            4,
            Device::Cpu,
        )
        .unwrap();
        let tokens: Vec<f32> = (0..30).map(|i| (i as f32 * 0.11).cos()).collect();
        assert_eq!(route(&router, &tokens), route(&router, &tokens));
    }

    #[test]
    fn test_mirror_is_lazy_and_releasable() {
        let mut router = two_expert_router();
        assert!(!router.is_mirrored());
        route(&router, &[1.0, 0.0]);
        assert!(router.is_mirrored());

        let clone = router.clone();
        assert!(!clone.is_mirrored());
        assert_eq!(clone.centroids(), router.centroids());

        router.release_device();
        assert!(!router.is_mirrored());
    }

    #[test]
    fn test_rejects_ragged_table() {
        assert!(CentroidRouter::new(vec![1.0, 2.0, 3.0], 2, Device::Cpu).is_err());
        assert!(CentroidRouter::new(vec![], 1, Device::Cpu).is_err());
    }

    #[test]
    fn test_route_rejects_mismatched_buffers() {
        let router = two_expert_router();
        let mut affinity = vec![0.0; 2];
        let mut assignments = vec![0; 2];
        let mut mix = vec![0.0; 2];
        let err = router
            .route(&[1.0, 0.0, 0.0, 1.0], &mut affinity, &mut assignments, &mut mix)
            .unwrap_err();
        assert!(matches!(err, MoEError::Data(_)));
    }

    #[test]
    fn test_route_empty_batch() {
        let router = two_expert_router();
        let (affinity, assignments, mix) = route(&router, &[]);
        assert!(affinity.is_empty() && assignments.is_empty() && mix.is_empty());
    }
}
