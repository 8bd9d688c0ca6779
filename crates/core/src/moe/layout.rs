//! Workspace layout planning.
//!
//! The whole dispatch pipeline runs inside one caller-provided scratch buffer.
//! This module decides, from the batch shape alone, how that buffer is carved
//! into named regions:
//!
//! ```text
//! ┌──────────┬────────┬───────────┬────────┬─────────┬─────┬────────────┬────────┬─────┬──────────┐
//! │ affinity │ expert │ original  │ routed │ post-   │ mix │ routed mix │ slot 0 │ ... │ slot K-1 │
//! │  M x E   │  ids M │ pos. M    │ M x D  │ expert  │  M  │     M      │ w + ws │     │  w + ws  │
//! │          │        │           │        │ M x D   │     │            │        │     │          │
//! └──────────┴────────┴───────────┴────────┴─────────┴─────┴────────────┴────────┴─────┴──────────┘
//! ```
//!
//! `M` is the worst-case token count routed to a single expert, which is the
//! whole batch. Planning is a pure function of the shape and the provider's
//! size functions; nothing is allocated here.

use crate::experts::{align_to_word, ExpertWeightProvider};

const F32_BYTES: usize = std::mem::size_of::<f32>();
const U32_BYTES: usize = std::mem::size_of::<u32>();

/// Named per-invocation regions, in layout order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// Token-to-expert affinity scores, `M × E` f32.
    Affinity,
    /// Selected expert per token, `M` u32.
    AssignmentIds,
    /// Shuffled position → original token index, `M` u32.
    OriginalPositions,
    /// Token features in bucket order, `M × D` f32.
    RoutedFeatures,
    /// Expert outputs in bucket order, `M × D` f32.
    PostExpertFeatures,
    /// Mixing coefficients in original token order, `M` f32.
    MixCoefficients,
    /// Mixing coefficients in bucket order, `M` f32.
    RoutedMixCoefficients,
}

impl RegionKind {
    pub const ALL: [RegionKind; 7] = [
        RegionKind::Affinity,
        RegionKind::AssignmentIds,
        RegionKind::OriginalPositions,
        RegionKind::RoutedFeatures,
        RegionKind::PostExpertFeatures,
        RegionKind::MixCoefficients,
        RegionKind::RoutedMixCoefficients,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Byte range `[offset, offset + len)` inside the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    pub offset: usize,
    pub len: usize,
}

impl Region {
    pub fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        !self.is_empty() && !other.is_empty() && self.offset < other.end() && other.offset < self.end()
    }
}

/// Weight and working sub-regions of one concurrency slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRegion {
    pub weights: Region,
    pub working: Region,
}

impl SlotRegion {
    pub fn span(&self) -> Region {
        Region::new(self.weights.offset, self.weights.len + self.working.len)
    }
}

/// Shape inputs to the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutParams {
    /// Worst-case token count `M` (batch size × sequence length).
    pub token_capacity: usize,
    pub embedding_size: usize,
    pub expert_count: usize,
    /// Number of concurrency slots `K`.
    pub concurrency: usize,
}

/// Static partition of the dispatch workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    params: LayoutParams,
    regions: [Region; 7],
    slots: Vec<SlotRegion>,
    total_size: usize,
}

impl WorkspaceLayout {
    /// Plan using the provider's size functions evaluated at `M`.
    pub fn plan(params: LayoutParams, provider: &dyn ExpertWeightProvider) -> Self {
        Self::plan_with_sizes(
            params,
            provider.weight_size(),
            provider.working_size(params.token_capacity),
        )
    }

    /// Plan with explicit per-slot weight and working byte counts.
    pub fn plan_with_sizes(params: LayoutParams, weight_size: usize, working_size: usize) -> Self {
        let m = params.token_capacity;
        let sizes = [
            m * params.expert_count * F32_BYTES,
            m * U32_BYTES,
            m * U32_BYTES,
            m * params.embedding_size * F32_BYTES,
            m * params.embedding_size * F32_BYTES,
            m * F32_BYTES,
            m * F32_BYTES,
        ];

        let mut cursor = 0;
        let mut regions = [Region::default(); 7];
        for (region, len) in regions.iter_mut().zip(sizes) {
            *region = Region::new(cursor, len);
            cursor += len;
        }

        let weights_len = align_to_word(weight_size);
        let working_len = align_to_word(working_size);
        let slots = (0..params.concurrency)
            .map(|_| {
                let weights = Region::new(cursor, weights_len);
                let working = Region::new(weights.end(), working_len);
                cursor = working.end();
                SlotRegion { weights, working }
            })
            .collect();

        Self {
            params,
            regions,
            slots,
            total_size: cursor,
        }
    }

    /// Total workspace bytes required.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn params(&self) -> &LayoutParams {
        &self.params
    }

    pub fn region(&self, kind: RegionKind) -> Region {
        self.regions[kind.index()]
    }

    pub fn slot(&self, index: usize) -> Option<&SlotRegion> {
        self.slots.get(index)
    }

    pub fn slots(&self) -> &[SlotRegion] {
        &self.slots
    }

    /// Bytes of one slot (`weight_size + working_size(M)`, word aligned).
    pub fn per_slot_size(&self) -> usize {
        self.slots.first().map_or(0, |s| s.span().len)
    }
}
