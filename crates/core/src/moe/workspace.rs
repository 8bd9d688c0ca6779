//! Scratch arena for one dispatch invocation.
//!
//! The host allocates a [`Workspace`] of at least
//! [`crate::moe::MoELayer::compute_workspace_size`] bytes once per shape and
//! passes it to every dispatch. At dispatch time the arena is split into
//! disjoint typed slices following a [`WorkspaceLayout`], so each pipeline
//! stage (and each slot worker) gets exclusive access to exactly its region.

use super::layout::{Region, RegionKind, WorkspaceLayout};
use crate::error::{MoEError, Result};

const WORD_BYTES: usize = std::mem::size_of::<f32>();

/// Word-aligned scratch buffer.
#[derive(Debug, Default)]
pub struct Workspace {
    words: Vec<f32>,
}

impl Workspace {
    /// Allocate a zeroed workspace of at least `size_bytes` bytes.
    pub fn with_size(size_bytes: usize) -> Result<Self> {
        let word_count = size_bytes.div_ceil(WORD_BYTES);
        let mut words = Vec::new();
        words.try_reserve_exact(word_count).map_err(|e| {
            MoEError::resource(format!("cannot allocate {size_bytes}-byte workspace: {e}"))
        })?;
        words.resize(word_count, 0.0);
        Ok(Self { words })
    }

    /// Capacity in bytes.
    pub fn size_bytes(&self) -> usize {
        self.words.len() * WORD_BYTES
    }

    /// Split the arena into the regions of `layout`.
    pub(crate) fn partition(&mut self, layout: &WorkspaceLayout) -> Result<WorkspaceRegions<'_>> {
        if self.size_bytes() < layout.total_size() {
            return Err(MoEError::resource(format!(
                "workspace holds {} bytes, layout needs {}",
                self.size_bytes(),
                layout.total_size()
            )));
        }

        let mut carver = Carver {
            rest: &mut self.words[..],
            offset: 0,
        };
        let affinity = carver.take(layout.region(RegionKind::Affinity));
        let assignments = bytemuck::cast_slice_mut(carver.take(layout.region(RegionKind::AssignmentIds)));
        let positions =
            bytemuck::cast_slice_mut(carver.take(layout.region(RegionKind::OriginalPositions)));
        let routed = carver.take(layout.region(RegionKind::RoutedFeatures));
        let post_expert = carver.take(layout.region(RegionKind::PostExpertFeatures));
        let mix = carver.take(layout.region(RegionKind::MixCoefficients));
        let routed_mix = carver.take(layout.region(RegionKind::RoutedMixCoefficients));

        let slots = layout
            .slots()
            .iter()
            .enumerate()
            .map(|(index, slot)| SlotMemory {
                index,
                weights: bytemuck::cast_slice_mut(carver.take(slot.weights)),
                working: bytemuck::cast_slice_mut(carver.take(slot.working)),
            })
            .collect();

        Ok(WorkspaceRegions {
            affinity,
            assignments,
            positions,
            routed,
            post_expert,
            mix,
            routed_mix,
            slots,
        })
    }
}

/// Hands out consecutive regions from the front of the arena.
struct Carver<'a> {
    rest: &'a mut [f32],
    offset: usize,
}

impl<'a> Carver<'a> {
    fn take(&mut self, region: Region) -> &'a mut [f32] {
        debug_assert_eq!(region.offset, self.offset, "layout regions must be contiguous");
        let (head, tail) = std::mem::take(&mut self.rest).split_at_mut(region.len / WORD_BYTES);
        self.rest = tail;
        self.offset = region.end();
        head
    }
}

/// Typed, disjoint views of every workspace region for one invocation.
pub(crate) struct WorkspaceRegions<'a> {
    pub affinity: &'a mut [f32],
    pub assignments: &'a mut [u32],
    pub positions: &'a mut [u32],
    pub routed: &'a mut [f32],
    pub post_expert: &'a mut [f32],
    pub mix: &'a mut [f32],
    pub routed_mix: &'a mut [f32],
    pub slots: Vec<SlotMemory<'a>>,
}

/// Memory of one concurrency slot, owned by that slot's queue while the
/// pipeline runs.
#[derive(Debug)]
pub struct SlotMemory<'a> {
    pub index: usize,
    pub weights: &'a mut [u8],
    pub working: &'a mut [u8],
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moe::layout::LayoutParams;

    fn layout() -> WorkspaceLayout {
        WorkspaceLayout::plan_with_sizes(
            LayoutParams {
                token_capacity: 3,
                embedding_size: 2,
                expert_count: 2,
                concurrency: 2,
            },
            12,
            8,
        )
    }

    #[test]
    fn partition_sizes_match_layout() {
        let layout = layout();
        let mut ws = Workspace::with_size(layout.total_size()).unwrap();
        let regions = ws.partition(&layout).unwrap();
        assert_eq!(regions.affinity.len(), 6);
        assert_eq!(regions.assignments.len(), 3);
        assert_eq!(regions.positions.len(), 3);
        assert_eq!(regions.routed.len(), 6);
        assert_eq!(regions.post_expert.len(), 6);
        assert_eq!(regions.mix.len(), 3);
        assert_eq!(regions.routed_mix.len(), 3);
        assert_eq!(regions.slots.len(), 2);
        assert_eq!(regions.slots[1].index, 1);
        assert_eq!(regions.slots[1].weights.len(), 12);
        assert_eq!(regions.slots[1].working.len(), 8);
    }

    #[test]
    fn partition_rejects_small_workspace() {
        let layout = layout();
        let mut ws = Workspace::with_size(layout.total_size() - 4).unwrap();
        assert!(matches!(ws.partition(&layout), Err(MoEError::Resource(_))));
    }

    #[test]
    fn oversized_workspace_is_fine() {
        let layout = layout();
        let mut ws = Workspace::with_size(layout.total_size() * 2).unwrap();
        assert!(ws.partition(&layout).is_ok());
    }

    #[test]
    fn size_rounds_up_to_words() {
        let ws = Workspace::with_size(10).unwrap();
        assert_eq!(ws.size_bytes(), 12);
    }
}
