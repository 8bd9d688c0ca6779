//! Top-1 Mixture of Experts (MoE) dispatch.
//!
//! One [`MoELayer::dispatch`] call runs the whole pipeline inside a single
//! caller-provided [`Workspace`]:
//!
//! 1. [`router`] scores tokens against the expert centroids and picks one
//!    expert per token with a mixing coefficient
//! 2. [`shuffle`] groups tokens into contiguous per-expert buckets
//! 3. [`executor`] streams each active expert's parameters into one of `K`
//!    reusable slots and runs the expert over its bucket, overlapping the next
//!    transfer with the current compute
//! 4. [`combine`] blends expert outputs with their inputs and writes them
//!    back in original token order
//!
//! [`layout`] decides where every intermediate lives in the workspace and
//! [`codec`] is the binary form of the layer configuration.

pub mod codec;
pub mod combine;
pub mod executor;
mod layer;
pub mod layout;
mod queue;
pub mod router;
pub mod shuffle;
mod workspace;

pub use codec::{deserialize_config, serialization_size, serialize_config, METADATA_LENGTH};
pub use executor::{ExecutionReport, PipelinedExpertExecutor};
pub use layer::{DispatchReport, MoELayer};
pub use layout::{LayoutParams, Region, RegionKind, SlotRegion, WorkspaceLayout};
pub use queue::ExecutionQueue;
pub use router::CentroidRouter;
pub use shuffle::{shuffle_tokens, ExpertBuckets, ShuffleTargets};
pub use workspace::{SlotMemory, Workspace};
