//! Shared test utilities for moe-core.
//!
//! Mock expert providers for exercising the dispatch pipeline without real
//! parameters, and fixtures for writing small dense-expert archives.

mod fixtures;
mod mock_provider;

pub use fixtures::{dense_expert_tensors, two_expert_config, wave, write_dense_archive};
pub use mock_provider::{FailingProvider, ProviderEvent, RecordingProvider};
