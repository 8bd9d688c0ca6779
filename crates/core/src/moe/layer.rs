//! MoE layer: lifecycle and the per-invocation dispatch pipeline.

use std::time::Instant;

use candle_core::Device;

use super::codec;
use super::combine::{combine, CombineSources};
use super::executor::PipelinedExpertExecutor;
use super::layout::{LayoutParams, WorkspaceLayout};
use super::queue::ExecutionQueue;
use super::router::CentroidRouter;
use super::shuffle::{shuffle_tokens, ShuffleTargets};
use super::workspace::Workspace;
use crate::config::{InputShape, MoELayerConfig};
use crate::error::{MoEError, Result};
use crate::experts::{build_provider, ExpertWeightProvider};

/// Outcome of one [`MoELayer::dispatch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub token_count: usize,
    /// Tokens routed to each expert, indexed by expert id.
    pub bucket_counts: Vec<usize>,
    /// Experts that ran, in execution order.
    pub experts_run: Vec<usize>,
    pub weight_loads: usize,
}

/// Top-1 mixture-of-experts feed-forward layer.
///
/// Lifecycle: construct → [`initialize`](Self::initialize) → any number of
/// [`dispatch`](Self::dispatch) calls → [`terminate`](Self::terminate).
/// The `max_concurrency` slot queues are started by `initialize` and serve
/// every dispatch until `terminate` joins them.
/// A layer owns its workspace for the duration of a dispatch and must not
/// be shared between overlapping invocations.
pub struct MoELayer {
    config: MoELayerConfig,
    router: CentroidRouter,
    provider: Box<dyn ExpertWeightProvider>,
    input_shape: Option<InputShape>,
    layout: Option<WorkspaceLayout>,
    queues: Vec<ExecutionQueue>,
    initialized: bool,
    poisoned: bool,
}

impl MoELayer {
    /// Build a layer on the CPU with the provider named by the config.
    pub fn new(config: MoELayerConfig) -> Result<Self> {
        Self::with_device(config, Device::Cpu)
    }

    /// Build a layer whose router runs on `device`.
    pub fn with_device(config: MoELayerConfig, device: Device) -> Result<Self> {
        config.validate()?;
        let provider = build_provider(&config);
        Self::assemble(config, provider, device)
    }

    /// Build a layer around a caller-supplied expert provider.
    pub fn with_provider(config: MoELayerConfig, provider: Box<dyn ExpertWeightProvider>) -> Result<Self> {
        config.validate()?;
        Self::assemble(config, provider, Device::Cpu)
    }

    fn assemble(config: MoELayerConfig, provider: Box<dyn ExpertWeightProvider>, device: Device) -> Result<Self> {
        let router = CentroidRouter::new(config.centroids.clone(), config.expert_count, device)?;
        tracing::debug!(
            experts = config.expert_count,
            embedding = router.embedding_size(),
            hidden = config.hidden_size,
            concurrency = config.max_concurrency,
            sublayer = %config.sublayer_type,
            "constructed MoE layer"
        );
        Ok(Self {
            config,
            router,
            provider,
            input_shape: None,
            layout: None,
            queues: Vec::new(),
            initialized: false,
            poisoned: false,
        })
    }

    pub fn config(&self) -> &MoELayerConfig {
        &self.config
    }

    pub fn embedding_size(&self) -> usize {
        self.router.embedding_size()
    }

    pub fn expert_count(&self) -> usize {
        self.config.expert_count
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Slot queues currently running.
    pub fn active_slots(&self) -> usize {
        self.queues.len()
    }

    /// Shape recorded by the last [`configure`](Self::configure).
    pub fn input_shape(&self) -> Option<InputShape> {
        self.input_shape
    }

    /// Validate and record the input dimensions `(batch, seq, D)`.
    pub fn configure(&mut self, dims: &[usize]) -> Result<InputShape> {
        let shape = InputShape::from_dims(dims)?;
        self.check_embedding(&shape)?;
        self.input_shape = Some(shape);
        Ok(shape)
    }

    /// The layer preserves its input shape.
    pub fn output_shape(&self, input: &InputShape) -> InputShape {
        *input
    }

    fn check_embedding(&self, shape: &InputShape) -> Result<()> {
        if shape.embedding_size != self.embedding_size() {
            return Err(MoEError::config(format!(
                "input embedding size {} does not match centroid width {}",
                shape.embedding_size,
                self.embedding_size()
            )));
        }
        Ok(())
    }

    /// Load the expert parameter table and start the slot queues.
    pub fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.provider.initialize()?;
        let queues: Result<Vec<_>> = (0..self.config.max_concurrency).map(ExecutionQueue::spawn).collect();
        self.queues = match queues {
            Ok(queues) => queues,
            Err(e) => {
                self.provider.terminate();
                return Err(e);
            }
        };
        self.initialized = true;
        self.poisoned = false;
        tracing::info!(
            experts = self.config.expert_count,
            sublayer = %self.config.sublayer_type,
            slots = self.queues.len(),
            "MoE layer initialized"
        );
        Ok(())
    }

    /// Join the slot queues and release the parameter table and the
    /// router's device mirror.
    pub fn terminate(&mut self) {
        for queue in self.queues.drain(..) {
            let index = queue.index();
            if let Err(e) = queue.shutdown() {
                tracing::warn!(slot = index, error = %e, "slot worker did not stop cleanly");
            }
        }
        if self.initialized {
            tracing::info!("MoE layer terminated");
        }
        self.provider.terminate();
        self.router.release_device();
        self.initialized = false;
        self.poisoned = false;
    }

    /// Deep copy of the configuration and centroids.
    ///
    /// The copy rebuilds its provider from the configuration and must be
    /// initialized before use.
    pub fn duplicate(&self) -> Result<Self> {
        let mut copy = Self::with_device(self.config.clone(), self.router.device().clone())?;
        copy.input_shape = self.input_shape;
        Ok(copy)
    }

    fn layout_params(&self, shape: &InputShape) -> LayoutParams {
        LayoutParams {
            token_capacity: shape.token_count(),
            embedding_size: shape.embedding_size,
            expert_count: self.config.expert_count,
            concurrency: self.config.max_concurrency,
        }
    }

    /// Workspace bytes [`dispatch`](Self::dispatch) needs for `shape`.
    pub fn compute_workspace_size(&self, shape: &InputShape) -> usize {
        let params = self.layout_params(shape);
        match &self.layout {
            Some(layout) if *layout.params() == params => layout.total_size(),
            _ => WorkspaceLayout::plan(params, self.provider.as_ref()).total_size(),
        }
    }

    /// Plan the layout for `shape` unless the cached one already fits.
    fn refresh_layout(&mut self, shape: &InputShape) {
        let params = self.layout_params(shape);
        if matches!(&self.layout, Some(layout) if *layout.params() == params) {
            return;
        }
        tracing::debug!(
            tokens = params.token_capacity,
            embedding = params.embedding_size,
            "planning workspace layout"
        );
        self.layout = Some(WorkspaceLayout::plan(params, self.provider.as_ref()));
    }

    /// Run the layer over `input` (`shape.numel()` f32, row-major
    /// `(batch, seq, D)`) and write the result to `output`.
    ///
    /// After an error the contents of `output` are unspecified.
    pub fn dispatch(
        &mut self,
        shape: &InputShape,
        input: &[f32],
        output: &mut [f32],
        workspace: &mut Workspace,
    ) -> Result<DispatchReport> {
        if self.poisoned {
            return Err(MoEError::Poisoned(
                "terminate and re-initialize the layer after a worker panic".into(),
            ));
        }
        if !self.initialized {
            return Err(MoEError::config("layer must be initialized before dispatch"));
        }
        self.check_embedding(shape)?;
        if input.len() != shape.numel() || output.len() != shape.numel() {
            return Err(MoEError::data(format!(
                "input/output hold {}/{} values, shape {:?} needs {}",
                input.len(),
                output.len(),
                shape.dims(),
                shape.numel()
            )));
        }

        let result = self.run_pipeline(shape, input, output, workspace);
        if let Err(e) = &result {
            if e.is_poisoning() {
                self.poisoned = true;
            }
            tracing::warn!(error = %e, "MoE dispatch failed");
        }
        result
    }

    fn run_pipeline(
        &mut self,
        shape: &InputShape,
        input: &[f32],
        output: &mut [f32],
        workspace: &mut Workspace,
    ) -> Result<DispatchReport> {
        let start = Instant::now();
        let n = shape.token_count();
        let d = shape.embedding_size;
        let e = self.config.expert_count;

        self.refresh_layout(shape);
        let layout = self
            .layout
            .as_ref()
            .ok_or_else(|| MoEError::resource("workspace layout is not planned"))?;
        let mut regions = workspace.partition(layout)?;

        self.router.route(
            input,
            &mut regions.affinity[..n * e],
            &mut regions.assignments[..n],
            &mut regions.mix[..n],
        )?;

        let buckets = shuffle_tokens(
            &regions.assignments[..n],
            &regions.mix[..n],
            input,
            d,
            e,
            ShuffleTargets {
                positions: &mut regions.positions[..n],
                features: &mut regions.routed[..n * d],
                mix: &mut regions.routed_mix[..n],
            },
        )?;

        let execution = PipelinedExpertExecutor::new(self.provider.as_ref(), d).run(
            &self.queues,
            &buckets,
            &regions.routed[..n * d],
            &mut regions.post_expert[..n * d],
            regions.slots,
        )?;

        combine(
            CombineSources {
                positions: &regions.positions[..n],
                pre: &regions.routed[..n * d],
                post: &regions.post_expert[..n * d],
                mix: &regions.routed_mix[..n],
            },
            d,
            output,
        )?;

        let bucket_counts: Vec<usize> = (0..e).map(|expert| buckets.count(expert)).collect();
        tracing::debug!(
            tokens = n,
            active_experts = execution.experts_run.len(),
            loads = execution.weight_loads,
            elapsed_us = start.elapsed().as_micros() as u64,
            "MoE dispatch complete"
        );
        Ok(DispatchReport {
            token_count: n,
            bucket_counts,
            experts_run: execution.experts_run,
            weight_loads: execution.weight_loads,
        })
    }

    /// Exact byte length of [`serialize`](Self::serialize).
    pub fn serialization_size(&self) -> Result<usize> {
        codec::serialization_size(&self.config)
    }

    /// Encode the layer configuration.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        codec::serialize_config(&self.config)
    }

    /// Rebuild a layer from [`serialize`](Self::serialize) output.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Self::new(codec::deserialize_config(bytes)?)
    }
}
