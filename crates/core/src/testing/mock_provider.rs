use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::ThreadId;

use crate::error::{MoEError, Result};
use crate::experts::ExpertWeightProvider;

/// One provider call observed by [`RecordingProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderEvent {
    Load { expert: usize },
    /// `expert` is the id found in the slot's weight region at compute time.
    Compute { expert: usize, tokens: usize },
}

/// Provider whose "parameters" are just the expert id.
///
/// Loading writes the id into the slot; compute reads it back and scales the
/// input by `id + 1`. A slot whose weights were overwritten too early
/// therefore produces visibly wrong output. Every call is logged in order.
///
/// Clones share one log, so a clone kept by the test observes a provider
/// boxed into a layer.
#[derive(Clone)]
pub struct RecordingProvider {
    embedding_size: usize,
    events: Arc<Mutex<Vec<ProviderEvent>>>,
    load_threads: Arc<Mutex<Vec<ThreadId>>>,
}

impl RecordingProvider {
    pub fn new(embedding_size: usize) -> Self {
        Self {
            embedding_size,
            events: Arc::default(),
            load_threads: Arc::default(),
        }
    }

    /// Scale applied by expert `expert`.
    pub fn scale(expert: usize) -> f32 {
        expert as f32 + 1.0
    }

    pub fn events(&self) -> Vec<ProviderEvent> {
        self.log().clone()
    }

    pub fn load_count(&self) -> usize {
        self.log()
            .iter()
            .filter(|e| matches!(e, ProviderEvent::Load { .. }))
            .count()
    }

    /// Thread that ran each weight load, in load order.
    pub fn load_threads(&self) -> Vec<ThreadId> {
        self.load_threads.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.log().clear();
        self.load_threads.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn log(&self) -> MutexGuard<'_, Vec<ProviderEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn resident_expert(weights: &[u8]) -> Result<usize> {
        let words: &[f32] = bytemuck::try_cast_slice(&weights[..4])
            .map_err(|e| MoEError::resource(e.to_string()))?;
        Ok(words[0] as usize)
    }
}

impl ExpertWeightProvider for RecordingProvider {
    fn weight_size(&self) -> usize {
        4
    }

    fn working_size(&self, token_count: usize) -> usize {
        token_count * 4
    }

    fn load_weights(&self, target: &mut [u8], expert_id: usize) -> Result<()> {
        let words: &mut [f32] = bytemuck::try_cast_slice_mut(&mut target[..4])
            .map_err(|e| MoEError::resource(e.to_string()))?;
        words[0] = expert_id as f32;
        self.log().push(ProviderEvent::Load { expert: expert_id });
        self.load_threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(std::thread::current().id());
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
        if input.len() != token_count * self.embedding_size || output.len() != input.len() {
            return Err(MoEError::data("recording provider got mis-sized buffers"));
        }
        let expert = Self::resident_expert(weights)?;
        let scale = Self::scale(expert);

        let scratch: &mut [f32] = bytemuck::try_cast_slice_mut(&mut working[..token_count * 4])
            .map_err(|e| MoEError::resource(e.to_string()))?;
        scratch.fill(scale);
        for (o, &x) in output.iter_mut().zip(input) {
            *o = x * scale;
        }
        self.log().push(ProviderEvent::Compute {
            expert,
            tokens: token_count,
        });
        Ok(())
    }

    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn terminate(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureMode {
    Load,
    Compute,
    Panic,
}

/// [`RecordingProvider`] that fails on one chosen expert.
pub struct FailingProvider {
    inner: RecordingProvider,
    expert: usize,
    mode: FailureMode,
    once: bool,
    fired: AtomicBool,
}

impl FailingProvider {
    fn new(embedding_size: usize, expert: usize, mode: FailureMode) -> Self {
        Self {
            inner: RecordingProvider::new(embedding_size),
            expert,
            mode,
            once: false,
            fired: AtomicBool::new(false),
        }
    }

    /// Return an error when loading `expert`.
    pub fn on_load(embedding_size: usize, expert: usize) -> Self {
        Self::new(embedding_size, expert, FailureMode::Load)
    }

    /// Return an error when computing `expert`.
    pub fn on_compute(embedding_size: usize, expert: usize) -> Self {
        Self::new(embedding_size, expert, FailureMode::Compute)
    }

    /// Panic when computing `expert`.
    pub fn panic_on_compute(embedding_size: usize, expert: usize) -> Self {
        Self::new(embedding_size, expert, FailureMode::Panic)
    }

    /// Fail only the first time.
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    pub fn events(&self) -> Vec<ProviderEvent> {
        self.inner.events()
    }

    fn trips(&self, mode: FailureMode, expert: usize) -> bool {
        if self.mode != mode || self.expert != expert {
            return false;
        }
        !self.once || !self.fired.swap(true, Ordering::SeqCst)
    }
}

impl ExpertWeightProvider for FailingProvider {
    fn weight_size(&self) -> usize {
        self.inner.weight_size()
    }

    fn working_size(&self, token_count: usize) -> usize {
        self.inner.working_size(token_count)
    }

    fn load_weights(&self, target: &mut [u8], expert_id: usize) -> Result<()> {
        if self.trips(FailureMode::Load, expert_id) {
            return Err(MoEError::data(format!("injected load failure for expert {expert_id}")));
        }
        self.inner.load_weights(target, expert_id)
    }

    fn compute(
        &self,
        token_count: usize,
        weights: &[u8],
        input: &[f32],
        output: &mut [f32],
        working: &mut [u8],
    ) -> Result<()> {
        let expert = RecordingProvider::resident_expert(weights)?;
        if self.trips(FailureMode::Compute, expert) {
            return Err(MoEError::data(format!("injected compute failure for expert {expert}")));
        }
        if self.trips(FailureMode::Panic, expert) {
            panic!("injected panic in expert {expert}");
        }
        self.inner.compute(token_count, weights, input, output, working)
    }

    fn initialize(&mut self) -> Result<()> {
        self.inner.initialize()
    }

    fn terminate(&mut self) {
        self.inner.terminate()
    }
}
