//! Pipelined expert execution.
//!
//! Runs every non-empty expert bucket over `K` concurrency slots so that the
//! parameter transfer for the next expert overlaps the compute of the
//! current one:
//!
//! ```text
//! slot 0: [load E0] [compute E0]           [load E2] [compute E2]
//! slot 1:           [load E1] [compute E1]           [load E3] ...
//! ```
//!
//! Expert `j` (in ascending id order over the non-empty buckets) always uses
//! slot `j mod K`. Before a slot's weight region is overwritten the caller
//! waits for that slot's queue, so parameters are never replaced while a
//! compute that reads them is still pending. Compute for expert `j` is
//! enqueued before that wait, which keeps a single slot (`K = 1`) correct.

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use super::queue::{self, ExecutionQueue, QueueScope};
use super::shuffle::ExpertBuckets;
use super::workspace::SlotMemory;
use crate::error::{MoEError, Result};
use crate::experts::ExpertWeightProvider;

/// Summary of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Experts that received tokens, in execution order.
    pub experts_run: Vec<usize>,
    /// Parameter transfers issued.
    pub weight_loads: usize,
}

/// Drives expert buckets through the slot pipeline.
pub struct PipelinedExpertExecutor<'p> {
    provider: &'p dyn ExpertWeightProvider,
    embedding_size: usize,
}

impl<'p> PipelinedExpertExecutor<'p> {
    pub fn new(provider: &'p dyn ExpertWeightProvider, embedding_size: usize) -> Self {
        Self {
            provider,
            embedding_size,
        }
    }

    /// Run each non-empty bucket of `routed` through its expert, writing the
    /// results to the same rows of `post_expert`.
    ///
    /// Slot `i` memory is only touched by `queues[i]`. Returns once every
    /// queue has drained. Empty buckets are skipped entirely: no transfer
    /// and no compute is issued for them.
    pub fn run(
        &self,
        queues: &[ExecutionQueue],
        buckets: &ExpertBuckets,
        routed: &[f32],
        post_expert: &mut [f32],
        slots: Vec<SlotMemory<'_>>,
    ) -> Result<ExecutionReport> {
        let d = self.embedding_size;
        if buckets.non_empty_experts().next().is_none() {
            return Ok(ExecutionReport::default());
        }
        if queues.is_empty() {
            return Err(MoEError::resource("pipeline has no slot queues"));
        }
        if slots.len() != queues.len() {
            return Err(MoEError::resource(format!(
                "{} slot regions for {} slot queues",
                slots.len(),
                queues.len()
            )));
        }
        let rows = buckets.token_count();
        if routed.len() < rows * d || post_expert.len() < rows * d {
            return Err(MoEError::data(format!(
                "routed buffers hold {}/{} values, {rows} tokens need {}",
                routed.len(),
                post_expert.len(),
                rows * d
            )));
        }

        let provider = self.provider;
        let slots: Vec<Mutex<SlotMemory<'_>>> = slots.into_iter().map(Mutex::new).collect();
        let start = Instant::now();

        let report = queue::scope(queues, |scope| {
            drive(
                scope,
                provider,
                &slots,
                buckets,
                &routed[..rows * d],
                &mut post_expert[..rows * d],
                d,
            )
        })?;

        tracing::debug!(
            experts = report.experts_run.len(),
            loads = report.weight_loads,
            slots = queues.len(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "expert pipeline drained"
        );
        Ok(report)
    }
}

fn drive<'scope, 'a: 'scope>(
    scope: &QueueScope<'scope, '_>,
    provider: &'scope dyn ExpertWeightProvider,
    slots: &'scope [Mutex<SlotMemory<'a>>],
    buckets: &ExpertBuckets,
    routed: &'scope [f32],
    mut rest: &'scope mut [f32],
    d: usize,
) -> Result<ExecutionReport> {
    let k = scope.len();
    let mut report = ExecutionReport::default();
    let mut experts = buckets.non_empty_experts().peekable();
    let Some(&first) = experts.peek() else {
        return Ok(report);
    };

    // Warm-up: the first expert's parameters must be resident before the
    // loop starts.
    let slot = &slots[0];
    scope.submit(0, move || load(provider, slot, first))?;
    report.weight_loads += 1;
    scope.synchronize(0)?;

    let mut j = 0;
    while let Some(expert) = experts.next() {
        // Buckets are contiguous and ascending, so output rows can be split
        // off the front one expert after another.
        let range = buckets.range(expert);
        let (output, tail) = std::mem::take(&mut rest).split_at_mut(range.len() * d);
        rest = tail;
        let input = &routed[range.start * d..range.end * d];
        let token_count = range.len();

        let slot = &slots[j % k];
        tracing::trace!(expert, slot = j % k, tokens = token_count, "enqueue expert");
        scope.submit(j % k, move || {
            compute(provider, slot, expert, token_count, input, output)
        })?;
        report.experts_run.push(expert);

        if let Some(&next) = experts.peek() {
            let reuse = (j + 1) % k;
            // Everything still pending on this slot reads its current weights.
            scope.synchronize(reuse)?;
            let slot = &slots[reuse];
            scope.submit(reuse, move || load(provider, slot, next))?;
            report.weight_loads += 1;
        }
        j += 1;
    }

    for q in 0..k {
        scope.synchronize(q)?;
    }
    Ok(report)
}

fn lock<'m, 'a>(slot: &'m Mutex<SlotMemory<'a>>) -> Result<MutexGuard<'m, SlotMemory<'a>>> {
    slot.lock()
        .map_err(|_| MoEError::Poisoned("slot memory was left inconsistent by a panic".into()))
}

fn load(provider: &dyn ExpertWeightProvider, slot: &Mutex<SlotMemory<'_>>, expert: usize) -> Result<()> {
    let mut guard = lock(slot)?;
    let slot = &mut *guard;
    provider
        .load_weights(slot.weights, expert)
        .map_err(|e| execution_error(slot.index, expert, e))
}

fn compute(
    provider: &dyn ExpertWeightProvider,
    slot: &Mutex<SlotMemory<'_>>,
    expert: usize,
    token_count: usize,
    input: &[f32],
    output: &mut [f32],
) -> Result<()> {
    let mut guard = lock(slot)?;
    let slot = &mut *guard;
    provider
        .compute(token_count, slot.weights, input, output, slot.working)
        .map_err(|e| execution_error(slot.index, expert, e))
}

fn execution_error(slot: usize, expert: usize, source: MoEError) -> MoEError {
    match source {
        MoEError::Poisoned(_) | MoEError::Execution { .. } => source,
        other => MoEError::Execution {
            slot,
            expert,
            message: other.to_string(),
        },
    }
}
