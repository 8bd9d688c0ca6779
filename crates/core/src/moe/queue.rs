//! Persistent in-order execution queues.
//!
//! Each concurrency slot is served by one [`ExecutionQueue`]: a worker thread
//! started when the layer initializes and joined when it terminates. Jobs run
//! strictly in submission order and jobs on different queues run
//! concurrently. [`ExecutionQueue::synchronize`] blocks the caller until
//! every job submitted so far has finished.
//!
//! Jobs that borrow per-invocation memory go through [`scope`], which fences
//! every queue before it returns.
//!
//! The first job error is sticky: later jobs on the same queue are skipped
//! and the error is reported by the next `synchronize`, after which the queue
//! is clean again. A panicking job breaks the queue for good; every later
//! fence reports [`MoEError::Poisoned`].

use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread::{JoinHandle, ThreadId};

use crate::error::{MoEError, Result};

type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

enum Command {
    Run(Job),
    Fence(mpsc::Sender<Result<()>>),
}

/// Handle to one slot worker.
pub struct ExecutionQueue {
    index: usize,
    sender: Option<mpsc::Sender<Command>>,
    handle: Option<JoinHandle<()>>,
}

impl ExecutionQueue {
    /// Start the worker for slot `index`.
    pub fn spawn(index: usize) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Command>();
        let handle = std::thread::Builder::new()
            .name(format!("moe-slot-{index}"))
            .spawn(move || worker_loop(index, receiver))
            .map_err(|e| MoEError::resource(format!("cannot start slot {index} worker: {e}")))?;

        Ok(Self {
            index,
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Id of the worker thread serving this queue.
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.handle.as_ref().map(|h| h.thread().id())
    }

    /// Enqueue `job`; returns immediately.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.send(Command::Run(Box::new(job)))
    }

    /// Block until every previously submitted job has finished, returning
    /// the first error any of them raised.
    pub fn synchronize(&self) -> Result<()> {
        let (reply, done) = mpsc::channel();
        self.send(Command::Fence(reply))?;
        done.recv().map_err(|_| self.lost())?
    }

    /// Run all remaining jobs, then stop the worker.
    pub fn shutdown(mut self) -> Result<()> {
        self.sender.take();
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| self.lost()),
            None => Ok(()),
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.sender
            .as_ref()
            .ok_or_else(|| self.lost())?
            .send(command)
            .map_err(|_| self.lost())
    }

    fn lost(&self) -> MoEError {
        MoEError::Poisoned(format!("slot {} worker terminated abnormally", self.index))
    }
}

impl Drop for ExecutionQueue {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(index: usize, receiver: mpsc::Receiver<Command>) {
    let mut failure: Option<MoEError> = None;
    let mut broken = false;
    for command in receiver {
        match command {
            Command::Run(job) => {
                if broken || failure.is_some() {
                    continue;
                }
                match panic::catch_unwind(AssertUnwindSafe(job)) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => failure = Some(e),
                    Err(_) => {
                        tracing::error!(slot = index, "slot job panicked");
                        broken = true;
                    }
                }
            }
            Command::Fence(reply) => {
                let result = if broken {
                    Err(MoEError::Poisoned(format!("slot {index} job panicked")))
                } else {
                    failure.take().map_or(Ok(()), Err)
                };
                let _ = reply.send(result);
            }
        }
    }
}

/// Submission handle for jobs that borrow data living at least `'env`.
///
/// Created by [`scope`]; queues are addressed by their position in the slice
/// the scope was opened over.
pub struct QueueScope<'scope, 'env: 'scope> {
    queues: &'scope [ExecutionQueue],
    scope: PhantomData<&'scope mut &'scope ()>,
    env: PhantomData<&'env mut &'env ()>,
}

impl<'scope> QueueScope<'scope, '_> {
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Enqueue `job` on queue `queue`; returns immediately.
    pub fn submit<F>(&self, queue: usize, job: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'scope,
    {
        let target = self.queue(queue)?;
        let job: Box<dyn FnOnce() -> Result<()> + Send + 'scope> = Box::new(job);
        // SAFETY: `scope` fences every queue before it returns, even when the
        // scope body fails or unwinds. A fence is answered only after the
        // worker has run or dropped every earlier job, so no job outlives the
        // borrows it captured.
        let job: Job = unsafe { std::mem::transmute(job) };
        target.send(Command::Run(job))
    }

    /// Fence queue `queue`.
    pub fn synchronize(&self, queue: usize) -> Result<()> {
        self.queue(queue)?.synchronize()
    }

    fn queue(&self, queue: usize) -> Result<&'scope ExecutionQueue> {
        self.queues.get(queue).ok_or_else(|| {
            MoEError::resource(format!("no queue {queue}, {} available", self.queues.len()))
        })
    }

    /// Fence every queue, returning the first failure.
    fn drain(&self) -> Result<()> {
        let mut first = Ok(());
        for queue in self.queues {
            let result = queue.synchronize();
            if first.is_ok() {
                first = result;
            }
        }
        first
    }
}

/// Run `f` with a handle for submitting borrowing jobs to `queues`.
///
/// Every queue is drained before this returns, whatever `f` did. The body's
/// error wins over a drain error.
pub fn scope<'env, F, T>(queues: &[ExecutionQueue], f: F) -> Result<T>
where
    F: for<'scope> FnOnce(&'scope QueueScope<'scope, 'env>) -> Result<T>,
{
    let handle = QueueScope {
        queues,
        scope: PhantomData,
        env: PhantomData,
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&handle)));
    let drained = handle.drain();
    match outcome {
        Err(payload) => panic::resume_unwind(payload),
        Ok(result) => {
            let value = result?;
            drained?;
            Ok(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn jobs_run_in_submission_order() {
        let queue = ExecutionQueue::spawn(0).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            queue
                .submit(move || {
                    log.lock().unwrap().push(i);
                    Ok(())
                })
                .unwrap();
        }
        queue.shutdown().unwrap();
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn synchronize_waits_for_pending_work() {
        let queue = ExecutionQueue::spawn(0).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            queue
                .submit(move || {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }
        queue.synchronize().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn first_error_is_sticky_until_synchronize() {
        let queue = ExecutionQueue::spawn(3).unwrap();
        let ran = Arc::new(Mutex::new(Vec::new()));
        queue.submit(|| Err(MoEError::data("first"))).unwrap();
        let skipped = Arc::clone(&ran);
        queue
            .submit(move || {
                skipped.lock().unwrap().push("skipped");
                Ok(())
            })
            .unwrap();
        let err = queue.synchronize().unwrap_err();
        assert_eq!(err.to_string(), "data error: first");

        let after = Arc::clone(&ran);
        queue
            .submit(move || {
                after.lock().unwrap().push("after");
                Ok(())
            })
            .unwrap();
        queue.synchronize().unwrap();
        assert_eq!(*ran.lock().unwrap(), vec!["after"]);
    }

    #[test]
    fn panicking_job_breaks_queue() {
        let queue = ExecutionQueue::spawn(1).unwrap();
        queue.submit(|| panic!("kernel fault")).unwrap();
        assert!(queue.synchronize().unwrap_err().is_poisoning());

        queue.submit(|| Ok(())).unwrap();
        assert!(queue.synchronize().unwrap_err().is_poisoning());
        queue.shutdown().unwrap();
    }

    #[test]
    fn worker_thread_is_reused_across_scopes() {
        let queues = vec![ExecutionQueue::spawn(0).unwrap()];
        let seen = Mutex::new(Vec::new());
        for _ in 0..3 {
            scope(&queues, |s| {
                let seen = &seen;
                s.submit(0, move || {
                    seen.lock().unwrap().push(std::thread::current().id());
                    Ok(())
                })
            })
            .unwrap();
        }
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|&id| Some(id) == queues[0].thread_id()));
    }

    #[test]
    fn scope_drains_before_returning() {
        let queues: Vec<_> = (0..2).map(|i| ExecutionQueue::spawn(i).unwrap()).collect();
        let mut cells = [0usize; 2];
        let (left, right) = cells.split_at_mut(1);
        scope(&queues, |s| {
            s.submit(0, move || {
                std::thread::sleep(std::time::Duration::from_millis(5));
                left[0] = 7;
                Ok(())
            })?;
            s.submit(1, move || {
                right[0] = 9;
                Ok(())
            })
        })
        .unwrap();
        assert_eq!(cells, [7, 9]);
    }

    #[test]
    fn scope_drains_when_body_fails() {
        let queues = vec![ExecutionQueue::spawn(0).unwrap()];
        let counter = AtomicUsize::new(0);
        let err = scope(&queues, |s| {
            let counter = &counter;
            s.submit(0, move || {
                std::thread::sleep(std::time::Duration::from_millis(5));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })?;
            Err::<(), _>(MoEError::data("body failed"))
        })
        .unwrap_err();
        assert!(matches!(err, MoEError::Data(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scope_reports_job_errors() {
        let queues = vec![ExecutionQueue::spawn(0).unwrap()];
        let err = scope(&queues, |s| s.submit(0, || Err(MoEError::data("late")))).unwrap_err();
        assert_eq!(err.to_string(), "data error: late");
        scope(&queues, |s| s.submit(0, || Ok(()))).unwrap();
    }

    #[test]
    fn scope_rejects_unknown_queue() {
        let queues = vec![ExecutionQueue::spawn(0).unwrap()];
        let err = scope(&queues, |s| s.submit(1, || Ok(()))).unwrap_err();
        assert!(matches!(err, MoEError::Resource(_)));
    }

    #[test]
    fn queues_run_concurrently() {
        let queues: Vec<_> = (0..2).map(|i| ExecutionQueue::spawn(i).unwrap()).collect();
        let (tx, rx) = mpsc::channel::<()>();
        scope(&queues, |s| {
            s.submit(0, move || rx.recv().map_err(|e| MoEError::data(e.to_string())))?;
            s.submit(1, move || tx.send(()).map_err(|e| MoEError::data(e.to_string())))
        })
        .unwrap();
    }
}
