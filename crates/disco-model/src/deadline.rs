//! Per-call deadline around an engine.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use ndarray::{Array4, ArrayD};
use tracing::{debug, warn};

use crate::{EngineError, InferenceEngine, ModelSpec, Result};

/// Calls that may wait behind the one in flight.
pub const DEFAULT_QUEUE_DEPTH: usize = 1;

struct Job {
    input: Array4<f32>,
    expires: Instant,
    reply: Sender<Result<Vec<ArrayD<f32>>>>,
}

/// Runs the wrapped engine on one long-lived worker thread and gives up
/// waiting after `timeout`.
///
/// A call that times out keeps running on the worker until the engine
/// returns; its result is dropped. Jobs whose deadline passed while queued
/// are skipped. When the queue is full the caller gets
/// [`EngineError::Busy`] straight away, so a hung engine never costs more
/// than one thread.
pub struct Deadline {
    inner: Arc<dyn InferenceEngine>,
    jobs: Sender<Job>,
    timeout: Duration,
}

impl Deadline {
    pub fn new(inner: Arc<dyn InferenceEngine>, timeout: Duration) -> Result<Self> {
        Self::with_queue(inner, timeout, DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_queue(
        inner: Arc<dyn InferenceEngine>,
        timeout: Duration,
        depth: usize,
    ) -> Result<Self> {
        let (jobs, rx) = bounded(depth.max(1));
        let engine = Arc::clone(&inner);

        thread::Builder::new()
            .name(format!("{}-infer", inner.spec().name))
            .spawn(move || worker(engine, rx))
            .map_err(|e| EngineError::Inference(format!("failed to spawn inference worker: {e}")))?;

        Ok(Self {
            inner,
            jobs,
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Drains jobs until every `Deadline` handle is dropped.
fn worker(engine: Arc<dyn InferenceEngine>, rx: Receiver<Job>) {
    for job in rx.iter() {
        if Instant::now() >= job.expires {
            debug!(model = %engine.spec().name, "dropping expired inference job");
            continue;
        }
        let result = panic::catch_unwind(AssertUnwindSafe(|| engine.run(job.input)))
            .unwrap_or_else(|_| Err(EngineError::Inference("engine panicked".into())));
        // The caller is gone if it already timed out.
        let _ = job.reply.send(result);
    }
}

impl InferenceEngine for Deadline {
    fn spec(&self) -> &ModelSpec {
        self.inner.spec()
    }

    fn run(&self, input: Array4<f32>) -> Result<Vec<ArrayD<f32>>> {
        let (reply, rx) = bounded(1);
        let job = Job {
            input,
            expires: Instant::now() + self.timeout,
            reply,
        };

        match self.jobs.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(model = %self.inner.spec().name, "inference queue full");
                return Err(EngineError::Busy(self.inner.spec().name.clone()));
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err(EngineError::Inference("inference worker exited".into()));
            }
        }

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(model = %self.inner.spec().name, timeout = ?self.timeout, "inference deadline exceeded");
                Err(EngineError::Timeout(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::Inference(
                "inference worker exited without a result".into(),
            )),
        }
    }
}
