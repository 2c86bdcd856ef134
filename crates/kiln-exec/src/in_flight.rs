//! The set of operations that have been started but not yet observed as settled.
//!
//! Operations are spawned onto the runtime the instant they are admitted, so they
//! make progress while the executor is suspended elsewhere (pulling the source,
//! racing other operations). Settlement is only *observed* when a task is joined:
//! [`InFlight::reap`] collects everything that already finished without waiting,
//! [`InFlight::settle_next`] races all remaining tasks.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::{JoinError, JoinSet};

use crate::error::{ExecError, OperationFailure};
use crate::stats::RunStats;

type Settled<E> = (usize, Result<(), E>);

pub(crate) struct InFlight<E: 'static> {
    tasks: JoinSet<Settled<E>>,
    /// Raised by an operation the moment it fails, before anyone joins it.
    failure_flag: Arc<AtomicBool>,
    failures: Vec<OperationFailure<E>>,
    /// Keep every failure instead of only the first one observed.
    collect: bool,
    stats: RunStats,
}

impl<E: Send + 'static> InFlight<E> {
    pub fn new(collect: bool) -> Self {
        Self {
            tasks: JoinSet::new(),
            failure_flag: Arc::new(AtomicBool::new(false)),
            failures: Vec::new(),
            collect,
            stats: RunStats::default(),
        }
    }

    /// Spawn an operation. `index` is the source position of its item.
    pub fn start<Fut, R>(&mut self, index: usize, operation: Fut)
    where
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Send + 'static,
    {
        let failure_flag = Arc::clone(&self.failure_flag);
        self.tasks.spawn(async move {
            let result = operation.await.map(drop);
            if result.is_err() {
                failure_flag.store(true, Ordering::Release);
            }
            (index, result)
        });
        self.stats.started += 1;
    }

    /// Number of operations not yet observed as settled.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Record the current size as a candidate for the peak in-flight count.
    pub fn observe_peak(&mut self) {
        self.stats.peak_in_flight = self.stats.peak_in_flight.max(self.tasks.len());
    }

    /// Whether any operation has failed, observed or not.
    pub fn failure_signalled(&self) -> bool {
        self.failure_flag.load(Ordering::Acquire)
    }

    /// Whether a failure has been observed at a checkpoint.
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Collect every operation that has already settled, without suspending.
    pub fn reap(&mut self) -> Result<(), ExecError<E>> {
        while let Some(joined) = self.tasks.try_join_next() {
            self.record(joined)?;
        }
        Ok(())
    }

    /// Suspend until any one in-flight operation settles.
    ///
    /// Returns `Ok(false)` when nothing was in flight.
    pub async fn settle_next(&mut self) -> Result<bool, ExecError<E>> {
        match self.tasks.join_next().await {
            Some(joined) => self.record(joined).map(|()| true),
            None => Ok(false),
        }
    }

    /// Join every remaining operation, stopping early on an observed failure
    /// unless `collect` is set.
    pub async fn drain(&mut self, collect: bool) -> Result<(), ExecError<E>> {
        while self.settle_next().await? {
            if !collect && self.has_failures() {
                break;
            }
        }
        Ok(())
    }

    /// Keep joining until a failure is observed or nothing is left.
    pub async fn await_failure(&mut self) -> Result<(), ExecError<E>> {
        while !self.has_failures() && self.settle_next().await? {}
        Ok(())
    }

    /// Let the remaining operations run to completion on their own.
    pub fn detach(&mut self) {
        if !self.tasks.is_empty() {
            tracing::debug!(
                detached = self.tasks.len(),
                "Detaching in-flight operations"
            );
        }
        self.tasks.detach_all();
    }

    /// Consume the set, returning stats on success or the observed failures.
    pub fn finish(mut self) -> Result<RunStats, ExecError<E>> {
        if self.failures.is_empty() {
            Ok(self.stats)
        } else {
            Err(ExecError::from_failures(std::mem::take(&mut self.failures)))
        }
    }

    pub fn stats(&self) -> RunStats {
        self.stats
    }

    fn record(&mut self, joined: Result<Settled<E>, JoinError>) -> Result<(), ExecError<E>> {
        match joined {
            Ok((_, Ok(()))) => {
                self.stats.succeeded += 1;
                Ok(())
            }
            Ok((index, Err(error))) => {
                tracing::trace!(index, "Operation failure observed");
                self.stats.failed += 1;
                if self.collect || self.failures.is_empty() {
                    self.failures.push(OperationFailure { index, error });
                }
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Operation task did not complete");
                Err(ExecError::Join(e))
            }
        }
    }
}

impl<E: 'static> Drop for InFlight<E> {
    fn drop(&mut self) {
        // Started operations are never aborted, even when the run unwinds early.
        self.tasks.detach_all();
    }
}
