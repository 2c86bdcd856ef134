//! Bounded-concurrency executor.
//!
//! Drives a transform over every item of a finite source while keeping at most
//! `limit` operations in flight. The admission protocol:
//!
//! 1. Pull one item, call the transform, spawn the resulting operation.
//! 2. Checkpoint: reap every operation that already settled. If the in-flight
//!    count is still at the limit, race all in-flight operations until one settles.
//! 3. Once the source is exhausted, join everything that is left.
//!
//! Failures are observed at checkpoints and at the final join, not when the
//! failing operation settles, so more operations may be started between a
//! failure and its detection. Started operations are never aborted.
//!
//! State transitions (Admitting → Throttled → Draining → Done/Failed) are
//! emitted as trace events on this module's target.

use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::pin;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::config::{Admission, ConfigError, ErrorMode, ExecutorConfig};
use crate::error::ExecError;
use crate::in_flight::InFlight;
use crate::stats::RunStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Admitting,
    Throttled,
    Draining,
    Done,
    Failed,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Admitting => "admitting",
            Self::Throttled => "throttled",
            Self::Draining => "draining",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// Why admission stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Exhausted,
    Cancelled,
    Failed,
}

/// Single-use executor. Build one per run.
///
/// Operations are spawned onto the current tokio runtime, so `run` must be
/// awaited inside one.
pub struct Executor {
    config: ExecutorConfig,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_limit(limit: usize) -> Result<Self, ConfigError> {
        ExecutorConfig::with_limit(limit).map(Self::new)
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Token shared with transforms for cooperative cancellation.
    ///
    /// The executor cancels it when the run fails. Cancelling it from outside
    /// stops admission; already started operations are still joined.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run over a synchronous source.
    pub async fn run_iter<I, F, Fut, R, E>(
        self,
        source: I,
        transform: F,
    ) -> Result<RunStats, ExecError<E>>
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> Fut,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
    {
        self.run(futures::stream::iter(source), transform).await
    }

    /// Apply `transform` to every item of `source`, in order, with at most
    /// `limit` operations in flight.
    ///
    /// Succeeds once every started operation has succeeded. Fails with the
    /// first failure observed at a checkpoint, or with all failures in
    /// [`ErrorMode::Collect`].
    pub async fn run<S, F, Fut, R, E>(
        self,
        source: S,
        transform: F,
    ) -> Result<RunStats, ExecError<E>>
    where
        S: Stream,
        F: FnMut(S::Item) -> Fut,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
    {
        let result = self.drive(source, transform).await;
        if result.is_err() {
            self.cancel.cancel();
        }
        result
    }

    async fn drive<S, F, Fut, R, E>(
        &self,
        source: S,
        mut transform: F,
    ) -> Result<RunStats, ExecError<E>>
    where
        S: Stream,
        F: FnMut(S::Item) -> Fut,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
    {
        let limit = self.config.limit.get();
        let fail_fast = self.config.admission == Admission::FailFast;
        let collect = self.config.errors == ErrorMode::Collect;

        let mut source = pin!(source);
        let mut in_flight = InFlight::new(collect);
        let mut index = 0usize;

        tracing::trace!(limit, phase = Phase::Admitting.as_str(), "Run started");

        let stop = loop {
            if self.cancel.is_cancelled() {
                break Stop::Cancelled;
            }

            let Some(item) = source.next().await else {
                break Stop::Exhausted;
            };

            if fail_fast && in_flight.failure_signalled() {
                tracing::debug!(index, "Failure signalled, item not started");
                break Stop::Failed;
            }

            in_flight.start(index, transform(item));
            index += 1;

            // Admission checkpoint.
            in_flight.reap()?;
            in_flight.observe_peak();
            if in_flight.has_failures() {
                break Stop::Failed;
            }

            if in_flight.len() >= limit {
                tracing::trace!(
                    in_flight = in_flight.len(),
                    phase = Phase::Throttled.as_str(),
                    "Waiting for a slot"
                );
                in_flight.settle_next().await?;
                if in_flight.has_failures() {
                    break Stop::Failed;
                }
                tracing::trace!(phase = Phase::Admitting.as_str(), "Slot freed");
            }
        };

        match stop {
            Stop::Exhausted => {
                tracing::trace!(
                    in_flight = in_flight.len(),
                    phase = Phase::Draining.as_str(),
                    "Source exhausted"
                );
                in_flight.drain(collect).await?;
            }
            Stop::Cancelled => {
                tracing::debug!(
                    started = index,
                    in_flight = in_flight.len(),
                    "Run cancelled, joining started operations"
                );
                in_flight.drain(collect).await?;
            }
            Stop::Failed => {}
        }

        if stop == Stop::Failed || in_flight.has_failures() {
            self.cancel.cancel();
            if collect {
                in_flight.drain(true).await?;
            } else {
                in_flight.await_failure().await?;
            }
            in_flight.detach();

            let stats = in_flight.stats();
            tracing::debug!(
                started = stats.started,
                settled = stats.settled(),
                failed = stats.failed,
                phase = Phase::Failed.as_str(),
                "Run failed"
            );
            return in_flight.finish();
        }

        if stop == Stop::Cancelled {
            return Err(ExecError::Cancelled);
        }

        let stats = in_flight.finish()?;
        tracing::debug!(
            started = stats.started,
            settled = stats.settled(),
            peak_in_flight = stats.peak_in_flight,
            phase = Phase::Done.as_str(),
            "Run complete"
        );
        Ok(stats)
    }
}

/// Run `transform` over `source` with default error handling and the given limit.
pub async fn run<S, F, Fut, R, E>(
    source: S,
    limit: NonZeroUsize,
    transform: F,
) -> Result<RunStats, ExecError<E>>
where
    S: Stream,
    F: FnMut(S::Item) -> Fut,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    let config = ExecutorConfig {
        limit,
        ..ExecutorConfig::default()
    };
    Executor::new(config).run(source, transform).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::time::{Instant, sleep};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn executor(limit: usize) -> Executor {
        Executor::with_limit(limit).unwrap()
    }

    /// Tracks how many operations are inside their body at once.
    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        max: AtomicUsize,
    }

    impl Gauge {
        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }

        fn max(&self) -> usize {
            self.max.load(Ordering::SeqCst)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Produced(u32),
        Invoked(u32),
        Settled(u32),
    }

    #[tokio::test]
    async fn empty_source_resolves_without_invoking() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let stats = executor(3)
            .run_iter(Vec::<u32>::new(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(()) }
            })
            .await
            .unwrap();

        assert_eq!(stats, RunStats::default());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invokes_each_item_once_in_source_order() {
        for limit in [1, 2, 3, 7, 64] {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let log = Arc::clone(&seen);

            let stats = executor(limit)
                .run_iter(0..20u64, move |i| {
                    log.lock().unwrap().push(i);
                    async move {
                        sleep(ms((i * 7) % 5 + 1)).await;
                        Ok::<_, String>(i)
                    }
                })
                .await
                .unwrap();

            assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
            assert_eq!(stats.started, 20);
            assert_eq!(stats.succeeded, 20);
            assert_eq!(stats.failed, 0);
            assert!(stats.peak_in_flight <= limit, "limit {limit}: {stats:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_never_exceeds_limit() {
        let gauge = Arc::new(Gauge::default());
        let shared = Arc::clone(&gauge);

        let stats = executor(3)
            .run_iter(0..25u64, move |i| {
                let gauge = Arc::clone(&shared);
                async move {
                    gauge.enter();
                    sleep(ms(10 + (i % 4) * 5)).await;
                    gauge.exit();
                    Ok::<_, String>(())
                }
            })
            .await
            .unwrap();

        assert_eq!(gauge.max(), 3);
        assert_eq!(stats.peak_in_flight, 3);
        assert_eq!(stats.succeeded, 25);
    }

    #[tokio::test(start_paused = true)]
    async fn staggered_delays_are_bounded_by_the_limit() {
        let start = Instant::now();

        let stats = executor(2)
            .run_iter([1u64, 2, 3, 4, 5], |x| async move {
                sleep(ms(x * 10)).await;
                Ok::<_, String>(())
            })
            .await
            .unwrap();

        let elapsed = start.elapsed();
        assert_eq!(stats.succeeded, 5);
        // 1 and 2 start together; 3 replaces 1 at 10ms, 4 replaces 2 at 20ms,
        // 5 replaces 3 at 40ms and finishes at 90ms.
        assert!(elapsed >= ms(90), "finished too early: {elapsed:?}");
        assert!(elapsed < ms(150), "ran serially: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn failure_surfaces_while_others_run_to_completion() {
        let completed = Arc::new(AtomicUsize::new(0));
        let done = Arc::clone(&completed);

        let err = executor(3)
            .run_iter([1u32, 2, 3], move |x| {
                let done = Arc::clone(&done);
                async move {
                    if x == 2 {
                        return Err(format!("item {x} rejected"));
                    }
                    sleep(ms(50)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap_err();

        assert!(
            matches!(&err, ExecError::Operation { index: 1, error } if error == "item 2 rejected"),
            "{err:?}"
        );
        assert_eq!(completed.load(Ordering::SeqCst), 0);

        sleep(ms(100)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_during_final_join_surfaces() {
        let err = executor(8)
            .run_iter(0..4u32, |i| async move {
                sleep(ms(10 * u64::from(i) + 5)).await;
                if i == 3 {
                    Err("late failure")
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err.indices(), vec![3]);
        assert_eq!(err.errors(), vec![&"late failure"]);
    }

    #[tokio::test(start_paused = true)]
    async fn limit_of_one_serializes() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&events);

        executor(1)
            .run_iter([0u32, 1, 2], move |i| {
                log.lock().unwrap().push(Event::Invoked(i));
                let log = Arc::clone(&log);
                async move {
                    sleep(ms(5)).await;
                    log.lock().unwrap().push(Event::Settled(i));
                    Ok::<_, String>(())
                }
            })
            .await
            .unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                Event::Invoked(0),
                Event::Settled(0),
                Event::Invoked(1),
                Event::Settled(1),
                Event::Invoked(2),
                Event::Settled(2),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn source_is_not_read_ahead() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let produced = Arc::clone(&events);
        let invoked = Arc::clone(&events);

        let source = futures::stream::iter(0..5u32).map(move |i| {
            produced.lock().unwrap().push(Event::Produced(i));
            i
        });

        executor(2)
            .run(source, move |i| {
                invoked.lock().unwrap().push(Event::Invoked(i));
                async move {
                    sleep(ms(3)).await;
                    Ok::<_, String>(())
                }
            })
            .await
            .unwrap();

        let events = events.lock().unwrap();
        let expected: Vec<Event> = (0..5u32)
            .flat_map(|i| [Event::Produced(i), Event::Invoked(i)])
            .collect();
        assert_eq!(*events, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn collect_mode_reports_every_failure() {
        let completed = Arc::new(AtomicUsize::new(0));
        let done = Arc::clone(&completed);
        let config = ExecutorConfig::with_limit(4)
            .unwrap()
            .errors(ErrorMode::Collect);

        let err = Executor::new(config)
            .run_iter(0..4u32, move |i| {
                let done = Arc::clone(&done);
                async move {
                    if i == 1 || i == 2 {
                        sleep(ms(10)).await;
                        return Err(format!("bad {i}"));
                    }
                    sleep(ms(20)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::Multiple(_)), "{err:?}");
        assert_eq!(err.indices(), vec![1, 2]);
        assert_eq!(
            err.errors(),
            vec![&"bad 1".to_string(), &"bad 2".to_string()]
        );
        assert_eq!(completed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn first_mode_returns_one_failure() {
        let completed = Arc::new(AtomicUsize::new(0));
        let done = Arc::clone(&completed);

        let err = executor(4)
            .run_iter(0..4u32, move |i| {
                let done = Arc::clone(&done);
                async move {
                    if i == 1 || i == 2 {
                        sleep(ms(10)).await;
                        return Err(format!("bad {i}"));
                    }
                    sleep(ms(20)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap_err();

        let index = err.indices();
        assert!(index == vec![1] || index == vec![2], "{err:?}");
        assert_eq!(completed.load(Ordering::SeqCst), 0);
    }

    /// Items 0 and 1 fail at once; item 2 takes 10ms to produce, so both
    /// failures have settled by the checkpoint after item 2 is started.
    fn two_early_failures() -> impl Stream<Item = u32> {
        futures::stream::iter(0..3u32).then(|i| async move {
            if i == 2 {
                sleep(ms(10)).await;
            }
            i
        })
    }

    #[tokio::test(start_paused = true)]
    async fn first_mode_reports_one_of_several_reaped_failures() {
        let err = executor(8)
            .run(two_early_failures(), |i| async move {
                if i < 2 {
                    return Err(format!("bad {i}"));
                }
                Ok(())
            })
            .await
            .unwrap_err();

        match &err {
            ExecError::Operation { index, error } => {
                assert!(*index < 2, "{err:?}");
                assert_eq!(error, &format!("bad {index}"));
            }
            other => panic!("expected a single failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn collect_mode_keeps_every_reaped_failure() {
        let config = ExecutorConfig::with_limit(8)
            .unwrap()
            .errors(ErrorMode::Collect);

        let err = Executor::new(config)
            .run(two_early_failures(), |i| async move {
                if i < 2 {
                    return Err(format!("bad {i}"));
                }
                Ok(())
            })
            .await
            .unwrap_err();

        assert_eq!(err.indices(), vec![0, 1]);
    }

    async fn invocations_before_failure(admission: Admission) -> (usize, Vec<usize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let config = ExecutorConfig::with_limit(10)
            .unwrap()
            .admission(admission);

        // Every item after the first takes 10ms to produce.
        let source = futures::stream::iter(0..10u32).then(|i| async move {
            if i > 0 {
                sleep(ms(10)).await;
            }
            i
        });

        let err = Executor::new(config)
            .run(source, move |i| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if i == 0 {
                        return Err("first item failed");
                    }
                    sleep(ms(100)).await;
                    Ok(())
                }
            })
            .await
            .unwrap_err();

        (calls.load(Ordering::SeqCst), err.indices())
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_admission_starts_work_after_failure() {
        let (calls, indices) = invocations_before_failure(Admission::Deferred).await;
        assert_eq!(indices, vec![0]);
        assert_eq!(calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fail_fast_admission_stops_before_next_item() {
        let (calls, indices) = invocations_before_failure(Admission::FailFast).await;
        assert_eq!(indices, vec![0]);
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_cancels_the_shared_token() {
        let observed_cancel = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&observed_cancel);
        let config = ExecutorConfig::with_limit(2)
            .unwrap()
            .errors(ErrorMode::Collect);
        let executor = Executor::new(config);
        let token = executor.cancel_token();
        let start = Instant::now();

        let err = executor
            .run_iter(0..2u32, move |i| {
                let token = token.clone();
                let observed = Arc::clone(&observed);
                async move {
                    if i == 0 {
                        sleep(ms(5)).await;
                        return Err("broken");
                    }
                    tokio::select! {
                        _ = token.cancelled() => {
                            observed.fetch_add(1, Ordering::SeqCst);
                        }
                        _ = sleep(Duration::from_secs(60)) => {}
                    }
                    Ok(())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err.indices(), vec![0]);
        assert_eq!(observed_cancel.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let executor = executor(2);
        executor.cancel_token().cancel();

        let err = executor
            .run_iter(0..5u32, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(()) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_run_joins_started_work() {
        let completed = Arc::new(AtomicUsize::new(0));
        let done = Arc::clone(&completed);
        let executor = executor(2);
        let token = executor.cancel_token();

        let err = executor
            .run_iter(0..10u32, move |i| {
                if i == 3 {
                    token.cancel();
                }
                let done = Arc::clone(&done);
                async move {
                    sleep(ms(5)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::Cancelled));
        assert_eq!(completed.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn panicking_transform_is_reported() {
        let err = executor(2)
            .run_iter([0u8, 1], |i| async move {
                if i == 1 {
                    panic!("render crashed");
                }
                Ok::<_, String>(())
            })
            .await
            .unwrap_err();

        assert!(err.is_panic(), "{err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn free_function_uses_default_error_mode() {
        let limit = NonZeroUsize::new(2).unwrap();
        let stats = run(futures::stream::iter(0..6u32), limit, |_| async {
            sleep(ms(1)).await;
            Ok::<_, String>(())
        })
        .await
        .unwrap();

        assert_eq!(stats.succeeded, 6);
        assert_eq!(stats.peak_in_flight, 2);
    }
}
