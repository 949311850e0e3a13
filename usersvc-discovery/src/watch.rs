//! Long-poll watch loops
//!
//! A watch is a background task that repeatedly issues a blocking query with
//! the last index it has seen, and forwards a result only when the backend
//! reports a different index. Backend errors never end a watch: the task
//! sleeps for the retry backoff and polls again. Only cancellation (or the
//! consumer going away) ends it.
//!
//! ```text
//! Polling ──index unchanged──▶ Polling
//!    │ ──index changed──▶ Emit ──▶ Polling
//!    │ ──backend error──▶ Backoff ──▶ Polling
//!    └ ──cancel──▶ Terminated
//! ```

use crate::backend::{QueryMeta, QueryOptions, WatchIndex};
use crate::error::BackendError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Results buffered between the watch task and its consumer.
const CHANNEL_CAPACITY: usize = 16;

/// Timing of a watch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchTiming {
    /// Long-poll wait per iteration
    pub wait: Duration,
    /// Pause after a failed iteration
    pub retry_backoff: Duration,
}

/// Counters shared between a watch task and its handle.
#[derive(Debug, Default)]
struct WatchCounters {
    consecutive_failures: AtomicU64,
    total_failures: AtomicU64,
    emissions: AtomicU64,
}

impl WatchCounters {
    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    fn record_failure(&self) -> u64 {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record_emission(&self) {
        self.emissions.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of a watch's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchStats {
    /// Failed polls since the last successful one
    pub consecutive_failures: u64,
    /// Failed polls since the watch started
    pub total_failures: u64,
    /// Results delivered to the consumer
    pub emissions: u64,
}

/// Handle to a running watch.
///
/// Yields results through [`recv`](Self::recv) or as a [`Stream`]. The
/// sequence ends once the cancellation token passed at creation fires, after
/// [`cancel`](Self::cancel), or when the handle is dropped. Results still
/// buffered when the watch is cancelled are discarded.
pub struct Watch<T> {
    rx: mpsc::Receiver<T>,
    counters: Arc<WatchCounters>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl<T> Watch<T> {
    /// Next result, or `None` once the watch has been cancelled or has
    /// terminated.
    pub async fn recv(&mut self) -> Option<T> {
        if self.discard_if_cancelled() {
            return None;
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            value = self.rx.recv() => return value,
        }

        self.discard_if_cancelled();
        None
    }

    /// Close and empty the channel once cancelled.
    fn discard_if_cancelled(&mut self) -> bool {
        if !self.cancel.is_cancelled() {
            return false;
        }
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        true
    }

    /// Current failure and emission counters.
    pub fn stats(&self) -> WatchStats {
        WatchStats {
            consecutive_failures: self.counters.consecutive_failures.load(Ordering::Relaxed),
            total_failures: self.counters.total_failures.load(Ordering::Relaxed),
            emissions: self.counters.emissions.load(Ordering::Relaxed),
        }
    }

    /// Stop this watch without touching the caller's token.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the background task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl<T> Stream for Watch<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        if this.discard_if_cancelled() {
            return Poll::Ready(None);
        }
        this.rx.poll_recv(cx)
    }
}

impl<T> Drop for Watch<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawn a watch task.
///
/// `poll` issues one blocking query; it returns `None` for "nothing to
/// deliver" (an absent key) while still reporting the index. The task listens
/// on a child of `cancel`, so cancelling the caller's token stops it but
/// dropping the handle does not cancel the caller's token.
pub(crate) fn spawn<T, F, Fut>(
    name: String,
    timing: WatchTiming,
    cancel: &CancellationToken,
    poll: F,
) -> Watch<T>
where
    T: Send + 'static,
    F: FnMut(QueryOptions) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(Option<T>, QueryMeta), BackendError>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let counters = Arc::new(WatchCounters::default());
    let token = cancel.child_token();

    let task = tokio::spawn(run(
        name,
        timing,
        token.clone(),
        Arc::clone(&counters),
        tx,
        poll,
    ));

    Watch {
        rx,
        counters,
        cancel: token,
        task,
    }
}

async fn run<T, F, Fut>(
    name: String,
    timing: WatchTiming,
    cancel: CancellationToken,
    counters: Arc<WatchCounters>,
    tx: mpsc::Sender<T>,
    mut poll: F,
) where
    F: FnMut(QueryOptions) -> Fut,
    Fut: Future<Output = Result<(Option<T>, QueryMeta), BackendError>>,
{
    let mut last_index = WatchIndex::default();
    debug!("Watch {} started", name);

    while !cancel.is_cancelled() {
        let opts = QueryOptions::blocking(last_index, timing.wait);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = poll(opts) => result,
        };

        match result {
            Ok((value, meta)) => {
                counters.record_success();

                if !last_index.observe(meta.last_index) {
                    continue;
                }
                let Some(value) = value else {
                    continue;
                };

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = tx.send(value) => {
                        if sent.is_err() {
                            debug!("Watch {} receiver dropped", name);
                            break;
                        }
                    }
                }
                counters.record_emission();
                debug!("Watch {} emitted at index {}", name, last_index);
            }
            Err(e) => {
                let failures = counters.record_failure();
                warn!(
                    "Watch {} poll failed ({} consecutive): {}; retrying in {:?}",
                    name, failures, e, timing.retry_backoff
                );

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(timing.retry_backoff) => {}
                }
            }
        }
    }

    debug!("Watch {} terminated", name);
}
