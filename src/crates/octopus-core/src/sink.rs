//! The two policies a sink section can layer on top of a plain
//! [`SinkCallable`](crate::plugin::SinkCallable): a throttle gate that skips
//! runs that come too soon after the last one, and a batch accumulator that
//! buffers events and flushes them to the plugin on a timer instead of one at
//! a time.

use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{error, warn};

use crate::error::{OctopusError, Result};
use crate::event::Event;
use crate::plugin::SinkCallable;
use crate::stream::Stream;

/// Tracks the last time a throttled sink actually ran.
///
/// Shared across runs of the same sink node (the scheduler holds one of
/// these per sink), since the gate needs to remember the previous run to
/// decide whether the next one is too soon.
#[derive(Default)]
pub struct ThrottleGate {
    last_run: RwLock<Option<Instant>>,
    throttle: Option<Duration>,
}

impl ThrottleGate {
    /// Build a gate. `throttle: None` means the sink is never throttled.
    pub fn new(throttle: Option<Duration>) -> Self {
        Self {
            last_run: RwLock::new(None),
            throttle,
        }
    }

    /// Run `body` unless it's too soon after the last run that actually
    /// produced output.
    ///
    /// "Too soon" is strict: a run is skipped only when
    /// `now - last_run < throttle`; equality lets it through. A run that
    /// consumes zero events never updates `last_run`, so an empty upstream
    /// doesn't poison future throttle decisions.
    pub async fn guarded<F, Fut>(&self, body: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<usize>>,
    {
        if let Some(throttle) = self.throttle {
            let last_run = *self.last_run.read().await;
            if let Some(last_run) = last_run {
                if Instant::now().saturating_duration_since(last_run) < throttle {
                    return Ok(());
                }
            }
        }

        let consumed = body().await?;
        if consumed > 0 {
            *self.last_run.write().await = Some(Instant::now());
        }
        Ok(())
    }
}

/// Drains `upstream`, counting events, and forwards each to `sink`.
///
/// This is the "body" a [`ThrottleGate::guarded`] call wraps: it reports how
/// many events it actually saw so the gate can decide whether to update
/// `last_run`.
pub async fn count_events(
    mut upstream: Stream,
    mut forward: impl FnMut(Event),
) -> Result<usize> {
    use futures::StreamExt;
    let mut count = 0;
    while let Some(event) = upstream.next().await {
        forward(event?);
        count += 1;
    }
    Ok(count)
}

/// An unbounded queue that buffers events for a sink and flushes them to the
/// plugin in batches, either because nothing else drained the queue within
/// `timeout` of the oldest buffered event, or because the pipeline is
/// shutting down.
///
/// The worker task never exits on a plugin failure (it logs the failure and
/// keeps running), since one bad batch shouldn't take the whole sink offline.
pub struct BatchAccumulator {
    sender: mpsc::UnboundedSender<Event>,
}

impl BatchAccumulator {
    /// Spawn the background worker and return a handle that feeds it.
    ///
    /// `sink` is invoked once per flush with whatever events accumulated
    /// (constructed as a fresh in-memory [`Stream`] over exactly that
    /// batch); a plugin failure for one flush is logged and does not stop
    /// the next.
    pub fn spawn(plugin: std::sync::Arc<dyn SinkCallable>, params: serde_json::Value, timeout: Duration) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Event>();

        tokio::spawn(async move {
            let mut buffer: Vec<Event> = Vec::new();
            let mut batch_start: Option<Instant> = None;
            loop {
                let deadline = batch_start.map(|start| start + timeout);
                let next = match deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, receiver.recv()).await,
                    None => Ok(receiver.recv().await),
                };

                match next {
                    Ok(Some(event)) => {
                        if batch_start.is_none() {
                            batch_start = Some(Instant::now());
                        }
                        buffer.push(event);
                    }
                    Ok(None) => {
                        flush(&plugin, &params, std::mem::take(&mut buffer)).await;
                        return;
                    }
                    Err(_elapsed) => {
                        flush(&plugin, &params, std::mem::take(&mut buffer)).await;
                        batch_start = None;
                    }
                }
            }
        });

        Self { sender }
    }

    /// Queue `event` for the next batch flush.
    pub fn push(&self, event: Event) -> Result<()> {
        self.sender
            .send(event)
            .map_err(|_| OctopusError::invalid_configuration("batch worker has already stopped"))
    }
}

async fn flush(plugin: &std::sync::Arc<dyn SinkCallable>, params: &serde_json::Value, batch: Vec<Event>) {
    if batch.is_empty() {
        return;
    }
    let count = batch.len();
    let stream: Stream = Box::pin(futures::stream::iter(batch.into_iter().map(Ok)));
    if let Err(err) = plugin.run(stream, params).await {
        error!(error = %err, count, "batch flush failed, buffered events dropped");
    } else {
        warn!(count, "flushed batch"); // kept at warn: batch flushes are infrequent enough to want visibility by default
    }
}
