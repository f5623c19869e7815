//! The lazy, single-consumer stream abstraction shared by every edge of the DAG,
//! plus the two operators that turn it into a graph: `tee` (fan-out) and `merge`
//! (fan-in).
//!
//! ```text
//!            +-----------+
//!            |  upstream |
//!            +-----+-----+
//!                  |
//!            tee(n) coordinator  -- pulls upstream only once every consumer
//!            /      |      \        has asked for the next item
//!           v       v       v
//!       consumer  consumer  consumer
//!
//!       input_a  \
//!       input_b   >---- merge ---->  single interleaved output
//!       input_c  /
//! ```
//!
//! A plain [`Stream`] is nothing more than a boxed `futures::Stream` of
//! `Result<Event>`; a single `Err` ends the stream (the producer never yields
//! after a failure). `tee` and `merge` are the only two combinators that know how
//! to multiplex and demultiplex these streams, and both are implemented as
//! background tasks that communicate with their consumers over channels rather
//! than by hand-rolling a `poll_next` state machine.

use std::sync::Arc;

use async_stream::stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{OctopusError, Result};
use crate::event::Event;

/// A boxed, `Send`, single-consumer stream of events.
///
/// Every source, filter, and sink in the graph is wired together through values
/// of this type. It carries `Result<Event>` rather than bare `Event` so a plugin
/// failure can travel downstream exactly like an event would, terminating the
/// stream at the first `Err`.
pub type Stream = BoxStream<'static, Result<Event>>;

/// Fan out `upstream` into `n` independent streams.
///
/// Each of the `n` returned streams observes every event upstream produces,
/// exactly once, in order. Upstream is pulled only once all `n` consumers have
/// asked for their next item (a slow consumer paces the whole group, the way a
/// single-speed conveyor belt does). When upstream ends or fails, every derived
/// stream observes the same outcome; a failure is replicated via
/// [`OctopusError::Shared`] since the underlying error isn't itself cloneable.
///
/// `n == 1` is the transparent case: `upstream` is handed back unchanged, with
/// no coordinator task or extra buffering.
///
/// When every derived stream is dropped before upstream is exhausted, the
/// coordinator's request channel closes, the coordinator task exits, and
/// `upstream` is dropped with it (whatever resources it held, a socket, a file
/// handle, a subprocess, are released).
///
/// # Examples
///
/// ```rust
/// use futures::stream::{self, StreamExt};
/// use octopus_core::event::Event;
/// use octopus_core::stream::tee;
/// use chrono::Utc;
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() {
/// let events = vec![Ok(Event::new(Utc::now(), "a", json!(1)))];
/// let upstream = stream::iter(events).boxed();
/// let mut branches = tee(upstream, 2);
/// assert_eq!(branches.len(), 2);
/// let second = branches.pop().unwrap();
/// let first = branches.pop().unwrap();
/// let (a, b) = tokio::join!(first.collect::<Vec<_>>(), second.collect::<Vec<_>>());
/// assert_eq!(a.len(), 1);
/// assert_eq!(b.len(), 1);
/// # }
/// ```
pub fn tee(upstream: Stream, n: usize) -> Vec<Stream> {
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![upstream];
    }

    let (request_tx, request_rx) = mpsc::channel::<TeeRequest>(n);
    tokio::spawn(tee_coordinator(upstream, request_rx, n));

    (0..n)
        .map(|index| tee_consumer(index, request_tx.clone()))
        .collect()
}

struct TeeRequest {
    index: usize,
    reply: oneshot::Sender<TeeSignal>,
}

#[derive(Clone)]
enum TeeSignal {
    Event(Event),
    End,
    Err(Arc<OctopusError>),
}

async fn tee_coordinator(mut upstream: Stream, mut requests: mpsc::Receiver<TeeRequest>, n: usize) {
    loop {
        let mut replies: Vec<Option<oneshot::Sender<TeeSignal>>> = (0..n).map(|_| None).collect();
        let mut pending = n;
        while pending > 0 {
            match requests.recv().await {
                Some(request) => {
                    if replies[request.index].is_none() {
                        replies[request.index] = Some(request.reply);
                        pending -= 1;
                    }
                }
                None => return,
            }
        }

        let signal = match upstream.next().await {
            Some(Ok(event)) => TeeSignal::Event(event),
            Some(Err(err)) => TeeSignal::Err(Arc::new(err)),
            None => TeeSignal::End,
        };
        let is_terminal = matches!(signal, TeeSignal::End | TeeSignal::Err(_));

        for reply in replies.into_iter().flatten() {
            let _ = reply.send(signal.clone());
        }

        if is_terminal {
            return;
        }
    }
}

fn tee_consumer(index: usize, request_tx: mpsc::Sender<TeeRequest>) -> Stream {
    Box::pin(stream! {
        loop {
            let (reply_tx, reply_rx) = oneshot::channel();
            if request_tx.send(TeeRequest { index, reply: reply_tx }).await.is_err() {
                return;
            }
            match reply_rx.await {
                Ok(TeeSignal::Event(event)) => yield Ok(event),
                Ok(TeeSignal::End) | Err(_) => return,
                Ok(TeeSignal::Err(err)) => {
                    yield Err(OctopusError::Shared(err));
                    return;
                }
            }
        }
    })
}

/// Fan in `streams` into a single interleaved stream.
///
/// Each input is pulled independently and concurrently; order is preserved
/// within a single input but not across inputs. The merged stream ends once
/// every input has ended. The first failure observed on any input is yielded
/// downstream and every other input is cancelled (their pull tasks are
/// aborted, dropping whatever stream state and resources they held).
///
/// # Examples
///
/// ```rust
/// use futures::stream::{self, StreamExt};
/// use octopus_core::event::Event;
/// use octopus_core::stream::merge;
/// use chrono::Utc;
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() {
/// let a = stream::iter(vec![Ok(Event::new(Utc::now(), "a", json!(1)))]).boxed();
/// let b = stream::iter(vec![Ok(Event::new(Utc::now(), "b", json!(2)))]).boxed();
/// let merged: Vec<_> = merge(vec![a, b]).collect().await;
/// assert_eq!(merged.len(), 2);
/// # }
/// ```
pub fn merge(streams: Vec<Stream>) -> Stream {
    let n = streams.len();
    if n == 0 {
        return Box::pin(futures::stream::empty());
    }

    let (tx, mut rx) = mpsc::channel::<MergeMsg>(n);
    let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(n);
    for mut input in streams {
        let tx = tx.clone();
        handles.push(tokio::spawn(async move {
            loop {
                match input.next().await {
                    Some(Ok(event)) => {
                        if tx.send(MergeMsg::Event(event)).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        let _ = tx.send(MergeMsg::Err(err)).await;
                        return;
                    }
                    None => {
                        let _ = tx.send(MergeMsg::End).await;
                        return;
                    }
                }
            }
        }));
    }
    drop(tx);

    Box::pin(stream! {
        let mut remaining = n;
        let mut handles = handles;
        while let Some(msg) = rx.recv().await {
            match msg {
                MergeMsg::Event(event) => yield Ok(event),
                MergeMsg::End => {
                    remaining -= 1;
                    if remaining == 0 {
                        break;
                    }
                }
                MergeMsg::Err(err) => {
                    for handle in handles.drain(..) {
                        handle.abort();
                    }
                    yield Err(err);
                    return;
                }
            }
        }
        for handle in handles.drain(..) {
            handle.abort();
        }
    })
}

enum MergeMsg {
    Event(Event),
    End,
    Err(OctopusError),
}
