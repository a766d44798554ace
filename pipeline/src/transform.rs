//! Concurrent stream transformation with optional order preservation.

use futures::stream::{BoxStream, Stream, StreamExt as _};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_stream::wrappers::ReceiverStream;

/// Tuning knobs for [`transform`] and [`unordered_transform`].
#[derive(Clone, Debug)]
pub struct TransformConfig {
    /// Max concurrent invocations of the transform function. Values below 2
    /// run a plain sequential mapping.
    pub workers: usize,
    /// Capacity of the output queue where results (or reserved result slots)
    /// wait for the consumer. Defaults to `workers * 8`.
    pub out_buffer_size: Option<usize>,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            workers: crate::default_workers(),
            out_buffer_size: None,
        }
    }
}

impl TransformConfig {
    pub fn workers(workers: usize) -> Self {
        Self {
            workers,
            out_buffer_size: None,
        }
    }

    fn out_buffer(&self) -> usize {
        self.out_buffer_size.unwrap_or(self.workers * 8).max(1)
    }
}

/// Maps the async `f` over `stream` with up to `config.workers` concurrent
/// invocations while preserving input order in the output.
///
/// Every worker, holding the shared source lock, pulls one element and
/// reserves its output slot; the call to `f` itself runs outside the lock.
/// Reserving under the lock is what makes slot order equal input order, so
/// the consumer sees results in order no matter how invocation latencies
/// interleave.
///
/// Dropping the returned stream cancels the workers at their next slot
/// reservation; invocations already in flight run to completion and their
/// results are discarded.
pub fn transform<S, F, Fut>(stream: S, f: F, config: TransformConfig) -> BoxStream<'static, Fut::Output>
where
    S: Stream + Send + 'static,
    S::Item: Send + 'static,
    F: Fn(S::Item) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    if config.workers <= 1 {
        // Sequential mapping preserves order by construction.
        return stream.then(f).boxed();
    }

    let (slots_tx, slots_rx) = mpsc::channel::<oneshot::Receiver<Fut::Output>>(config.out_buffer());
    let source = Arc::new(Mutex::new(stream.boxed()));
    let f = Arc::new(f);

    for _ in 0..config.workers {
        let source = source.clone();
        let slots = slots_tx.clone();
        let f = f.clone();
        tokio::spawn(async move {
            loop {
                let (item, slot) = {
                    let mut source = source.lock().await;
                    let item = match source.next().await {
                        Some(item) => item,
                        None => return,
                    };
                    let (slot, reserved) = oneshot::channel();
                    if slots.send(reserved).await.is_err() {
                        // Consumer dropped the output stream.
                        return;
                    }
                    (item, slot)
                };
                // Nobody listening on the slot means the consumer cancelled.
                let _ = slot.send(f(item).await);
            }
        });
    }
    drop(slots_tx);

    ReceiverStream::new(slots_rx)
        .then(|reserved| async move {
            reserved
                .await
                .expect("transform worker dropped its result slot")
        })
        .boxed()
}

/// Like [`transform`] but yields results as they complete instead of in
/// input order. Strictly better throughput when order does not matter: a
/// slow element no longer holds back the finished ones behind it.
pub fn unordered_transform<S, F, Fut>(
    stream: S,
    f: F,
    config: TransformConfig,
) -> BoxStream<'static, Fut::Output>
where
    S: Stream + Send + 'static,
    S::Item: Send + 'static,
    F: Fn(S::Item) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    if config.workers <= 1 {
        return stream.then(f).boxed();
    }

    let (results_tx, results_rx) = mpsc::channel(config.out_buffer());
    let source = Arc::new(Mutex::new(stream.boxed()));
    let f = Arc::new(f);

    for _ in 0..config.workers {
        let source = source.clone();
        let results = results_tx.clone();
        let f = f.clone();
        tokio::spawn(async move {
            loop {
                let item = {
                    let mut source = source.lock().await;
                    match source.next().await {
                        Some(item) => item,
                        None => return,
                    }
                };
                if results.send(f(item).await).await.is_err() {
                    return;
                }
            }
        });
    }
    // The queue closes once the last worker is done with the last element.
    drop(results_tx);

    ReceiverStream::new(results_rx).boxed()
}
