//! Stream consumption for side effects.

use crate::transform::{transform, unordered_transform, TransformConfig};
use futures::stream::{Stream, StreamExt as _};
use std::future::Future;

/// Tuning knobs for [`drain`].
#[derive(Clone, Debug)]
pub struct DrainConfig {
    /// Max concurrent invocations of the sink function.
    pub workers: usize,
    /// Log progress every this many completed elements; 0 disables.
    pub log_every: usize,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            workers: crate::default_workers(),
            log_every: 1000,
        }
    }
}

impl DrainConfig {
    pub fn workers(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }
}

/// Consumes `stream` by applying the side effecting `f` to every element and
/// returns the number of elements processed.
///
/// Meant for sinks like database writers. With more than one worker,
/// elements complete out of order; the shuffling is local because the
/// transform's output queue is bounded.
pub async fn drain<S, F, Fut>(stream: S, f: F, config: DrainConfig) -> usize
where
    S: Stream + Send + 'static,
    S::Item: Send + 'static,
    F: Fn(S::Item) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut completions = if config.workers < 2 {
        transform(stream, f, TransformConfig::workers(config.workers))
    } else {
        unordered_transform(stream, f, TransformConfig::workers(config.workers))
    };

    let mut count = 0;
    while completions.next().await.is_some() {
        count += 1;
        if config.log_every != 0 && count % config.log_every == 0 {
            tracing::info!(count, "drained");
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iter_stream;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn counts_every_element() {
        let count = drain(
            iter_stream(0..278),
            |_| async {},
            DrainConfig::workers(4),
        )
        .await;
        assert_eq!(count, 278);
    }

    #[tokio::test]
    async fn applies_the_sink_to_every_element() {
        let sum = Arc::new(AtomicI64::new(0));
        let sink_sum = sum.clone();
        let count = drain(
            iter_stream(1..=100i64),
            move |x| {
                let sum = sink_sum.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    sum.fetch_add(x * 3, Ordering::Relaxed);
                }
            },
            DrainConfig::workers(8),
        )
        .await;
        assert_eq!(count, 100);
        assert_eq!(sum.load(Ordering::Relaxed), (1..=100).sum::<i64>() * 3);
    }

    #[tokio::test]
    async fn a_single_worker_drains_in_order() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let count = drain(
            iter_stream(0..20),
            move |x| {
                let seen = sink_seen.clone();
                async move {
                    seen.lock().unwrap().push(x);
                }
            },
            DrainConfig::workers(1),
        )
        .await;
        assert_eq!(count, 20);
        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }
}
