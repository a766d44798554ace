//! Decouples a producer from its consumer with a bounded in memory queue.

use futures::stream::{Stream, StreamExt as _};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Spawns a task that eagerly drains `stream` into a bounded queue and
/// returns the consuming side.
///
/// The producer keeps running while the consumer is busy, up to `capacity`
/// elements ahead; a full queue suspends it. Dropping the returned stream
/// stops the task at its next send. A producer that panics would otherwise
/// just close the queue and truncate the stream silently, so the panic is
/// resurfaced to the consumer instead.
pub fn buffer<S>(stream: S, capacity: usize) -> impl Stream<Item = S::Item>
where
    S: Stream + Send + 'static,
    S::Item: Send + 'static,
{
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let pump = tokio::spawn(async move {
        futures::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            if sender.send(item).await.is_err() {
                tracing::debug!("buffer consumer went away");
                return;
            }
        }
        // Dropping the sender closes the queue, which ends the stream.
    });

    let tail = futures::stream::once(async move {
        if let Err(err) = pump.await {
            if err.is_panic() {
                std::panic::resume_unwind(err.into_panic());
            }
        }
        let end: Option<S::Item> = None;
        end
    })
    .filter_map(|end| async move { end });

    ReceiverStream::new(receiver).chain(tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iter_stream;
    use std::time::Duration;

    #[tokio::test]
    async fn passes_every_element_through_in_order() {
        let collected: Vec<_> = buffer(iter_stream(0..100), 8).collect().await;
        assert_eq!(collected, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn producer_runs_ahead_of_a_slow_consumer() {
        let stream = buffer(iter_stream(0..10), 4);
        futures::pin_mut!(stream);
        let mut collected = Vec::new();
        while let Some(item) = stream.next().await {
            tokio::time::sleep(Duration::from_millis(1)).await;
            collected.push(item);
        }
        assert_eq!(collected, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn dropping_the_consumer_stops_the_producer() {
        let (probe, mut probe_rx) = mpsc::unbounded_channel();
        let producer = iter_stream(0..u64::MAX).map(move |item| {
            let _ = probe.send(item);
            item
        });
        let mut stream = Box::pin(buffer(producer, 4));
        assert_eq!(stream.next().await, Some(0));
        drop(stream);

        // The pump task observes the closed queue at its next send; after
        // that no further elements are pulled from the producer.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut pulled = 0;
        while probe_rx.try_recv().is_ok() {
            pulled += 1;
        }
        assert!(pulled <= 8, "producer kept running: pulled {pulled}");
    }

    #[tokio::test]
    #[should_panic(expected = "upstream exploded")]
    async fn producer_panics_reach_the_consumer() {
        let exploding = iter_stream(0..10).map(|item| {
            if item == 3 {
                panic!("upstream exploded");
            }
            item
        });
        let _: Vec<_> = buffer(exploding, 2).collect().await;
    }
}
