//! Coalesces a stream of individual submissions into bounded batches.

use futures::future::FutureExt as _;
use futures::stream::{Stream, StreamExt as _};
use std::time::Duration;

/// Groups `items` into batches of up to `max_batch_size`.
///
/// Very similar to `StreamExt::ready_chunks`, with the difference that a
/// partial batch is held back for `timeout` counted from its first element,
/// so briefly idle producers still get their submissions coalesced. A full
/// batch is cut immediately, which with `max_batch_size == 1` effectively
/// disables batching.
pub fn batches<T>(
    items: impl Stream<Item = T> + Unpin,
    max_batch_size: usize,
    timeout: Duration,
) -> impl Stream<Item = Vec<T>> {
    futures::stream::unfold(items.fuse(), move |mut items| async move {
        let mut batch = vec![items.next().await?];

        let deadline = tokio::time::sleep(timeout).fuse();
        futures::pin_mut!(deadline);

        while batch.len() < max_batch_size {
            futures::select_biased! {
                item = items.next() => match item {
                    Some(item) => batch.push(item),
                    None => break,
                },
                _ = deadline => break,
            }
        }

        Some((batch, items))
    })
}
