//! Composable asynchronous stream operators.
//!
//! Streams are lazy, single pass async sequences; the operators here carry
//! elements from a source through transformation stages to a sink with
//! backpressure at every step. [`buffer`] decouples a producer from its
//! consumer, [`transform`] runs an async function with bounded concurrency
//! while preserving input order ([`unordered_transform`] trades order for
//! throughput), [`batch_stream`]/[`unbatch_stream`] group and flatten, and
//! [`drain`] consumes a stream for its side effects.

use futures::stream::{Stream, StreamExt as _};
use std::num::NonZeroUsize;

pub mod buffer;
pub mod drain;
pub mod transform;

pub use buffer::{buffer, DEFAULT_BUFFER_SIZE};
pub use drain::{drain, DrainConfig};
pub use transform::{transform, unordered_transform, TransformConfig};

/// Default concurrency for io bound transforms.
pub fn default_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);
    (cpus + 4).min(32)
}

/// Converts a synchronous iterable into a stream.
///
/// Yields to the runtime after every element so that a slow producer cannot
/// starve other tasks on the same executor. Async sources need no adapter:
/// every [`Stream`] already satisfies the operator contracts.
pub fn iter_stream<I>(iterable: I) -> impl Stream<Item = I::Item>
where
    I: IntoIterator,
{
    futures::stream::unfold(iterable.into_iter(), |mut iter| async move {
        let item = iter.next()?;
        tokio::task::yield_now().await;
        Some((item, iter))
    })
}

/// Groups a stream into batches of `n`; the final batch may be shorter.
///
/// There are deliberately no timeout semantics here: batching only makes
/// sense on a steadily supplied stream, and interposing a [`buffer`] upstream
/// is the way to smooth out a bursty producer.
pub fn batch_stream<S>(stream: S, n: usize) -> impl Stream<Item = Vec<S::Item>>
where
    S: Stream,
{
    assert!(n > 0, "batches must hold at least one element");
    stream.chunks(n)
}

/// Flattens a stream of batches one level.
pub fn unbatch_stream<S, T>(stream: S) -> impl Stream<Item = T>
where
    S: Stream<Item = Vec<T>>,
{
    stream.flat_map(futures::stream::iter)
}
