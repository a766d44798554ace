//! The streaming operators and the batched dispatcher composed: a stream of
//! items is transformed by submitting every element to a dispatcher, which
//! batches them up for the worker process behind the scenes.

use dispatch::{Dispatcher, DispatcherConfig, WorkerCommand};
use futures::stream::StreamExt as _;
use pipeline::{batch_stream, buffer, iter_stream, transform, TransformConfig};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn streamed_submissions_keep_their_order() {
    e2e::init_tracing();
    let dispatcher = Arc::new(
        Dispatcher::<i64, i64>::start(
            WorkerCommand::new(env!("CARGO_BIN_EXE_square_worker")),
            DispatcherConfig::new(8).timeout(Duration::from_millis(20)),
        )
        .await
        .unwrap(),
    );

    let submit = {
        let dispatcher = dispatcher.clone();
        move |x: i64| {
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher
                    .submit_one(x)
                    .await
                    .expect("dispatcher failed mid stream")
            }
        }
    };
    let source = buffer(iter_stream(0..64), 16);
    let collected: Vec<_> = transform(source, submit, TransformConfig::workers(8))
        .collect()
        .await;

    assert_eq!(collected, (0..64).map(|x| x * x).collect::<Vec<_>>());
}

#[tokio::test]
async fn streamed_bulks_resolve_group_by_group() {
    let dispatcher = Arc::new(
        Dispatcher::<i64, i64>::start(
            WorkerCommand::new(env!("CARGO_BIN_EXE_square_worker")),
            DispatcherConfig::new(100).timeout(Duration::from_millis(20)),
        )
        .await
        .unwrap(),
    );

    let submit_bulk = {
        let dispatcher = dispatcher.clone();
        move |group: Vec<i64>| {
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher
                    .submit_bulk(group)
                    .await
                    .expect("dispatcher failed mid stream")
            }
        }
    };
    let groups = batch_stream(iter_stream(0..30), 7);
    let collected: Vec<_> = transform(groups, submit_bulk, TransformConfig::workers(4))
        .collect()
        .await;

    let flat: Vec<_> = collected.into_iter().flatten().collect();
    assert_eq!(flat, (0..30).map(|x| x * x).collect::<Vec<_>>());
}
