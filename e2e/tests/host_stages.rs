//! Host side preprocess/postprocess hooks around the worker round trip.

use dispatch::{DispatchError, Dispatcher, DispatcherConfig, Stages, WorkerCommand};
use std::time::Duration;

struct GuardStages;

#[async_trait::async_trait]
impl Stages<i64, i64> for GuardStages {
    async fn preprocess(&self, payload: Vec<i64>) -> anyhow::Result<Vec<i64>> {
        anyhow::ensure!(!payload.contains(&5), "found 5");
        Ok(payload)
    }

    async fn postprocess(&self, outputs: Vec<i64>) -> anyhow::Result<Vec<i64>> {
        anyhow::ensure!(!outputs.contains(&100), "found 100");
        Ok(outputs)
    }
}

async fn guarded_dispatcher() -> Dispatcher<i64, i64> {
    Dispatcher::start_with_stages(
        WorkerCommand::new(env!("CARGO_BIN_EXE_square_worker")),
        DispatcherConfig::new(3).timeout(Duration::from_millis(20)),
        GuardStages,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn clean_payloads_pass_through_both_hooks() {
    e2e::init_tracing();
    let dispatcher = guarded_dispatcher().await;
    assert_eq!(dispatcher.submit_one(3).await.unwrap(), 9);
}

#[tokio::test]
async fn preprocess_failures_come_back_as_carriers() {
    let dispatcher = guarded_dispatcher().await;
    // The carrier takes the batch's place in the pipeline, rides through the
    // worker unchanged and rejects the whole submission.
    match dispatcher.submit_one(5).await {
        Err(DispatchError::Remote(err)) => assert!(err.message.contains("found 5")),
        other => panic!("expected a remote error, got {other:?}"),
    }
    // Later batches are unaffected.
    assert_eq!(dispatcher.submit_one(6).await.unwrap(), 36);
}

#[tokio::test]
async fn postprocess_failures_surface_directly() {
    let dispatcher = guarded_dispatcher().await;
    match dispatcher.submit_bulk(vec![10, 11]).await {
        Err(DispatchError::Host(err)) => assert!(format!("{err:#}").contains("found 100")),
        other => panic!("expected a host error, got {other:?}"),
    }
    assert_eq!(dispatcher.submit_one(4).await.unwrap(), 16);
}
