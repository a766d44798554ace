//! Host side of the batched dispatcher.
//!
//! Callers submit individual items or whole bulks; a coalescer gathers the
//! individual items into bounded batches; the preprocess stage ships every
//! batch to the single worker process and the postprocess stage scatters the
//! results back to the submitting callers. A FIFO queue of completion sets
//! links the two stages: the n-th completion set enqueued belongs to the n-th
//! batch shipped, which is the n-th result received.

use crate::batching;
use crate::error::{DispatchError, RemoteError};
use crate::process::{self, WorkerCommand};
use crate::wire::{self, FromWorker, ToWorker};
use anyhow::{bail, ensure, Context as _, Result};
use async_trait::async_trait;
use futures::stream::StreamExt as _;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

/// Dispatcher tuning knobs.
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Max number of individual submissions gathered into one batch.
    /// Must be in `1..=10_000`; 1 effectively disables batching.
    pub max_batch_size: usize,
    /// Wait time before a partial batch is flushed to the worker, counted
    /// from its first item. Must be in `(0, 1]` seconds.
    pub timeout: Duration,
    /// Max number of batches in flight between the host stages and the
    /// worker. Must be in `1..=128`; defaults to 100 for batch sizes up to 10
    /// and to 32 otherwise.
    pub max_queue_size: Option<usize>,
}

impl DispatcherConfig {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size,
            timeout: Duration::from_millis(100),
            max_queue_size: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = Some(max_queue_size);
        self
    }

    fn validate(&self) -> Result<(usize, Duration, usize)> {
        ensure!(
            (1..=10_000).contains(&self.max_batch_size),
            "max_batch_size must be in 1..=10000, got {}",
            self.max_batch_size
        );
        ensure!(
            !self.timeout.is_zero() && self.timeout <= Duration::from_secs(1),
            "timeout must be in (0, 1] seconds, got {:?}",
            self.timeout
        );
        let max_queue_size = self
            .max_queue_size
            .unwrap_or(if self.max_batch_size <= 10 { 100 } else { 32 });
        ensure!(
            (1..=128).contains(&max_queue_size),
            "max_queue_size must be in 1..=128, got {max_queue_size}"
        );
        Ok((self.max_batch_size, self.timeout, max_queue_size))
    }
}

/// Host side hooks applied around the worker round trip, on the dispatcher's
/// runtime rather than in the worker process. Both default to identity.
#[async_trait]
pub trait Stages<I, O>: Send + Sync + 'static
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Runs on every payload right before it is shipped to the worker. A
    /// failure here turns into an error carrier that takes the payload's
    /// place in the pipeline, so results stay in order.
    async fn preprocess(&self, payload: Vec<I>) -> Result<Vec<I>> {
        Ok(payload)
    }

    /// Runs on every result right after it arrives from the worker. A
    /// failure here is surfaced directly to the affected callers.
    async fn postprocess(&self, outputs: Vec<O>) -> Result<Vec<O>> {
        Ok(outputs)
    }
}

/// The do-nothing default hooks.
pub struct IdentityStages;

#[async_trait]
impl<I, O> Stages<I, O> for IdentityStages
where
    I: Send + 'static,
    O: Send + 'static,
{
}

type ItemResult<O> = Result<O, DispatchError>;
type BulkResult<O> = Result<Vec<O>, DispatchError>;
type BatchResult<O> = Result<Vec<O>, DispatchError>;

/// One entry of the batches queue.
enum Submission<I, O> {
    /// A coalesced batch with one promise per item.
    Batch(Vec<I>, Vec<oneshot::Sender<ItemResult<O>>>),
    /// A caller supplied bulk with a single promise for the whole result.
    Bulk(Vec<I>, oneshot::Sender<BulkResult<O>>),
}

/// The promises of one in flight batch.
enum Completion<O> {
    Batch(Vec<oneshot::Sender<ItemResult<O>>>),
    Bulk(oneshot::Sender<BulkResult<O>>),
}

struct Inflight<O> {
    completion: Completion<O>,
    /// Held from shipping until the result is routed; bounds the number of
    /// batches in flight to the configured queue size.
    _permit: OwnedSemaphorePermit,
}

/// Batches individual inference requests and serves them through a worker
/// process.
///
/// Dropping the dispatcher stops it; outstanding submissions resolve to
/// [`DispatchError::Stopped`].
pub struct Dispatcher<I, O> {
    singles: mpsc::Sender<(I, oneshot::Sender<ItemResult<O>>)>,
    submissions: mpsc::Sender<Submission<I, O>>,
    child: Mutex<Child>,
    tasks: Vec<JoinHandle<()>>,
    stopped: AtomicBool,
}

impl<I, O> Dispatcher<I, O>
where
    I: Serialize + Send + Sync + 'static,
    O: DeserializeOwned + Send + 'static,
{
    /// Starts the worker process and the host stages with identity hooks.
    pub async fn start(worker: WorkerCommand, config: DispatcherConfig) -> Result<Self> {
        Self::start_with_stages(worker, config, IdentityStages).await
    }

    /// Starts the worker process, waits for it to report ready, then starts
    /// the host stages.
    pub async fn start_with_stages(
        worker: WorkerCommand,
        config: DispatcherConfig,
        stages: impl Stages<I, O>,
    ) -> Result<Self> {
        let (max_batch_size, timeout, max_queue_size) = config.validate()?;
        let mut process = process::spawn(&worker)?;

        wire::send_frame(
            &mut process.stdin,
            &ToWorker::<I>::Init {
                load: worker.load.clone(),
            },
        )
        .await
        .context("failed to send the init handshake")?;
        match wire::recv_frame::<FromWorker<O>, _>(&mut process.stdout)
            .await
            .context("failed to read the worker handshake")?
        {
            Some(FromWorker::Ready) => (),
            _ => bail!("worker did not report ready"),
        }
        tracing::info!(program = ?worker.program, "worker ready to serve");

        let (singles_tx, singles_rx) = mpsc::channel(max_batch_size);
        let (submissions_tx, submissions_rx) = mpsc::channel(max_queue_size);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let inflight = Arc::new(Semaphore::new(max_queue_size));
        let stages = Arc::new(stages);

        let tasks = vec![
            tokio::spawn(run_former(
                singles_rx,
                submissions_tx.clone(),
                max_batch_size,
                timeout,
            )),
            tokio::spawn(run_preprocess(
                submissions_rx,
                completions_tx,
                process.stdin,
                inflight,
                stages.clone(),
            )),
            tokio::spawn(run_postprocess::<O, _, I>(
                process.stdout,
                completions_rx,
                stages,
            )),
        ];

        Ok(Self {
            singles: singles_tx,
            submissions: submissions_tx,
            child: Mutex::new(process.child),
            tasks,
            stopped: AtomicBool::new(false),
        })
    }

    /// Submits a single item and resolves to its transformed result once the
    /// batch containing it has been served.
    ///
    /// Waits when the current batch has no free slot, which is how worker
    /// backpressure ultimately reaches the callers.
    pub async fn submit_one(&self, item: I) -> ItemResult<O> {
        let (sender, receiver) = oneshot::channel();
        self.singles
            .send((item, sender))
            .await
            .map_err(|_| DispatchError::Stopped)?;
        receiver.await.map_err(|_| DispatchError::Stopped)?
    }

    /// Submits a whole sequence as one unit, bypassing batch formation. The
    /// worker receives it as a single batch regardless of its size and the
    /// result sequence resolves in input order.
    pub async fn submit_bulk(&self, items: Vec<I>) -> BulkResult<O> {
        let (sender, receiver) = oneshot::channel();
        self.submissions
            .send(Submission::Bulk(items, sender))
            .await
            .map_err(|_| DispatchError::Stopped)?;
        receiver.await.map_err(|_| DispatchError::Stopped)?
    }
}

impl<I, O> Dispatcher<I, O> {
    /// Stops the host stages and kills the worker process. Idempotent;
    /// outstanding and later submissions resolve to
    /// [`DispatchError::Stopped`].
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in &self.tasks {
            task.abort();
        }
        if let Err(err) = self.child.lock().unwrap().start_kill() {
            tracing::warn!(error = ?err, "failed to kill the worker process");
        }
        tracing::info!("dispatcher stopped");
    }
}

impl<I, O> Drop for Dispatcher<I, O> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Coalesces individual submissions into batches and publishes them onto the
/// bounded batches queue.
///
/// The publishing send waits when the queue is full; meanwhile new singles
/// pile up in the bounded singles channel until `submit_one` callers block.
/// A waiting batch is published the moment capacity frees, so no batch can
/// be starved.
async fn run_former<I, O>(
    singles: mpsc::Receiver<(I, oneshot::Sender<ItemResult<O>>)>,
    submissions: mpsc::Sender<Submission<I, O>>,
    max_batch_size: usize,
    timeout: Duration,
) {
    let chunks = batching::batches(ReceiverStream::new(singles), max_batch_size, timeout);
    futures::pin_mut!(chunks);
    while let Some(chunk) = chunks.next().await {
        let (items, promises): (Vec<_>, Vec<_>) = chunk.into_iter().unzip();
        if submissions
            .send(Submission::Batch(items, promises))
            .await
            .is_err()
        {
            // The preprocess stage is gone; dropping the promises rejects the
            // waiting callers.
            return;
        }
    }
}

/// Ships submissions to the worker in queue order.
async fn run_preprocess<I, O, S>(
    mut submissions: mpsc::Receiver<Submission<I, O>>,
    completions: mpsc::UnboundedSender<Inflight<O>>,
    mut to_worker: BufWriter<ChildStdin>,
    inflight: Arc<Semaphore>,
    stages: Arc<S>,
) where
    I: Serialize + Send + Sync + 'static,
    O: Send + 'static,
    S: Stages<I, O>,
{
    while let Some(submission) = submissions.recv().await {
        let permit = match inflight.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let (payload, completion) = match submission {
            Submission::Batch(items, promises) => (items, Completion::Batch(promises)),
            Submission::Bulk(items, promise) => (items, Completion::Bulk(promise)),
        };
        // The completion set must be queued before the payload can reach the
        // worker; this is what keeps completion order equal to result order.
        if completions
            .send(Inflight {
                completion,
                _permit: permit,
            })
            .is_err()
        {
            return;
        }
        let envelope = match stages.preprocess(payload).await {
            Ok(payload) => ToWorker::Batch(payload),
            Err(err) => {
                tracing::warn!(error = ?err, "preprocess failed, forwarding an error carrier");
                ToWorker::Failed(RemoteError::from_error(&err))
            }
        };
        if let Err(err) = wire::send_frame(&mut to_worker, &envelope).await {
            tracing::error!(error = ?err, "failed to ship a batch to the worker");
            return;
        }
    }
    // All submission handles are gone; let the worker wind down cleanly.
    let _ = wire::send_frame(&mut to_worker, &ToWorker::<I>::NoMoreInput).await;
}

/// Routes worker results to the promises of their completion sets.
async fn run_postprocess<O, S, I>(
    mut from_worker: BufReader<ChildStdout>,
    mut completions: mpsc::UnboundedReceiver<Inflight<O>>,
    stages: Arc<S>,
) where
    I: Send + 'static,
    O: DeserializeOwned + Send + 'static,
    S: Stages<I, O>,
{
    loop {
        let frame = match wire::recv_frame::<FromWorker<O>, _>(&mut from_worker).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::error!("worker process died");
                fail_pending(&mut completions);
                return;
            }
            Err(err) => {
                tracing::error!(error = ?err, "transport failure");
                fail_pending(&mut completions);
                return;
            }
        };
        let result: BatchResult<O> = match frame {
            FromWorker::NoMoreOutput => return,
            FromWorker::Ready => {
                tracing::warn!("unexpected ready frame while serving");
                continue;
            }
            FromWorker::Failed(err) => Err(DispatchError::Remote(err)),
            FromWorker::Batch(outputs) => match stages.postprocess(outputs).await {
                Ok(outputs) => Ok(outputs),
                Err(err) => {
                    tracing::warn!(error = ?err, "postprocess failed");
                    Err(DispatchError::host(err))
                }
            },
        };
        match completions.recv().await {
            Some(inflight) => resolve(inflight.completion, result),
            None => return,
        }
    }
}

fn resolve<O>(completion: Completion<O>, result: BatchResult<O>) {
    match completion {
        Completion::Bulk(promise) => {
            // A closed promise means the caller cancelled; skip it silently.
            let _ = promise.send(result);
        }
        Completion::Batch(promises) => match result {
            Err(err) => {
                for promise in promises {
                    let _ = promise.send(Err(err.clone()));
                }
            }
            Ok(outputs) if outputs.len() != promises.len() => {
                let err = DispatchError::Protocol {
                    expected: promises.len(),
                    got: outputs.len(),
                };
                tracing::error!(%err, "rejecting the whole batch");
                for promise in promises {
                    let _ = promise.send(Err(err.clone()));
                }
            }
            Ok(outputs) => {
                for (promise, output) in promises.into_iter().zip(outputs) {
                    let _ = promise.send(Ok(output));
                }
            }
        },
    }
}

/// Rejects every queued completion set after a fatal transport failure.
fn fail_pending<O>(completions: &mut mpsc::UnboundedReceiver<Inflight<O>>) {
    completions.close();
    while let Ok(inflight) = completions.try_recv() {
        resolve(inflight.completion, Err(DispatchError::WorkerDied));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_depend_on_the_batch_size() {
        assert_eq!(DispatcherConfig::new(10).validate().unwrap().2, 100);
        assert_eq!(DispatcherConfig::new(11).validate().unwrap().2, 32);
    }

    #[test]
    fn config_rejects_out_of_range_values() {
        assert!(DispatcherConfig::new(0).validate().is_err());
        assert!(DispatcherConfig::new(10_001).validate().is_err());
        assert!(DispatcherConfig::new(1)
            .timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(DispatcherConfig::new(1)
            .timeout(Duration::from_secs(2))
            .validate()
            .is_err());
        assert!(DispatcherConfig::new(1).max_queue_size(0).validate().is_err());
        assert!(DispatcherConfig::new(1)
            .max_queue_size(129)
            .validate()
            .is_err());
    }

    #[tokio::test]
    async fn former_pairs_items_with_their_promises() {
        let (singles_tx, singles_rx) = mpsc::channel(4);
        let (submissions_tx, mut submissions_rx) = mpsc::channel::<Submission<i64, i64>>(4);
        let former = tokio::spawn(run_former(
            singles_rx,
            submissions_tx,
            2,
            Duration::from_millis(50),
        ));

        let mut receivers = Vec::new();
        for item in [1, 2, 3] {
            let (sender, receiver) = oneshot::channel();
            singles_tx.send((item, sender)).await.unwrap();
            receivers.push(receiver);
        }
        drop(singles_tx);

        match submissions_rx.recv().await.unwrap() {
            Submission::Batch(items, promises) => {
                assert_eq!(items, [1, 2]);
                assert_eq!(promises.len(), 2);
            }
            Submission::Bulk(..) => panic!("expected a coalesced batch"),
        }
        match submissions_rx.recv().await.unwrap() {
            Submission::Batch(items, promises) => {
                assert_eq!(items, [3]);
                assert_eq!(promises.len(), 1);
            }
            Submission::Bulk(..) => panic!("expected a coalesced batch"),
        }
        former.await.unwrap();
    }

    #[test]
    fn errors_fan_out_to_every_promise_of_a_batch() {
        let (first_tx, mut first_rx) = oneshot::channel();
        let (second_tx, mut second_rx) = oneshot::channel::<ItemResult<i64>>();
        resolve(
            Completion::Batch(vec![first_tx, second_tx]),
            Err(DispatchError::Remote(RemoteError::from_error(
                &anyhow::anyhow!("boom"),
            ))),
        );
        assert!(matches!(
            first_rx.try_recv().unwrap(),
            Err(DispatchError::Remote(_))
        ));
        assert!(matches!(
            second_rx.try_recv().unwrap(),
            Err(DispatchError::Remote(_))
        ));
    }

    #[test]
    fn length_mismatches_reject_the_whole_batch() {
        let (first_tx, mut first_rx) = oneshot::channel();
        let (second_tx, mut second_rx) = oneshot::channel();
        resolve(
            Completion::Batch(vec![first_tx, second_tx]),
            Ok(vec![1]),
        );
        for result in [first_rx.try_recv().unwrap(), second_rx.try_recv().unwrap()] {
            assert!(matches!(
                result,
                Err(DispatchError::Protocol {
                    expected: 2,
                    got: 1
                })
            ));
        }
    }

    #[test]
    fn cancelled_promises_are_skipped_silently() {
        let (cancelled_tx, cancelled_rx) = oneshot::channel();
        let (kept_tx, mut kept_rx) = oneshot::channel();
        drop(cancelled_rx);
        resolve(Completion::Batch(vec![cancelled_tx, kept_tx]), Ok(vec![1, 2]));
        assert!(matches!(kept_rx.try_recv().unwrap(), Ok(2)));
    }
}
