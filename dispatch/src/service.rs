//! Multi process model service with explicit work unit identities.
//!
//! A service is an ordered list of stages; each stage is a set of identical
//! worker processes sharing one bounded inbound queue. Results of a stage
//! feed the next stage's queue; results of the last stage resolve caller
//! promises. Because several workers serve one queue, results can arrive out
//! of order — every work unit therefore carries a `u64` identity and a
//! concurrent map from identity to promise is the sole routing structure.
//! Within one worker, order is preserved.

use crate::error::DispatchError;
use crate::process::{self, WorkerCommand};
use crate::wire::{self, FromModelet, ToModelet};
use anyhow::{bail, ensure, Context as _, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

type UnitResult = Result<Value, DispatchError>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<UnitResult>>>>;
type Inbound = Arc<AsyncMutex<mpsc::Receiver<(u64, Value)>>>;

/// Configuration of one service stage.
#[derive(Clone, Debug)]
pub struct StageConfig {
    /// Number of worker processes when no pinning is requested.
    pub replicas: usize,
    /// Per worker CPU pins. Overrides `replicas`: one worker per entry,
    /// repeats allowed.
    pub cpus: Option<Vec<usize>>,
    /// Micro batch capacity per worker. 1 serves units one at a time.
    pub batch_size: usize,
    /// How long a worker waits for further units once it holds the first one
    /// of a micro batch. Zero collects only units that are already queued.
    pub batch_wait_time: Duration,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            replicas: 1,
            cpus: None,
            batch_size: 1,
            batch_wait_time: Duration::ZERO,
        }
    }
}

impl StageConfig {
    fn placements(&self) -> Result<Vec<Option<usize>>> {
        ensure!(self.batch_size >= 1, "batch_size must be at least 1");
        let placements = match &self.cpus {
            Some(cpus) => cpus.iter().map(|cpu| Some(*cpu)).collect(),
            None => vec![None; self.replicas],
        };
        ensure!(!placements.is_empty(), "a stage needs at least one worker");
        Ok(placements)
    }
}

/// Builds a [`ModelService`] stage by stage.
pub struct ModelServiceBuilder {
    stages: Vec<(WorkerCommand, StageConfig)>,
    max_queue_size: usize,
}

impl ModelServiceBuilder {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            max_queue_size: 1024,
        }
    }

    /// Capacity of every inter stage queue.
    pub fn max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Appends a stage. Stages serve work units in the order they were
    /// added.
    pub fn add_stage(mut self, worker: WorkerCommand, config: StageConfig) -> Self {
        self.stages.push((worker, config));
        self
    }

    /// Spawns all worker processes, waits for each to report ready and wires
    /// the stages together.
    pub async fn start(self) -> Result<ModelService> {
        ensure!(!self.stages.is_empty(), "a model service needs at least one stage");
        ensure!(self.max_queue_size >= 1, "max_queue_size must be at least 1");

        let pending: Pending = Default::default();
        let mut children = Vec::new();
        let mut tasks = Vec::new();

        // Wire the stages back to front so each one knows where its results
        // go: the last stage resolves promises, every other stage feeds its
        // successor's inbound queue.
        let mut next: Option<mpsc::Sender<(u64, Value)>> = None;
        for (worker, config) in self.stages.iter().rev() {
            let (inbound_tx, inbound_rx) = mpsc::channel(self.max_queue_size);
            let inbound: Inbound = Arc::new(AsyncMutex::new(inbound_rx));

            for cpu in config.placements()? {
                let mut process = process::spawn(worker)?;
                wire::send_frame(
                    &mut process.stdin,
                    &ToModelet::Init {
                        cpu,
                        load: worker.load.clone(),
                    },
                )
                .await
                .context("failed to send the init handshake")?;
                match wire::recv_frame::<FromModelet, _>(&mut process.stdout)
                    .await
                    .context("failed to read the worker handshake")?
                {
                    Some(FromModelet::Ready) => (),
                    _ => bail!("model worker did not report ready"),
                }

                tasks.push(tokio::spawn(run_forwarder(
                    inbound.clone(),
                    process.stdin,
                    config.batch_size,
                    config.batch_wait_time,
                )));
                tasks.push(tokio::spawn(run_gatherer(
                    process.stdout,
                    next.clone(),
                    pending.clone(),
                )));
                children.push(process.child);
            }
            next = Some(inbound_tx);
        }

        tracing::info!(stages = self.stages.len(), "model service ready");
        Ok(ModelService {
            inbound: next.expect("at least one stage was wired"),
            pending,
            next_id: AtomicU64::new(0),
            children: Mutex::new(children),
            tasks,
            stopped: AtomicBool::new(false),
        })
    }
}

impl Default for ModelServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes identity tagged work units through stages of parallel worker
/// processes.
///
/// Dropping the service stops it; outstanding predictions resolve to
/// [`DispatchError::Stopped`].
pub struct ModelService {
    inbound: mpsc::Sender<(u64, Value)>,
    pending: Pending,
    next_id: AtomicU64,
    children: Mutex<Vec<Child>>,
    tasks: Vec<JoinHandle<()>>,
    stopped: AtomicBool,
}

impl ModelService {
    pub fn builder() -> ModelServiceBuilder {
        ModelServiceBuilder::new()
    }

    /// Runs one work unit through all stages and resolves to the last
    /// stage's output. Waits for queue capacity when the service is loaded.
    pub async fn predict<I, O>(&self, input: I) -> Result<O, DispatchError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let item = serde_json::to_value(input).map_err(DispatchError::host)?;
        let (sender, receiver) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().unwrap().insert(id, sender);

        if self.inbound.send((id, item)).await.is_err() {
            self.pending.lock().unwrap().remove(&id);
            return Err(DispatchError::Stopped);
        }
        let value = receiver.await.map_err(|_| DispatchError::Stopped)??;
        serde_json::from_value(value).map_err(DispatchError::host)
    }

    /// Stops all routing tasks and kills the worker processes. Idempotent;
    /// outstanding and later predictions resolve to
    /// [`DispatchError::Stopped`].
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in &self.tasks {
            task.abort();
        }
        for child in self.children.lock().unwrap().iter_mut() {
            if let Err(err) = child.start_kill() {
                tracing::warn!(error = ?err, "failed to kill a model worker");
            }
        }
        for (_, promise) in self.pending.lock().unwrap().drain() {
            let _ = promise.send(Err(DispatchError::Stopped));
        }
        tracing::info!("model service stopped");
    }
}

impl Drop for ModelService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Feeds one worker from the stage's shared inbound queue.
async fn run_forwarder(
    inbound: Inbound,
    mut to_worker: BufWriter<ChildStdin>,
    batch_size: usize,
    batch_wait_time: Duration,
) {
    loop {
        // Hold the queue lock while collecting so this worker's micro batch
        // is contiguous even though all workers of the stage share the queue.
        let batch = {
            let mut queue = inbound.lock().await;
            match queue.recv().await {
                Some(unit) => collect_micro_batch(&mut queue, unit, batch_size, batch_wait_time).await,
                None => break,
            }
        };
        let (ids, items): (Vec<_>, Vec<_>) = batch.into_iter().unzip();
        if let Err(err) = wire::send_frame(&mut to_worker, &ToModelet::Predict { ids, items }).await
        {
            tracing::error!(error = ?err, "failed to ship a micro batch to the worker");
            return;
        }
    }
    let _ = wire::send_frame(&mut to_worker, &ToModelet::NoMoreInput).await;
}

async fn collect_micro_batch(
    queue: &mut mpsc::Receiver<(u64, Value)>,
    first: (u64, Value),
    batch_size: usize,
    batch_wait_time: Duration,
) -> Vec<(u64, Value)> {
    let mut batch = vec![first];
    if batch_size <= 1 {
        return batch;
    }
    if batch_wait_time.is_zero() {
        while batch.len() < batch_size {
            match queue.try_recv() {
                Ok(unit) => batch.push(unit),
                Err(_) => break,
            }
        }
    } else {
        let deadline = tokio::time::sleep(batch_wait_time);
        tokio::pin!(deadline);
        while batch.len() < batch_size {
            tokio::select! {
                unit = queue.recv() => match unit {
                    Some(unit) => batch.push(unit),
                    None => break,
                },
                _ = &mut deadline => break,
            }
        }
    }
    batch
}

/// Routes one worker's results onward: to the next stage's queue, or to the
/// caller promises after the last stage. Failed units skip the remaining
/// stages.
async fn run_gatherer(
    mut from_worker: BufReader<ChildStdout>,
    next: Option<mpsc::Sender<(u64, Value)>>,
    pending: Pending,
) {
    loop {
        let frame = match wire::recv_frame::<FromModelet, _>(&mut from_worker).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::error!("model worker died");
                fail_all(&pending, DispatchError::WorkerDied);
                return;
            }
            Err(err) => {
                tracing::error!(error = ?err, "transport failure");
                fail_all(&pending, DispatchError::WorkerDied);
                return;
            }
        };
        match frame {
            FromModelet::NoMoreOutput => return,
            FromModelet::Ready => {
                tracing::warn!("unexpected ready frame while serving");
            }
            FromModelet::Done { ids, outputs } => {
                for (id, output) in ids.into_iter().zip(outputs) {
                    match &next {
                        Some(next) => {
                            if next.send((id, output)).await.is_err() {
                                return;
                            }
                        }
                        None => resolve_unit(&pending, id, Ok(output)),
                    }
                }
            }
            FromModelet::Failed { ids, error } => {
                for id in ids {
                    resolve_unit(&pending, id, Err(DispatchError::Remote(error.clone())));
                }
            }
        }
    }
}

fn resolve_unit(pending: &Pending, id: u64, result: UnitResult) {
    match pending.lock().unwrap().remove(&id) {
        Some(promise) => {
            // A closed promise means the caller cancelled; skip it silently.
            let _ = promise.send(result);
        }
        None => tracing::warn!(id, "no pending promise for this work unit"),
    }
}

fn fail_all(pending: &Pending, err: DispatchError) {
    for (_, promise) in pending.lock().unwrap().drain() {
        let _ = promise.send(Err(err.clone()));
    }
}
