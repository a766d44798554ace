//! Worker process side of the batched dispatcher.

use crate::error::RemoteError;
use crate::wire::{self, FromWorker, ToWorker};
use anyhow::{bail, Context as _, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::io::{self, BufReader, BufWriter, Read, Write};

/// A vectorized transformation hosted in a worker process.
///
/// The worker serves whole batches through the three step contract
/// `preprocess → transform → postprocess`; only `transform` is required.
/// Construction parameters should be simple values the worker binary can
/// parse itself; parameters that the host wants to control travel through
/// `load` instead.
pub trait VectorTransformer {
    type Input: DeserializeOwned;
    type Output: Serialize;

    /// Called once after the handshake with the load parameters supplied by
    /// the host. Does nothing by default.
    fn load(&mut self, params: serde_json::Value) -> Result<()> {
        let _ = params;
        Ok(())
    }

    /// Prepares a batch for [`transform`](Self::transform). Identity by
    /// default.
    fn preprocess(&mut self, batch: Vec<Self::Input>) -> Result<Vec<Self::Input>> {
        Ok(batch)
    }

    /// The vectorized transformation. Must return one output per input.
    fn transform(&mut self, batch: &[Self::Input]) -> Result<Vec<Self::Output>>;

    /// Derives the batch result sent back to the host. Receives the
    /// preprocessed inputs in case they are needed; returns the transform
    /// output unchanged by default.
    fn postprocess(
        &mut self,
        pre: &[Self::Input],
        out: Vec<Self::Output>,
    ) -> Result<Vec<Self::Output>> {
        let _ = pre;
        Ok(out)
    }

    /// Called once on orderly shutdown.
    fn terminate(&mut self) {}
}

/// Serves `transformer` over the process' stdio until the host signals end of
/// input. Call this from the worker binary's `main`.
///
/// Stdout is the data channel; anything the worker wants to log must go to
/// stderr.
pub fn run_transformer<T: VectorTransformer>(transformer: T) -> Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    serve(
        transformer,
        &mut BufReader::new(stdin.lock()),
        &mut BufWriter::new(stdout.lock()),
    )
}

fn serve<T: VectorTransformer>(
    mut transformer: T,
    input: &mut impl Read,
    output: &mut impl Write,
) -> Result<()> {
    let handshake: ToWorker<T::Input> =
        wire::read_frame(input)?.context("transport closed before the handshake")?;
    match handshake {
        ToWorker::Init { load } => transformer
            .load(load)
            .context("transformer failed to load")?,
        _ => bail!("expected the init handshake"),
    }
    wire::write_frame(output, &FromWorker::<T::Output>::Ready)?;
    tracing::info!("transformer ready");

    loop {
        let message: ToWorker<T::Input> =
            wire::read_frame(input)?.context("transport closed while serving")?;
        let reply = match message {
            ToWorker::NoMoreInput => {
                transformer.terminate();
                tracing::info!("transformer shutting down");
                return wire::write_frame(output, &FromWorker::<T::Output>::NoMoreOutput);
            }
            ToWorker::Init { .. } => bail!("unexpected second init handshake"),
            ToWorker::Failed(err) => FromWorker::Failed(err),
            ToWorker::Batch(batch) => {
                let len = batch.len();
                match transform_batch(&mut transformer, batch) {
                    Ok(outputs) => FromWorker::Batch(outputs),
                    Err(err) => {
                        tracing::error!(batch_len = len, error = ?err, "transform failed");
                        FromWorker::Failed(RemoteError::from_error(&err))
                    }
                }
            }
        };
        wire::write_frame(output, &reply)?;
    }
}

fn transform_batch<T: VectorTransformer>(
    transformer: &mut T,
    batch: Vec<T::Input>,
) -> Result<Vec<T::Output>> {
    let pre = transformer.preprocess(batch)?;
    let out = transformer.transform(&pre)?;
    transformer.postprocess(&pre, out)
}
