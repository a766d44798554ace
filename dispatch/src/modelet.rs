//! Worker process side of the model service.
//!
//! A modelet serves micro batches of identity tagged work units. The host
//! forms the micro batches (see [`service`](crate::service)); the modelet
//! only predicts and reports results or failures under the same identities.

use crate::error::RemoteError;
use crate::wire::{self, FromModelet, ToModelet};
use anyhow::{bail, ensure, Context as _, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::io::{self, BufReader, BufWriter, Read, Write};

/// A model hosted in a worker process.
pub trait Modelet {
    type Input: DeserializeOwned;
    type Output: Serialize;

    /// Called once after the handshake with the load parameters supplied by
    /// the host. Does nothing by default.
    fn load(&mut self, params: Value) -> Result<()> {
        let _ = params;
        Ok(())
    }

    /// Predicts one micro batch. Always receives a list, even when the host
    /// serves units one at a time; must return one output per input.
    fn predict(&mut self, batch: Vec<Self::Input>) -> Result<Vec<Self::Output>>;

    /// Errors of an expected kind can opt out of loud logging; they are still
    /// shipped to the host unchanged.
    fn is_quiet_error(&self, err: &anyhow::Error) -> bool {
        let _ = err;
        false
    }
}

/// Serves `modelet` over the process' stdio until the host signals end of
/// input. Call this from the worker binary's `main`.
///
/// Stdout is the data channel; anything the worker wants to log must go to
/// stderr.
pub fn run_modelet<M: Modelet>(modelet: M) -> Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    serve(
        modelet,
        &mut BufReader::new(stdin.lock()),
        &mut BufWriter::new(stdout.lock()),
    )
}

fn serve<M: Modelet>(mut modelet: M, input: &mut impl Read, output: &mut impl Write) -> Result<()> {
    match wire::read_frame(input)?.context("transport closed before the handshake")? {
        ToModelet::Init { cpu, load } => {
            if let Some(cpu) = cpu {
                pin_to_core(cpu);
            }
            modelet.load(load).context("modelet failed to load")?;
        }
        _ => bail!("expected the init handshake"),
    }
    wire::write_frame(output, &FromModelet::Ready)?;
    tracing::info!("modelet ready");

    loop {
        let reply = match wire::read_frame(input)?.context("transport closed while serving")? {
            ToModelet::NoMoreInput => {
                tracing::info!("modelet shutting down");
                return wire::write_frame(output, &FromModelet::NoMoreOutput);
            }
            ToModelet::Init { .. } => bail!("unexpected second init handshake"),
            ToModelet::Predict { ids, items } => match predict_batch(&mut modelet, &ids, items) {
                Ok(outputs) => FromModelet::Done { ids, outputs },
                Err(err) => {
                    if modelet.is_quiet_error(&err) {
                        tracing::debug!(error = ?err, "predict failed");
                    } else {
                        tracing::error!(error = ?err, "predict failed");
                    }
                    FromModelet::Failed {
                        ids,
                        error: RemoteError::from_error(&err),
                    }
                }
            },
        };
        wire::write_frame(output, &reply)?;
    }
}

fn predict_batch<M: Modelet>(modelet: &mut M, ids: &[u64], items: Vec<Value>) -> Result<Vec<Value>> {
    let batch = items
        .into_iter()
        .map(|item| serde_json::from_value(item).context("failed to deserialize work unit"))
        .collect::<Result<Vec<_>>>()?;
    let outputs = modelet.predict(batch)?;
    ensure!(
        outputs.len() == ids.len(),
        "modelet returned {} results for a micro batch of {}",
        outputs.len(),
        ids.len()
    );
    outputs
        .into_iter()
        .map(|output| serde_json::to_value(output).context("failed to serialize result"))
        .collect()
}

fn pin_to_core(cpu: usize) {
    let pinned = core_affinity::set_for_current(core_affinity::CoreId { id: cpu });
    if pinned {
        tracing::info!(cpu, "pinned worker to core");
    } else {
        tracing::warn!(cpu, "failed to pin worker to core");
    }
}
