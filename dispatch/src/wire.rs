//! Wire protocol between the host and its worker processes.
//!
//! Every message is one frame on the child's stdio: a `u32` little endian
//! length prefix followed by a JSON encoded envelope. The envelopes
//! distinguish the three payload kinds that can travel in either direction:
//! data, a remote error carrier, and control values. The host side reads and
//! writes asynchronously, the worker side blocks.

use crate::error::RemoteError;
use anyhow::{ensure, Context as _, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::io::{ErrorKind, Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

/// Anything larger than this is a corrupt stream, not a payload.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Host to worker envelope of the batched dispatcher.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ToWorker<T> {
    /// Handshake carrying the parameters for the transformer's `load` hook.
    Init { load: Value },
    /// One batch of work.
    Batch(Vec<T>),
    /// The host failed to prepare this batch. The worker echoes the carrier
    /// back unchanged so results stay aligned with their completion sets.
    Failed(RemoteError),
    /// No more batches will arrive; wind down.
    NoMoreInput,
}

/// Worker to host envelope of the batched dispatcher.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FromWorker<T> {
    /// The transformer is constructed and loaded.
    Ready,
    /// The results of one batch, parallel to its inputs.
    Batch(Vec<T>),
    /// User code failed for this batch.
    Failed(RemoteError),
    /// The worker wound down after end of input.
    NoMoreOutput,
}

/// Host to model worker envelope. Work units carry explicit identities so
/// parallel workers can interleave; payloads stay opaque to the host.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ToModelet {
    /// Handshake; `cpu` pins the worker process to a core.
    Init { cpu: Option<usize>, load: Value },
    /// One micro batch, `ids` parallel to `items`.
    Predict { ids: Vec<u64>, items: Vec<Value> },
    /// No more work units will arrive; wind down.
    NoMoreInput,
}

/// Model worker to host envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FromModelet {
    /// The modelet is constructed and loaded.
    Ready,
    /// Results of one micro batch, `ids` parallel to `outputs`.
    Done { ids: Vec<u64>, outputs: Vec<Value> },
    /// The whole micro batch failed.
    Failed { ids: Vec<u64>, error: RemoteError },
    /// The worker wound down after end of input.
    NoMoreOutput,
}

/// Writes one frame to a blocking writer. Worker side.
pub fn write_frame<T: Serialize>(writer: &mut impl Write, message: &T) -> Result<()> {
    let body = serde_json::to_vec(message).context("failed to serialize frame")?;
    ensure!(
        body.len() <= MAX_FRAME_LEN as usize,
        "frame of {} bytes exceeds the limit",
        body.len()
    );
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame from a blocking reader. Worker side. Returns `None` on a
/// clean end of stream before the length prefix.
pub fn read_frame<T: DeserializeOwned>(reader: &mut impl Read) -> Result<Option<T>> {
    let mut prefix = [0; 4];
    match reader.read_exact(&mut prefix) {
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        result => result.context("failed to read frame length")?,
    }
    let len = u32::from_le_bytes(prefix);
    ensure!(len <= MAX_FRAME_LEN, "frame of {len} bytes exceeds the limit");
    let mut body = vec![0; len as usize];
    reader
        .read_exact(&mut body)
        .context("failed to read frame body")?;
    Ok(Some(
        serde_json::from_slice(&body).context("failed to deserialize frame")?,
    ))
}

/// Writes one frame to the worker's stdin. Host side.
pub async fn send_frame<T, W>(writer: &mut W, message: &T) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(message).context("failed to serialize frame")?;
    ensure!(
        body.len() <= MAX_FRAME_LEN as usize,
        "frame of {} bytes exceeds the limit",
        body.len()
    );
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame from the worker's stdout. Host side. Returns `None` when
/// the worker closed its end, which outside of an orderly shutdown means the
/// process died.
pub async fn recv_frame<T, R>(reader: &mut R) -> Result<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut prefix = [0; 4];
    match reader.read_exact(&mut prefix).await {
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        result => {
            result.context("failed to read frame length")?;
        }
    }
    let len = u32::from_le_bytes(prefix);
    ensure!(len <= MAX_FRAME_LEN, "frame of {len} bytes exceeds the limit");
    let mut body = vec![0; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .context("failed to read frame body")?;
    Ok(Some(
        serde_json::from_slice(&body).context("failed to deserialize frame")?,
    ))
}
