use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A serializable snapshot of an error that occurred in a worker process.
///
/// Errors do not survive a process boundary, so the worker captures the
/// pieces a caller needs for diagnosis at the moment the error escapes user
/// code, before anything else can supersede it: the root cause, the full
/// context chain and the debug rendering (which contains a backtrace when one
/// was captured).
#[derive(Clone, Debug, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    /// Display of the root cause.
    pub kind: String,
    /// Display of the error with its full context chain.
    pub message: String,
    /// Debug rendering captured in the worker at the catch site.
    pub trace: String,
}

impl RemoteError {
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            kind: err.root_cause().to_string(),
            message: format!("{err:#}"),
            trace: format!("{err:?}"),
        }
    }
}

/// Errors surfaced to [`Dispatcher`](crate::Dispatcher) and
/// [`ModelService`](crate::ModelService) callers.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DispatchError {
    /// User code inside the worker process failed for this batch. Carries
    /// the remote error as captured in the worker.
    #[error("worker error: {0}")]
    Remote(RemoteError),
    /// A host side hook failed for this batch.
    #[error("host stage error: {0:#}")]
    Host(Arc<anyhow::Error>),
    /// The worker returned a result sequence of the wrong length.
    #[error("worker returned {got} results for a batch of {expected}")]
    Protocol { expected: usize, got: usize },
    /// The worker process terminated unexpectedly.
    #[error("worker process died")]
    WorkerDied,
    /// The dispatcher was stopped while the submission was pending.
    #[error("dispatcher stopped")]
    Stopped,
}

impl From<RemoteError> for DispatchError {
    fn from(err: RemoteError) -> Self {
        Self::Remote(err)
    }
}

impl DispatchError {
    pub(crate) fn host(err: impl Into<anyhow::Error>) -> Self {
        Self::Host(Arc::new(err.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context as _;

    #[test]
    fn remote_error_keeps_cause_and_context() {
        let err = Err::<(), _>(anyhow::anyhow!("bad value: 0"))
            .context("transform failed")
            .unwrap_err();
        let remote = RemoteError::from_error(&err);
        assert_eq!(remote.kind, "bad value: 0");
        assert_eq!(remote.message, "transform failed: bad value: 0");
        assert!(remote.trace.contains("bad value: 0"));
    }

    #[test]
    fn remote_error_round_trips() {
        let remote = RemoteError::from_error(&anyhow::anyhow!("boom"));
        let json = serde_json::to_string(&remote).unwrap();
        let back: RemoteError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, remote.kind);
        assert_eq!(back.message, remote.message);
        assert_eq!(back.trace, remote.trace);
    }
}
