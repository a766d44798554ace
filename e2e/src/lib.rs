//! Shared pieces for the end to end tests and their worker binaries.

use serde::{Deserialize, Serialize};

/// What the batch observing worker reports for every item: the transformed
/// value plus which batch (and of what size) the worker saw it arrive in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub value: i64,
    pub batch: u64,
    pub batch_len: usize,
}

/// Worker binaries must log to stderr; their stdout is the data channel.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
