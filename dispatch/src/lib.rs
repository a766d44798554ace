//! Batched dispatch of inference style workloads to worker processes.
//!
//! Two packagings of the same idea live here. [`Dispatcher`] coalesces
//! individual submissions into bounded batches, ships every batch to a single
//! worker process and scatters the per item results back to the submitting
//! callers in order. [`ModelService`] runs one or more stages of parallel
//! worker processes and routes explicitly tagged work units through them,
//! allowing out of order completion across workers.
//!
//! Worker processes are ordinary binaries that construct their transformer
//! and hand control to [`run_transformer`] or [`run_modelet`]. The host talks
//! to them over their stdio with length prefixed JSON frames.

mod batching;

pub mod dispatcher;
pub mod error;
pub mod modelet;
pub mod process;
pub mod service;
pub mod transformer;
pub mod wire;

pub use dispatcher::{Dispatcher, DispatcherConfig, IdentityStages, Stages};
pub use error::{DispatchError, RemoteError};
pub use modelet::{run_modelet, Modelet};
pub use process::WorkerCommand;
pub use service::{ModelService, ModelServiceBuilder, StageConfig};
pub use transformer::{run_transformer, VectorTransformer};
