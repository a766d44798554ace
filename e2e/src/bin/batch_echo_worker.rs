//! Squares items and tags every result with the batch it arrived in, so the
//! tests can check what the worker actually observed.

use anyhow::Result;
use dispatch::{run_transformer, VectorTransformer};
use e2e::Observation;

#[derive(Default)]
struct BatchEcho {
    batches_seen: u64,
}

impl VectorTransformer for BatchEcho {
    type Input = i64;
    type Output = Observation;

    fn transform(&mut self, batch: &[i64]) -> Result<Vec<Observation>> {
        self.batches_seen += 1;
        Ok(batch
            .iter()
            .map(|x| Observation {
                value: x * x,
                batch: self.batches_seen,
                batch_len: batch.len(),
            })
            .collect())
    }
}

fn main() -> Result<()> {
    e2e::init_tracing();
    run_transformer(BatchEcho::default())
}
