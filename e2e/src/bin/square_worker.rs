//! Squares whole batches. The host's load parameters make it misbehave on
//! demand, which is what the failure scenarios are built from.

use anyhow::{ensure, Result};
use dispatch::{run_transformer, VectorTransformer};
use serde_json::Value;
use std::time::Duration;

#[derive(Default)]
struct Square {
    /// Slows every batch down, for backpressure scenarios.
    delay: Duration,
    /// Batches containing this value fail.
    fail_on: Option<i64>,
    /// Batches containing this value kill the process, for transport
    /// failure scenarios.
    exit_on: Option<i64>,
}

impl VectorTransformer for Square {
    type Input = i64;
    type Output = i64;

    fn load(&mut self, params: Value) -> Result<()> {
        if let Some(delay_ms) = params.get("delay_ms").and_then(Value::as_u64) {
            self.delay = Duration::from_millis(delay_ms);
        }
        self.fail_on = params.get("fail_on").and_then(Value::as_i64);
        self.exit_on = params.get("exit_on").and_then(Value::as_i64);
        Ok(())
    }

    fn transform(&mut self, batch: &[i64]) -> Result<Vec<i64>> {
        if let Some(bad) = self.exit_on {
            if batch.contains(&bad) {
                tracing::error!(bad, "dying on demand");
                std::process::exit(7);
            }
        }
        if let Some(bad) = self.fail_on {
            ensure!(!batch.contains(&bad), "bad value: {bad}");
        }
        std::thread::sleep(self.delay);
        Ok(batch.iter().map(|x| x * x).collect())
    }
}

fn main() -> Result<()> {
    e2e::init_tracing();
    run_transformer(Square::default())
}
