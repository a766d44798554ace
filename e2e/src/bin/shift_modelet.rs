//! Adds a configurable offset to work units.

use anyhow::Result;
use dispatch::{run_modelet, Modelet};
use serde_json::Value;

struct Shift {
    offset: i64,
}

impl Modelet for Shift {
    type Input = i64;
    type Output = i64;

    fn load(&mut self, params: Value) -> Result<()> {
        if let Some(offset) = params.get("offset").and_then(Value::as_i64) {
            self.offset = offset;
        }
        Ok(())
    }

    fn predict(&mut self, batch: Vec<i64>) -> Result<Vec<i64>> {
        Ok(batch.into_iter().map(|x| x + self.offset).collect())
    }
}

fn main() -> Result<()> {
    e2e::init_tracing();
    run_modelet(Shift { offset: 3 })
}
