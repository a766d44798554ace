//! Multiplies work units by a configurable factor.

use anyhow::{ensure, Result};
use dispatch::{run_modelet, Modelet};
use serde_json::Value;

struct Scale {
    factor: i64,
    fail_below: Option<i64>,
}

impl Modelet for Scale {
    type Input = i64;
    type Output = i64;

    fn load(&mut self, params: Value) -> Result<()> {
        if let Some(factor) = params.get("factor").and_then(Value::as_i64) {
            self.factor = factor;
        }
        self.fail_below = params.get("fail_below").and_then(Value::as_i64);
        Ok(())
    }

    fn predict(&mut self, batch: Vec<i64>) -> Result<Vec<i64>> {
        if let Some(limit) = self.fail_below {
            ensure!(batch.iter().all(|x| *x >= limit), "input below {limit}");
        }
        Ok(batch.into_iter().map(|x| x * self.factor).collect())
    }
}

fn main() -> Result<()> {
    e2e::init_tracing();
    run_modelet(Scale {
        factor: 2,
        fail_below: None,
    })
}
