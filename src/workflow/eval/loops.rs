use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{OrchflowError, Result};

use super::{condition::Predicate, path::lookup};

/// Termination rule of a loop node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LoopBound {
    /// run the body a fixed number of times
    Count(u32),
    /// run the body once per element of the array at this path of the loop input
    ForEach(String),
    /// run the body while the predicate holds
    ///
    /// The predicate sees `{index, input, last}` where `last` is the output of the
    /// previous iteration (null before the first one).
    While(Predicate),
}

/// Iteration state of one loop node execution.
#[derive(Debug, Clone)]
pub struct LoopCursor {
    bound: LoopBound,
    max_iterations: u32,
    input: Value,
    items: Vec<Value>,
    index: u32,
    outputs: Vec<Value>,
}

impl LoopCursor {
    pub fn new(
        bound: &LoopBound,
        max_iterations: u32,
        input: Value,
    ) -> Result<Self> {
        let items = match bound {
            LoopBound::ForEach(path) => match lookup(&input, path) {
                Some(Value::Array(items)) => items.clone(),
                Some(_) => return Err(OrchflowError::Validation(format!("loop collection '{}' is not an array", path))),
                None => return Err(OrchflowError::Validation(format!("loop collection '{}' not found in input", path))),
            },
            _ => Vec::new(),
        };
        if items.len() > max_iterations as usize {
            return Err(OrchflowError::Validation(format!("loop collection has {} items, more than max_iterations {}", items.len(), max_iterations)));
        }

        Ok(Self {
            bound: bound.clone(),
            max_iterations,
            input,
            items,
            index: 0,
            outputs: Vec::new(),
        })
    }

    /// Index of the iteration that would run next.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Advance to the next iteration, returning the body input, or `None` when the loop is done.
    ///
    /// A loop whose bound still asks for another iteration at `max_iterations` is an error.
    pub fn next_iteration(&mut self) -> Result<Option<Value>> {
        let item = match &self.bound {
            LoopBound::Count(n) => {
                if self.index >= *n {
                    return Ok(None);
                }
                json!(self.index)
            }
            LoopBound::ForEach(_) => match self.items.get(self.index as usize) {
                Some(item) => item.clone(),
                None => return Ok(None),
            },
            LoopBound::While(predicate) => {
                let scope = json!({
                    "index": self.index,
                    "input": self.input,
                    "last": self.outputs.last().cloned().unwrap_or(Value::Null),
                });
                if !predicate.evaluate(&scope) {
                    return Ok(None);
                }
                json!(self.index)
            }
        };
        if self.index >= self.max_iterations {
            return Err(OrchflowError::Validation(format!("loop is still running after max_iterations {}", self.max_iterations)));
        }

        let body_input = json!({
            "item": item,
            "index": self.index,
            "input": self.input,
        });
        self.index += 1;
        Ok(Some(body_input))
    }

    /// Record the output of the iteration that just finished.
    pub fn record(
        &mut self,
        output: Value,
    ) {
        self.outputs.push(output);
    }

    /// Aggregated loop output.
    pub fn output(&self) -> Value {
        json!({
            "iterations": self.outputs.len(),
            "outputs": self.outputs,
        })
    }
}
