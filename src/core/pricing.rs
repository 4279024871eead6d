//! Pricing and context-window tables
//!
//! Fixed per-model rates (USD per 1k tokens) and the maximum input sizes used
//! to compute the remaining token budget.

use serde::{Deserialize, Serialize};

use super::types::{Model, SimpleModel};

/// Which side of a request a token count belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Prompt side (input buffer, context)
    Input,
    /// Completion side (streaming assistant reply)
    Output,
}

/// Price of a model in USD per 1k tokens
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
}

impl ModelPricing {
    pub fn rate(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Input => self.input,
            Direction::Output => self.output,
        }
    }
}

/// Rate table for concrete models
pub fn pricing(model: Model) -> ModelPricing {
    match model {
        Model::Gpt4oMini => ModelPricing {
            input: 0.00015,
            output: 0.0006,
        },
        Model::Gpt4o20240806 => ModelPricing {
            input: 0.0025,
            output: 0.01,
        },
    }
}

/// Dollar cost of `tokens` on `model`
pub fn token_cost(tokens: usize, model: Model, direction: Direction) -> f64 {
    let thousands = tokens as f64 / 1000.0;
    pricing(model).rate(direction) * thousands
}

/// Maximum input tokens per model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenTable {
    #[serde(rename = "gpt-4o")]
    pub gpt_4o: usize,
    #[serde(rename = "gpt-4o-mini")]
    pub gpt_4o_mini: usize,
}

impl Default for TokenTable {
    fn default() -> Self {
        Self::uniform(128_000)
    }
}

impl TokenTable {
    /// Same budget for every model
    pub fn uniform(tokens: usize) -> Self {
        Self {
            gpt_4o: tokens,
            gpt_4o_mini: tokens,
        }
    }

    pub fn get(&self, model: SimpleModel) -> usize {
        match model {
            SimpleModel::Gpt4o => self.gpt_4o,
            SimpleModel::Gpt4oMini => self.gpt_4o_mini,
        }
    }
}

/// Budget left after the committed context and the input buffer
///
/// Negative means the next request would overflow the window.
pub fn remaining_tokens(budget: usize, context_tokens: usize, input_tokens: usize) -> i64 {
    budget as i64 - context_tokens as i64 - input_tokens as i64
}
