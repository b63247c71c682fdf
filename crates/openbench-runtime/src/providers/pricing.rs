//! Static price table for remote models.
//!
//! Prices are USD per 1,000 tokens. Unknown models have no price; callers
//! record a null cost rather than an error.

use serde::{Deserialize, Serialize};

/// Input and output price per 1,000 tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// Cost of one call in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cost {
    pub input: f64,
    pub output: f64,
    pub total: f64,
}

/// Look up the price of a model by exact identifier.
pub fn price_for(model: &str) -> Option<ModelPrice> {
    let (input_per_1k, output_per_1k) = match model {
        "gpt-4" => (0.03, 0.06),
        "gpt-4-turbo-preview" => (0.01, 0.03),
        "gpt-3.5-turbo" => (0.0015, 0.002),
        "claude-3-opus-20240229" => (0.015, 0.075),
        "claude-3-sonnet-20240229" => (0.003, 0.015),
        "claude-3-haiku-20240307" => (0.00025, 0.00125),
        "gemini-pro" => (0.0005, 0.0015),
        "mistralai/Mixtral-8x7B-Instruct-v0.1" => (0.0006, 0.0006),
        _ => return None,
    };
    Some(ModelPrice {
        input_per_1k,
        output_per_1k,
    })
}

/// Cost of a call, or `None` for unpriced models.
pub fn cost_for(model: &str, input_tokens: u32, output_tokens: u32) -> Option<Cost> {
    let price = price_for(model)?;
    let input = f64::from(input_tokens) / 1000.0 * price.input_per_1k;
    let output = f64::from(output_tokens) / 1000.0 * price.output_per_1k;
    Some(Cost {
        input,
        output,
        total: input + output,
    })
}
