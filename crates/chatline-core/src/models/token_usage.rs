use serde::{Deserialize, Serialize};

/// Token usage for a single generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    /// Input tokens consumed
    pub input_tokens: u64,

    /// Output tokens generated
    pub output_tokens: u64,

    /// Estimated cost in USD (computed at persist time)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost_usd: Option<f64>,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            estimated_cost_usd: None,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Fold another usage record into this one (multi-round tool exchanges report per round).
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        if let Some(cost) = other.estimated_cost_usd {
            *self.estimated_cost_usd.get_or_insert(0.0) += cost;
        }
    }

    /// Calculate cost based on model pricing (cost per million tokens)
    pub fn calculate_cost(&mut self, cost_per_million_input: f64, cost_per_million_output: f64) {
        let input_cost = (self.input_tokens as f64 / 1_000_000.0) * cost_per_million_input;
        let output_cost = (self.output_tokens as f64 / 1_000_000.0) * cost_per_million_output;
        self.estimated_cost_usd = Some(input_cost + output_cost);
    }
}
