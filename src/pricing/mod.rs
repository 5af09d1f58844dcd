//! Per-model token prices and cost calculation.
//!
//! Costs are integer microcents (1/10000 of a cent, so one US dollar is
//! 1_000_000 microcents). Prices are held per one million tokens to keep the
//! arithmetic in integers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Name of the price entry used for models with no entry of their own.
pub const DEFAULT_MODEL: &str = "default";

/// Pricing information for a specific model.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelPricing {
    /// Cost per 1M input tokens in microcents
    pub input_per_1m_tokens: i64,

    /// Cost per 1M output tokens in microcents
    pub output_per_1m_tokens: i64,
}

impl ModelPricing {
    /// Create pricing from dollars per token.
    ///
    /// Example: $0.000002/token = $2/1M tokens = 2_000_000 microcents/1M
    pub fn from_dollars_per_token(input: f64, output: f64) -> Self {
        // $/token * 1_000_000 tokens * 1_000_000 microcents/$
        Self {
            input_per_1m_tokens: (input * 1_000_000_000_000.0).round() as i64,
            output_per_1m_tokens: (output * 1_000_000_000_000.0).round() as i64,
        }
    }

    /// Cost in microcents of the given token counts.
    ///
    /// Uses `i128` intermediates and saturates at `i64::MAX`.
    pub fn cost(&self, input_tokens: i64, output_tokens: i64) -> i64 {
        let input = (input_tokens as i128 * self.input_per_1m_tokens as i128) / 1_000_000;
        let output = (output_tokens as i128 * self.output_per_1m_tokens as i128) / 1_000_000;
        saturate_to_i64(input + output)
    }
}

/// A price override in the `[pricing.models]` configuration section.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ModelPriceUsd {
    /// USD per input token.
    pub input_usd_per_token: f64,
    /// USD per output token.
    pub output_usd_per_token: f64,
}

/// Price overrides from configuration, keyed by model name.
///
/// ```toml
/// [pricing.models.gpt-4]
/// input_usd_per_token = 0.00003
/// output_usd_per_token = 0.00006
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PricingConfig {
    #[serde(default)]
    pub models: HashMap<String, ModelPriceUsd>,
}

impl PricingConfig {
    pub fn validate(&self) -> Result<(), String> {
        for (model, price) in &self.models {
            let valid = |v: f64| v.is_finite() && v >= 0.0;
            if !valid(price.input_usd_per_token) || !valid(price.output_usd_per_token) {
                return Err(format!(
                    "pricing.models.{model}: prices must be non-negative numbers"
                ));
            }
        }
        Ok(())
    }
}

/// Built-in prices in USD per token: (model, input, output).
const BUILTIN_PRICES: &[(&str, f64, f64)] = &[
    ("gpt-4", 0.000_03, 0.000_06),
    ("gpt-3.5-turbo", 0.000_001_5, 0.000_002),
    ("claude-3-opus", 0.000_015, 0.000_075),
    ("claude-3-sonnet", 0.000_003, 0.000_015),
    ("qwen-2.5-coder", 0.000_001, 0.000_002),
    ("codellama-34b", 0.000_000_8, 0.000_001_6),
    (DEFAULT_MODEL, 0.000_001, 0.000_002),
];

/// Resolved price table: built-in prices with configuration overrides applied.
#[derive(Debug, Clone)]
pub struct PricingTable {
    prices: HashMap<String, ModelPricing>,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::from_config(&PricingConfig::default())
    }
}

impl PricingTable {
    pub fn from_config(config: &PricingConfig) -> Self {
        let mut prices: HashMap<String, ModelPricing> = BUILTIN_PRICES
            .iter()
            .map(|(model, input, output)| {
                (
                    model.to_string(),
                    ModelPricing::from_dollars_per_token(*input, *output),
                )
            })
            .collect();

        for (model, price) in &config.models {
            prices.insert(
                model.clone(),
                ModelPricing::from_dollars_per_token(
                    price.input_usd_per_token,
                    price.output_usd_per_token,
                ),
            );
        }

        Self { prices }
    }

    /// Pricing for `model`, falling back to the `default` entry.
    pub fn get(&self, model: &str) -> ModelPricing {
        self.prices
            .get(model)
            .or_else(|| self.prices.get(DEFAULT_MODEL))
            .copied()
            .unwrap_or_default()
    }

    /// Calculate cost in microcents for the given token usage.
    pub fn calculate_cost(&self, model: &str, input_tokens: i64, output_tokens: i64) -> i64 {
        self.get(model).cost(input_tokens, output_tokens)
    }

    /// Estimated cost of a request that has not run yet.
    ///
    /// Half the tokens are priced as input and the remainder as output.
    pub fn estimate_cost(&self, model: &str, tokens: i64) -> i64 {
        let input = tokens / 2;
        self.calculate_cost(model, input, tokens - input)
    }
}

/// Convert dollars to microcents
pub fn dollars_to_microcents(dollars: f64) -> i64 {
    (dollars * 1_000_000.0).round() as i64
}

/// Convert microcents to dollars
pub fn microcents_to_dollars(microcents: i64) -> f64 {
    microcents as f64 / 1_000_000.0
}

fn saturate_to_i64(value: i128) -> i64 {
    if value > i64::MAX as i128 {
        i64::MAX
    } else if value < i64::MIN as i128 {
        i64::MIN
    } else {
        value as i64
    }
}
