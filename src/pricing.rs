// Pricing calculations for upstream API usage
//
// One canonical table, USD per 1K tokens, covering the OpenAI and Anthropic
// model families the gateway routes. Unknown models cost zero rather than
// guessing. Bump PRICING_VERSION whenever a figure changes so stored
// telemetry can be interpreted against the table that produced it.

/// Version tag for the pricing table below
pub const PRICING_VERSION: &str = "2024-03";

/// Pricing for a specific model, USD per 1K tokens
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// Look up pricing for a model. Returns None for unknown models.
pub fn get_pricing(model: &str) -> Option<ModelPricing> {
    let (input, output) = match model {
        // OpenAI models
        "gpt-4" => (0.03, 0.06),
        "gpt-4-0613" => (0.03, 0.06),
        "gpt-4-32k" => (0.06, 0.12),
        "gpt-4-turbo" => (0.01, 0.03),
        "gpt-4-turbo-preview" => (0.01, 0.03),
        "gpt-3.5-turbo" => (0.0015, 0.002),
        "gpt-3.5-turbo-0613" => (0.0015, 0.002),
        "gpt-3.5-turbo-16k" => (0.003, 0.004),

        // Claude models
        "claude-3-opus-20240229" => (0.015, 0.075),
        "claude-3-sonnet-20240229" => (0.003, 0.015),
        "claude-3-haiku-20240307" => (0.00025, 0.00125),
        "claude-2.1" => (0.008, 0.024),
        "claude-2.0" => (0.008, 0.024),

        _ => return None,
    };

    Some(ModelPricing {
        input_per_1k: input,
        output_per_1k: output,
    })
}

/// Calculate cost in USD for the given token usage
///
/// Zero for unknown models. Rounded to 6 decimal places, which is finer
/// than any per-1K price in the table.
pub fn calculate_cost(model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
    let Some(pricing) = get_pricing(model) else {
        return 0.0;
    };

    let input_cost = (prompt_tokens as f64 / 1000.0) * pricing.input_per_1k;
    let output_cost = (completion_tokens as f64 / 1000.0) * pricing.output_per_1k;

    round6(input_cost + output_cost)
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpt35_pricing() {
        let pricing = get_pricing("gpt-3.5-turbo").unwrap();
        assert_eq!(pricing.input_per_1k, 0.0015);
        assert_eq!(pricing.output_per_1k, 0.002);
    }

    #[test]
    fn test_calculate_cost_small_call() {
        // 2 prompt + 1 completion tokens on gpt-3.5-turbo:
        // 2/1000 * 0.0015 + 1/1000 * 0.002 = 0.000005
        let cost = calculate_cost("gpt-3.5-turbo", 2, 1);
        assert!((cost - 0.000005).abs() < 1e-9);
    }

    #[test]
    fn test_calculate_cost_opus() {
        // 1000 input + 500 output on Opus: 0.015 + 0.0375 = 0.0525
        let cost = calculate_cost("claude-3-opus-20240229", 1000, 500);
        assert!((cost - 0.0525).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_is_free() {
        assert_eq!(calculate_cost("llama-70b-local", 10_000, 10_000), 0.0);
        assert!(get_pricing("llama-70b-local").is_none());
    }
}
