//! Per-token pricing for known models.

use rust_decimal::Decimal;

/// USD per input token and per output token.
///
/// Unknown models are priced like the mid tier.
pub fn model_cost(model: &str) -> (Decimal, Decimal) {
    if model.contains("haiku") {
        (Decimal::new(8, 7), Decimal::new(4, 6))
    } else if model.contains("opus") {
        (Decimal::new(15, 6), Decimal::new(75, 6))
    } else {
        (Decimal::new(3, 6), Decimal::new(15, 6))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_costs_more_than_input() {
        for model in ["claude-haiku-4-5", "claude-sonnet-4-5", "claude-opus-4-1", "other"] {
            let (input, output) = model_cost(model);
            assert!(output > input, "{model}");
        }
    }
}
