use rust_decimal::{Decimal, RoundingStrategy};

/// `round(amount * price * rate, 2 decimals, half-up via x100 rounding)`.
/// A pure function over (amount, price) and the configured rate — no store
/// access, no side effects.
pub fn calculate_commission(amount: u64, price: Decimal, rate: Decimal) -> Decimal {
    let raw = Decimal::from(amount) * price * rate;
    raw.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn exact_match_commission() {
        assert_eq!(calculate_commission(5, dec!(100.00), dec!(0.001)), dec!(0.50));
    }

    #[test]
    fn smaller_buyer_upsize_commission() {
        assert_eq!(calculate_commission(7, dec!(50.00), dec!(0.001)), dec!(0.35));
    }

    #[test]
    fn partial_fill_commission() {
        assert_eq!(calculate_commission(2, dec!(10.00), dec!(0.001)), dec!(0.02));
        assert_eq!(calculate_commission(1, dec!(9.50), dec!(0.001)), dec!(0.01));
    }

    #[test]
    fn rounds_half_up() {
        // 0.125 -> 0.13 under half-away-from-zero, not 0.12 (banker's rounding).
        assert_eq!(calculate_commission(125, dec!(1.00), dec!(0.001)), dec!(0.13));
    }
}
