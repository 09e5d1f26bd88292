//! Size alignment.
//!
//! A hedged trade must be placed for the same coin quantity on both
//! venues, so the target notional is reduced to an integer multiple of the
//! larger of the two venues' lot sizes. Rounding is always toward zero:
//! the aligned size may undershoot the request but never exceeds it.

use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignedSize {
    /// Coin quantity tradable on both venues
    pub coins: Decimal,
    /// Back-computed notional at the reference price
    pub usd: Decimal,
}

/// Reduce `target_usd` at `reference_price` to a quantity aligned to
/// `max(lot_a, lot_b)`. Returns `None` when the inputs cannot produce a
/// positive quantity.
pub fn align_common_quantity(
    target_usd: Decimal,
    reference_price: Decimal,
    lot_a: Decimal,
    lot_b: Decimal,
) -> Option<AlignedSize> {
    if reference_price <= Decimal::ZERO || target_usd <= Decimal::ZERO {
        return None;
    }

    let raw_coins = target_usd / reference_price;
    let step = lot_a.max(lot_b);
    if step <= Decimal::ZERO {
        return Some(AlignedSize {
            coins: raw_coins,
            usd: target_usd,
        });
    }

    let steps = (raw_coins / step).floor();
    let coins = (steps * step).normalize();
    if coins <= Decimal::ZERO {
        return None;
    }

    Some(AlignedSize {
        coins,
        usd: (coins * reference_price).normalize(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn aligns_to_larger_lot_size() {
        // $1000 at $50k = 0.02 coins; already a multiple of 0.001.
        let aligned =
            align_common_quantity(dec!(1000), dec!(50000), dec!(0.0001), dec!(0.001)).unwrap();
        assert_eq!(aligned.coins, dec!(0.02));
        assert_eq!(aligned.usd, dec!(1000));
    }

    #[test]
    fn rounds_toward_zero_never_up() {
        // $1005 at $50k = 0.0201 coins -> floor to 0.02 with lot 0.001.
        let aligned =
            align_common_quantity(dec!(1005), dec!(50000), dec!(0.0001), dec!(0.001)).unwrap();
        assert_eq!(aligned.coins, dec!(0.02));
        assert!(aligned.usd <= dec!(1005));
    }

    #[test]
    fn result_is_always_step_multiple() {
        let step = dec!(0.001);
        for usd in [dec!(17), dec!(333.33), dec!(9999.99)] {
            let aligned = align_common_quantity(usd, dec!(1234.56), dec!(0.0001), step).unwrap();
            assert_eq!(aligned.coins % step, Decimal::ZERO, "usd={usd}");
        }
    }

    #[test]
    fn decimal_precision_avoids_float_drift() {
        // 0.1 + 0.2 style drift must not produce a non-multiple quantity.
        let aligned = align_common_quantity(dec!(30), dec!(100), dec!(0.1), dec!(0.1)).unwrap();
        assert_eq!(aligned.coins, dec!(0.3));
        assert_eq!(aligned.usd, dec!(30));
    }

    #[test]
    fn too_small_target_yields_none() {
        assert!(align_common_quantity(dec!(1), dec!(50000), dec!(0.001), dec!(0.001)).is_none());
    }

    #[test]
    fn invalid_inputs_yield_none() {
        assert!(align_common_quantity(dec!(100), dec!(0), dec!(0.001), dec!(0.001)).is_none());
        assert!(align_common_quantity(dec!(0), dec!(100), dec!(0.001), dec!(0.001)).is_none());
    }

    #[test]
    fn zero_steps_pass_through_raw_quantity() {
        let aligned = align_common_quantity(dec!(100), dec!(50), dec!(0), dec!(0)).unwrap();
        assert_eq!(aligned.coins, dec!(2));
    }
}
