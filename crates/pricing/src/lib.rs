//! Cart pricing: line normalization and order totals.
//!
//! Raw cart lines come straight from the checkout UI and may be partial or
//! malformed. Nothing here rejects a line; every field is coerced into a valid
//! value instead:
//!
//! - `price` is rounded to two fraction digits, negative or unparsable values become `0.00`;
//! - `quantity` is truncated to an integer no less than `1`;
//! - `lineTotal = round2(price * quantity)`.
//!
//! The order total is the sum of the already-rounded line totals, so it always
//! matches what gets persisted per line.

use std::str::FromStr;

use model::{CartLine, NormalizedLine};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde_json::Value;
use thiserror::Error;

/// Largest unit price a line may carry; larger prices are clamped.
pub const MAX_UNIT_PRICE: Decimal = dec!(999999999.99);

/// Largest quantity a line may carry; larger quantities are clamped.
pub const MAX_QUANTITY: i32 = 1_000_000;

/// Largest grand total an order may reach. Keeps totals within `NUMERIC(20,2)`
/// and exactly representable as a JSON number.
pub const MAX_ORDER_TOTAL: Decimal = dec!(9999999999999.99);

/// Name given to lines that arrive without one.
pub const DEFAULT_ITEM_NAME: &str = "Item";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PricingError {
    /// An order needs at least one line.
    #[error("order has no items")]
    EmptyOrder,
    /// The lines add up to more than [`MAX_ORDER_TOTAL`].
    #[error("order total {0} exceeds the maximum order total")]
    TotalOutOfRange(Decimal),
}

/// Normalized lines plus their grand total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricedCart {
    pub lines: Vec<NormalizedLine>,
    pub total: Decimal,
}

/// Rounds half away from zero to exactly two fraction digits.
pub fn round_money(amount: Decimal) -> Decimal {
    let mut rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(2);
    rounded
}

/// Coerces a raw cart line into a valid (price, quantity) pair.
pub fn normalize_line(line: &CartLine) -> NormalizedLine {
    let price = normalize_price(&line.price);
    let quantity = normalize_quantity(&line.quantity);
    NormalizedLine {
        product_id: normalize_product_id(&line.product_id),
        name: normalize_name(&line.name),
        price,
        quantity,
        line_total: round_money(price * Decimal::from(quantity)),
    }
}

/// Sums line totals into an order total.
///
/// # Errors
/// Returns [`PricingError::EmptyOrder`] when `lines` is empty and
/// [`PricingError::TotalOutOfRange`] when the sum exceeds [`MAX_ORDER_TOTAL`].
pub fn order_total(lines: &[NormalizedLine]) -> Result<Decimal, PricingError> {
    if lines.is_empty() {
        return Err(PricingError::EmptyOrder);
    }
    // Each line is at most 1e15, so the running sum cannot leave Decimal range.
    let sum: Decimal = lines.iter().map(|line| line.line_total).sum();
    let total = round_money(sum.max(Decimal::ZERO));
    if total > MAX_ORDER_TOTAL {
        return Err(PricingError::TotalOutOfRange(total));
    }
    Ok(total)
}

/// Normalizes every line and computes the total in one go.
///
/// # Errors
/// Same as [`order_total`].
pub fn price_cart(items: &[CartLine]) -> Result<PricedCart, PricingError> {
    let lines: Vec<NormalizedLine> = items.iter().map(normalize_line).collect();
    let total = order_total(&lines)?;
    Ok(PricedCart { lines, total })
}

fn normalize_price(value: &Value) -> Decimal {
    match to_number(value) {
        Some(price) if price > Decimal::ZERO => round_money(price.min(MAX_UNIT_PRICE)),
        _ => round_money(Decimal::ZERO),
    }
}

fn normalize_quantity(value: &Value) -> i32 {
    match to_number(value) {
        Some(quantity) if quantity >= Decimal::ONE => quantity
            .trunc()
            .to_i32()
            .map_or(MAX_QUANTITY, |q| q.min(MAX_QUANTITY)),
        _ => 1,
    }
}

fn normalize_product_id(value: &Value) -> Option<i64> {
    to_number(value)
        .map(|id| id.trunc())
        .filter(|id| *id > Decimal::ZERO)
        .and_then(|id| id.to_i64())
}

fn normalize_name(value: &Value) -> String {
    match value {
        Value::String(name) if !name.trim().is_empty() => name.clone(),
        Value::Number(n) => n.to_string(),
        _ => DEFAULT_ITEM_NAME.to_string(),
    }
}

/// Best-effort numeric reading of an untyped JSON value.
///
/// `None` means "not a number"; callers decide the fallback.
fn to_number(value: &Value) -> Option<Decimal> {
    match value {
        Value::Null => Some(Decimal::ZERO),
        Value::Bool(b) => Some(if *b { Decimal::ONE } else { Decimal::ZERO }),
        Value::Number(n) => parse_decimal(&n.to_string()).or_else(|| saturate(n.as_f64())),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                Some(Decimal::ZERO)
            } else if s.contains('_') {
                // `1_000` is not a number.
                None
            } else {
                parse_decimal(s).or_else(|| saturate(s.parse::<f64>().ok()))
            }
        }
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// Maps a finite float that `Decimal` cannot hold onto the nearest bound,
/// so the caps still apply to it.
fn saturate(value: Option<f64>) -> Option<Decimal> {
    let value = value.filter(|f| f.is_finite())?;
    Decimal::from_f64(value).or(Some(if value >= 1.0 {
        Decimal::MAX
    } else if value <= -1.0 {
        Decimal::MIN
    } else {
        Decimal::ZERO
    }))
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    if let Ok(number) = Decimal::from_str(s) {
        return Some(number);
    }
    // Exponents beyond Decimal's 28-digit range are left to `saturate`.
    let (_, exponent) = s.split_once(['e', 'E'])?;
    let exponent: i32 = exponent.trim_start_matches('+').parse().ok()?;
    if exponent.abs() > 28 {
        return None;
    }
    Decimal::from_scientific(s).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;
    use serde_json::json;

    fn line(price: Value, quantity: Value) -> CartLine {
        CartLine {
            product_id: Value::Null,
            name: json!("Thing"),
            price,
            quantity,
        }
    }

    #[rstest]
    #[case(json!(29.99), dec!(29.99))]
    #[case(json!(10), dec!(10.00))]
    #[case(json!("12.345"), dec!(12.35))]
    #[case(json!(" 4.5 "), dec!(4.50))]
    #[case(json!(0.005), dec!(0.01))]
    #[case(json!(-3), dec!(0.00))]
    #[case(json!("abc"), dec!(0.00))]
    #[case(json!(null), dec!(0.00))]
    #[case(json!([1, 2]), dec!(0.00))]
    #[case(json!(true), dec!(1.00))]
    #[case(json!("1e3"), dec!(1000.00))]
    #[case(json!(1e15), MAX_UNIT_PRICE)]
    #[case(json!(1e30), MAX_UNIT_PRICE)]
    #[case(json!("1e30"), MAX_UNIT_PRICE)]
    #[case(json!("12345678901234567890123456789012"), MAX_UNIT_PRICE)]
    #[case(json!("-1e30"), dec!(0.00))]
    #[case(json!("1_000"), dec!(0.00))]
    #[case(json!("inf"), dec!(0.00))]
    fn price_coercion(#[case] raw: Value, #[case] expected: Decimal) {
        let normalized = normalize_line(&line(raw, json!(1)));
        assert_eq!(normalized.price, expected);
        assert_eq!(normalized.price.scale(), 2);
    }

    #[rstest]
    #[case(json!(3), 3)]
    #[case(json!("2"), 2)]
    #[case(json!(2.7), 2)]
    #[case(json!(0.5), 1)]
    #[case(json!(0), 1)]
    #[case(json!(-4), 1)]
    #[case(json!("many"), 1)]
    #[case(json!(null), 1)]
    #[case(json!({}), 1)]
    #[case(json!(5_000_000_000_i64), MAX_QUANTITY)]
    #[case(json!(1e30), MAX_QUANTITY)]
    #[case(json!("1e30"), MAX_QUANTITY)]
    #[case(json!("12345678901234567890123456789012"), MAX_QUANTITY)]
    #[case(json!("1_000"), 1)]
    fn quantity_coercion(#[case] raw: Value, #[case] expected: i32) {
        assert_eq!(normalize_line(&line(json!(1), raw)).quantity, expected);
    }

    #[rstest]
    #[case(json!(12), Some(12))]
    #[case(json!("7"), Some(7))]
    #[case(json!(0), None)]
    #[case(json!(-1), None)]
    #[case(json!("sku-1"), None)]
    #[case(json!(null), None)]
    fn product_id_coercion(#[case] raw: Value, #[case] expected: Option<i64>) {
        let mut cart_line = line(json!(1), json!(1));
        cart_line.product_id = raw;
        assert_eq!(normalize_line(&cart_line).product_id, expected);
    }

    #[test]
    fn missing_name_defaults() {
        assert_eq!(normalize_line(&CartLine::default()).name, DEFAULT_ITEM_NAME);
        let mut blank = CartLine::default();
        blank.name = json!("   ");
        assert_eq!(normalize_line(&blank).name, DEFAULT_ITEM_NAME);
    }

    #[test]
    fn missing_fields_coerce_to_defaults() {
        let normalized = normalize_line(&CartLine::default());
        assert_eq!(normalized.price, dec!(0.00));
        assert_eq!(normalized.quantity, 1);
        assert_eq!(normalized.line_total, dec!(0.00));
        assert_eq!(normalized.product_id, None);
    }

    #[test]
    fn checkout_example_total() {
        let priced = price_cart(&[line(json!(29.99), json!(2)), line(json!(10.00), json!(1))]).unwrap();
        assert_eq!(priced.lines[0].line_total, dec!(59.98));
        assert_eq!(priced.total, dec!(69.98));
    }

    #[test]
    fn empty_order_is_rejected() {
        assert_eq!(order_total(&[]), Err(PricingError::EmptyOrder));
        assert_eq!(price_cart(&[]), Err(PricingError::EmptyOrder));
    }

    #[test]
    fn oversized_total_is_rejected() {
        let huge = normalize_line(&line(json!(MAX_UNIT_PRICE.to_string()), json!(MAX_QUANTITY)));
        assert_eq!(huge.line_total, dec!(999999999990000.00));
        assert_eq!(
            order_total(&[huge]),
            Err(PricingError::TotalOutOfRange(dec!(999999999990000.00)))
        );

        let large = normalize_line(&line(json!("999999999.99"), json!(10_000)));
        assert_eq!(order_total(&[large]), Ok(dec!(9999999999900.00)));
    }

    #[test]
    fn round_money_is_half_away_from_zero() {
        assert_eq!(round_money(dec!(1.005)), dec!(1.01));
        assert_eq!(round_money(dec!(1.004)), dec!(1.00));
        assert_eq!(round_money(dec!(-1.005)), dec!(-1.01));
    }

    fn raw_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            (-1.0e12f64..1.0e12f64).prop_map(|n| json!(n)),
            ".{0,12}".prop_map(Value::String),
            Just(json!([])),
            Just(json!({})),
        ]
    }

    fn normalized_line() -> impl Strategy<Value = NormalizedLine> {
        (0i64..100_000_000, 1i32..1_000).prop_map(|(cents, quantity)| {
            let price = Decimal::new(cents, 2);
            NormalizedLine {
                product_id: None,
                name: DEFAULT_ITEM_NAME.into(),
                price,
                quantity,
                line_total: round_money(price * Decimal::from(quantity)),
            }
        })
    }

    proptest! {
        #[test]
        fn normalizer_never_yields_invalid_lines(
            price in raw_value(),
            quantity in raw_value(),
            product_id in raw_value(),
            name in raw_value(),
        ) {
            let normalized = normalize_line(&CartLine { product_id, name, price, quantity });
            prop_assert!(normalized.price >= Decimal::ZERO);
            prop_assert!(normalized.price <= MAX_UNIT_PRICE);
            prop_assert_eq!(normalized.price.scale(), 2);
            prop_assert!(normalized.quantity >= 1);
            prop_assert!(normalized.quantity <= MAX_QUANTITY);
            prop_assert!(!normalized.name.is_empty());
            prop_assert_eq!(
                normalized.line_total,
                round_money(normalized.price * Decimal::from(normalized.quantity))
            );
        }

        #[test]
        fn total_is_sum_of_rounded_lines(lines in prop::collection::vec(normalized_line(), 1..20)) {
            let expected = round_money(lines.iter().map(|l| l.line_total).sum());
            let total = order_total(&lines).unwrap();
            prop_assert_eq!(total, expected);
            prop_assert!(total >= Decimal::ZERO);
        }
    }
}
