//! Margin arithmetic and its inverses.
//!
//! Revenue is `price + shipping`. The marketplace keeps `fee%` of revenue,
//! the seller keeps the rest and pays `cost`:
//!
//! ```text
//! profit  = revenue * (1 - fee/100) - cost
//! margin% = profit / revenue * 100
//! ```
//!
//! The inverses solve for the price; results are not rounded here so that
//! `margin_percent(price_for_margin(m)) == m` up to float error.

/// Profit amount at `price`.
#[inline]
pub fn profit_amount(price: f64, shipping: f64, cost: f64, fee_percent: f64) -> f64 {
    (price + shipping) * (1.0 - fee_percent / 100.0) - cost
}

/// Margin percentage at `price`. `None` when there is no revenue.
pub fn margin_percent(price: f64, shipping: f64, cost: f64, fee_percent: f64) -> Option<f64> {
    let revenue = price + shipping;
    if revenue <= 0.0 {
        return None;
    }
    Some(profit_amount(price, shipping, cost, fee_percent) / revenue * 100.0)
}

/// Price whose margin is exactly `margin`. `None` if fee and margin
/// together consume the whole revenue.
pub fn price_for_margin(margin: f64, shipping: f64, cost: f64, fee_percent: f64) -> Option<f64> {
    let keep = 1.0 - (fee_percent + margin) / 100.0;
    if keep <= 0.0 {
        return None;
    }
    Some(cost / keep - shipping)
}

/// Price whose profit amount is exactly `profit`.
pub fn price_for_profit(profit: f64, shipping: f64, cost: f64, fee_percent: f64) -> Option<f64> {
    let keep = 1.0 - fee_percent / 100.0;
    if keep <= 0.0 {
        return None;
    }
    Some((cost + profit) / keep - shipping)
}

/// Whether `margin` lies inside the optional bounds (a missing bound is open).
pub fn within_bounds(margin: f64, min: Option<f64>, max: Option<f64>) -> bool {
    min.map_or(true, |lo| margin >= lo) && max.map_or(true, |hi| margin <= hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_margin_of_known_price() {
        // revenue 100, fee 15% -> 85 kept, cost 50 -> profit 35
        assert!((profit_amount(95.0, 5.0, 50.0, 15.0) - 35.0).abs() < 1e-9);
        assert!((margin_percent(95.0, 5.0, 50.0, 15.0).unwrap() - 35.0).abs() < 1e-9);
        assert_eq!(margin_percent(0.0, 0.0, 50.0, 15.0), None);
    }

    #[test]
    fn test_margin_round_trip() {
        let cost = 40.0;
        for &fee in &[0.0, 7.0, 15.0, 22.5, 30.0] {
            for &shipping in &[0.0, 2.99, 5.0, 12.5] {
                for &price in &[45.0, 60.0, 87.07, 150.0, 499.99] {
                    let m = margin_percent(price, shipping, cost, fee).unwrap();
                    let back = price_for_margin(m, shipping, cost, fee).unwrap();
                    let m2 = margin_percent(back, shipping, cost, fee).unwrap();
                    assert!((m - m2).abs() < 0.01, "fee={} ship={} price={}", fee, shipping, price);
                }
            }
        }
    }

    #[test]
    fn test_price_for_profit() {
        let price = price_for_profit(10.0, 5.0, 50.0, 20.0).unwrap();
        assert!((profit_amount(price, 5.0, 50.0, 20.0) - 10.0).abs() < 1e-9);
        assert_eq!(price_for_profit(10.0, 0.0, 50.0, 100.0), None);
    }

    #[test]
    fn test_impossible_margin() {
        assert_eq!(price_for_margin(90.0, 0.0, 10.0, 15.0), None);
    }

    #[test]
    fn test_within_bounds() {
        assert!(within_bounds(12.0, Some(10.0), Some(20.0)));
        assert!(!within_bounds(9.0, Some(10.0), Some(20.0)));
        assert!(within_bounds(90.0, Some(10.0), None));
        assert!(within_bounds(-5.0, None, None));
    }
}
