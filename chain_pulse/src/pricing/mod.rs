//! Black-Scholes-Merton pricing for European options and the implied
//! volatility solver used when the feed omits IV.

use crate::model::OptionKind;
use once_cell::sync::Lazy;
use statrs::distribution::{Continuous, ContinuousCDF, Normal};

/// Floor for time to expiry in years (about 30 seconds).
pub const MIN_TIME_TO_EXPIRY: f64 = 1e-6;
pub const MIN_VOL: f64 = 0.01;
pub const MAX_VOL: f64 = 5.0;
pub const MAX_IV_ITERATIONS: usize = 100;
pub const IV_PRICE_TOLERANCE: f64 = 1e-8;
const IV_SEED: f64 = 0.3;

static STANDARD_NORMAL: Lazy<Normal> =
    Lazy::new(|| Normal::new(0.0, 1.0).expect("unit normal parameters are valid"));

pub fn norm_cdf(x: f64) -> f64 {
    STANDARD_NORMAL.cdf(x)
}

pub fn norm_pdf(x: f64) -> f64 {
    STANDARD_NORMAL.pdf(x)
}

pub fn clamp_time(time_years: f64) -> f64 {
    if time_years.is_finite() {
        time_years.max(MIN_TIME_TO_EXPIRY)
    } else {
        MIN_TIME_TO_EXPIRY
    }
}

/// d1 and d2 for already-validated inputs.
pub(crate) fn d1_d2(spot: f64, strike: f64, time: f64, rate: f64, vol: f64) -> (f64, f64) {
    let vol_sqrt_t = vol * time.sqrt();
    let d1 = ((spot / strike).ln() + (rate + 0.5 * vol * vol) * time) / vol_sqrt_t;
    (d1, d1 - vol_sqrt_t)
}

fn valid_underlying(spot: f64, strike: f64) -> bool {
    spot.is_finite() && strike.is_finite() && spot > 0.0 && strike > 0.0
}

/// Theoretical premium. Non-positive vol prices the discounted intrinsic
/// value; non-positive spot or strike prices to zero.
pub fn theoretical_price(
    spot: f64,
    strike: f64,
    time_years: f64,
    rate: f64,
    vol: f64,
    kind: OptionKind,
) -> f64 {
    if !valid_underlying(spot, strike) {
        return 0.0;
    }
    let time = clamp_time(time_years);
    let discount = (-rate * time).exp();
    if !(vol.is_finite() && vol > 0.0) {
        return match kind {
            OptionKind::Call => (spot - strike * discount).max(0.0),
            OptionKind::Put => (strike * discount - spot).max(0.0),
        };
    }
    let (d1, d2) = d1_d2(spot, strike, time, rate, vol);
    match kind {
        OptionKind::Call => spot * norm_cdf(d1) - strike * discount * norm_cdf(d2),
        OptionKind::Put => strike * discount * norm_cdf(-d2) - spot * norm_cdf(-d1),
    }
}

/// dPrice/dVol per unit of volatility (not per point).
fn raw_vega(spot: f64, strike: f64, time: f64, rate: f64, vol: f64) -> f64 {
    let (d1, _) = d1_d2(spot, strike, time, rate, vol);
    spot * norm_pdf(d1) * time.sqrt()
}

/// Solves for the volatility that reproduces `market_price`.
///
/// Newton-Raphson from a fixed seed, falling back to bisection whenever a
/// step leaves the current bracket or vega collapses. The result is always
/// inside `[MIN_VOL, MAX_VOL]`; prices outside the attainable range pin to
/// the nearest bound and non-convergence returns the bracket midpoint.
pub fn implied_vol(
    market_price: f64,
    spot: f64,
    strike: f64,
    time_years: f64,
    rate: f64,
    kind: OptionKind,
) -> f64 {
    if !valid_underlying(spot, strike) || !market_price.is_finite() {
        return MIN_VOL;
    }
    let time = clamp_time(time_years);
    let price_at = |vol: f64| theoretical_price(spot, strike, time, rate, vol, kind);

    let mut low = MIN_VOL;
    let mut high = MAX_VOL;
    if market_price <= price_at(low) {
        return low;
    }
    if market_price >= price_at(high) {
        return high;
    }

    let mut vol = IV_SEED;
    for _ in 0..MAX_IV_ITERATIONS {
        let diff = price_at(vol) - market_price;
        if diff.abs() < IV_PRICE_TOLERANCE {
            return vol;
        }
        // Price is increasing in vol, so the sign of diff tightens the bracket.
        if diff > 0.0 {
            high = vol;
        } else {
            low = vol;
        }

        let vega = raw_vega(spot, strike, time, rate, vol);
        let newton = if vega > 1e-12 { vol - diff / vega } else { f64::NAN };
        vol = if newton.is_finite() && newton > low && newton < high {
            newton
        } else {
            0.5 * (low + high)
        };

        if high - low < 1e-12 {
            break;
        }
    }
    0.5 * (low + high)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    #[test]
    fn normal_distribution_reference_values() {
        assert_approx_eq!(norm_cdf(0.0), 0.5, 1e-12);
        assert_approx_eq!(norm_cdf(1.96), 0.975, 1e-3);
        assert_approx_eq!(norm_pdf(0.0), 0.398_942_280_4, 1e-9);
    }

    #[test]
    fn atm_index_call_is_in_expected_band() {
        let premium = theoretical_price(24_600.0, 24_600.0, 7.0 / 365.0, 0.065, 0.15, OptionKind::Call);
        assert!(premium > 150.0 && premium < 350.0, "premium {premium}");
    }

    #[rstest]
    #[case(24_600.0, 24_000.0)]
    #[case(24_600.0, 24_600.0)]
    #[case(24_600.0, 25_200.0)]
    fn put_call_parity_holds(#[case] spot: f64, #[case] strike: f64) {
        let t = 30.0 / 365.0;
        let r = 0.065;
        let call = theoretical_price(spot, strike, t, r, 0.18, OptionKind::Call);
        let put = theoretical_price(spot, strike, t, r, 0.18, OptionKind::Put);
        assert_approx_eq!(call - put, spot - strike * (-r * t).exp(), 1e-6);
    }

    #[test]
    fn degenerate_inputs_do_not_produce_nan() {
        let expired = theoretical_price(110.0, 100.0, 0.0, 0.05, 0.2, OptionKind::Call);
        assert!(expired.is_finite());
        assert_approx_eq!(expired, 10.0, 1e-3);
        assert_eq!(theoretical_price(0.0, 100.0, 0.1, 0.05, 0.2, OptionKind::Call), 0.0);
        let zero_vol = theoretical_price(90.0, 100.0, 0.5, 0.0, 0.0, OptionKind::Put);
        assert_approx_eq!(zero_vol, 10.0, 1e-12);
    }

    #[test]
    fn implied_vol_pins_unreachable_prices_to_bounds() {
        assert_eq!(implied_vol(0.0, 100.0, 100.0, 0.1, 0.05, OptionKind::Call), MIN_VOL);
        assert_eq!(implied_vol(1_000.0, 100.0, 100.0, 0.1, 0.05, OptionKind::Call), MAX_VOL);
        assert_eq!(implied_vol(5.0, -1.0, 100.0, 0.1, 0.05, OptionKind::Call), MIN_VOL);
    }

    #[rstest]
    #[case(OptionKind::Call, 24_600.0, 24_800.0, 0.12)]
    #[case(OptionKind::Put, 24_600.0, 24_300.0, 0.21)]
    #[case(OptionKind::Call, 1_450.0, 1_400.0, 0.35)]
    fn implied_vol_recovers_generating_vol(
        #[case] kind: OptionKind,
        #[case] spot: f64,
        #[case] strike: f64,
        #[case] vol: f64,
    ) {
        let t = 10.0 / 365.0;
        let price = theoretical_price(spot, strike, t, 0.065, vol, kind);
        let solved = implied_vol(price, spot, strike, t, 0.065, kind);
        assert_approx_eq!(solved, vol, 1e-4);
    }

    proptest! {
        #[test]
        fn price_strictly_increases_with_vol(
            spot in 50.0f64..50_000.0,
            moneyness in 0.9f64..1.1,
            days in 14.0f64..365.0,
            vol in 0.1f64..1.5,
            bump in 0.01f64..0.5,
            is_call in any::<bool>(),
        ) {
            let kind = if is_call { OptionKind::Call } else { OptionKind::Put };
            let strike = spot * moneyness;
            let t = days / 365.0;
            let lower = theoretical_price(spot, strike, t, 0.05, vol, kind);
            let higher = theoretical_price(spot, strike, t, 0.05, vol + bump, kind);
            prop_assert!(higher > lower);
        }

        #[test]
        fn implied_vol_round_trips(
            spot in 100.0f64..30_000.0,
            moneyness in 0.95f64..1.05,
            days in 10.0f64..180.0,
            vol in 0.1f64..1.0,
            is_call in any::<bool>(),
        ) {
            let kind = if is_call { OptionKind::Call } else { OptionKind::Put };
            let strike = spot * moneyness;
            let t = days / 365.0;
            let price = theoretical_price(spot, strike, t, 0.05, vol, kind);
            let solved = implied_vol(price, spot, strike, t, 0.05, kind);
            prop_assert!((solved - vol).abs() < 1e-3, "solved {} vs {}", solved, vol);
        }
    }
}
