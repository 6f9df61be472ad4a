use crate::model::{GreeksSet, OptionKind};
use crate::pricing::{clamp_time, d1_d2, norm_cdf, norm_pdf};

const DAYS_PER_YEAR: f64 = 365.0;

/// Closed-form Black-Scholes sensitivities for one leg.
///
/// Vega is per volatility point and theta per calendar day. Non-positive or
/// non-finite spot, strike or vol yields [`GreeksSet::zero`].
pub fn greeks(
    spot: f64,
    strike: f64,
    time_years: f64,
    rate: f64,
    vol: f64,
    kind: OptionKind,
) -> GreeksSet {
    let usable = [spot, strike, vol].iter().all(|v| v.is_finite() && *v > 0.0);
    if !usable || !rate.is_finite() {
        return GreeksSet::zero();
    }
    let time = clamp_time(time_years);
    let sqrt_t = time.sqrt();
    let (d1, d2) = d1_d2(spot, strike, time, rate, vol);
    let pdf_d1 = norm_pdf(d1);
    let discount = (-rate * time).exp();

    let gamma = pdf_d1 / (spot * vol * sqrt_t);
    let vega = spot * pdf_d1 * sqrt_t / 100.0;
    let decay = -spot * pdf_d1 * vol / (2.0 * sqrt_t);

    let (delta, theta_year) = match kind {
        OptionKind::Call => (
            norm_cdf(d1),
            decay - rate * strike * discount * norm_cdf(d2),
        ),
        OptionKind::Put => (
            norm_cdf(d1) - 1.0,
            decay + rate * strike * discount * norm_cdf(-d2),
        ),
    };

    let set = GreeksSet {
        delta,
        gamma,
        vega,
        theta: theta_year / DAYS_PER_YEAR,
    };
    if [set.delta, set.gamma, set.vega, set.theta]
        .iter()
        .all(|v| v.is_finite())
    {
        set
    } else {
        GreeksSet::zero()
    }
}
