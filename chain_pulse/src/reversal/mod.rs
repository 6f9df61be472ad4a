use crate::model::{
    GreekContributions, GreekWeights, GreeksSet, InstrumentClass, ReversalBreakdown,
    ReversalPoint,
};
use rust_decimal::prelude::*;

const DAYS_EPSILON: f64 = 1e-6;
const RAW_ADJUSTMENT_SCALE: f64 = 5.0;
const VOL_SENSITIVITY_PIVOT: f64 = 30.0;
const INDEX_SHIFT_CAP: f64 = 150.0;
const INDEX_SHIFT_FACTOR: f64 = 0.03;
const STOCK_SHIFT_CAP: f64 = 20.0;
const STOCK_SHIFT_FACTOR: f64 = 0.05;
const MAX_CONFIDENCE: u8 = 99;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReversalInputs {
    pub strike: f64,
    pub call_greeks: GreeksSet,
    pub put_greeks: GreeksSet,
    /// Change in implied vol since the baseline, percent points.
    pub iv_change: f64,
    pub days_to_expiry: f64,
    pub spot_change: f64,
    pub current_call_price: f64,
    pub current_put_price: f64,
    pub theoretical_call_price: f64,
    pub theoretical_put_price: f64,
    pub instrument_class: InstrumentClass,
    /// Current implied vol, percent points.
    pub current_iv: f64,
}

pub fn reversal_point(inputs: &ReversalInputs) -> ReversalPoint {
    let net = inputs.call_greeks.net(&inputs.put_greeks);

    let abs_sum = net.abs_sum();
    let divisor = if abs_sum == 0.0 { 1.0 } else { abs_sum };
    let weights = GreekWeights {
        delta: net.delta.abs() / divisor,
        gamma: net.gamma.abs() / divisor,
        vega: net.vega.abs() / divisor,
        theta: net.theta.abs() / divisor,
    };

    let contributions = GreekContributions {
        delta: weights.delta * net.delta,
        gamma: weights.gamma * 0.5 * net.gamma * inputs.spot_change.powi(2),
        vega: weights.vega * net.vega * inputs.iv_change,
        theta: weights.theta * net.theta,
    };
    let raw_adjustment = contributions.total();

    let time_sensitivity = 1.0 / (1.0 + 1.0 / (inputs.days_to_expiry + DAYS_EPSILON));
    let vol_sensitivity = (inputs.current_iv / VOL_SENSITIVITY_PIVOT).min(1.0);
    let normalized_adjustment =
        (raw_adjustment / RAW_ADJUSTMENT_SCALE).tanh() * time_sensitivity * vol_sensitivity;

    let max_dynamic_shift = max_dynamic_shift(
        inputs.strike,
        inputs.current_iv,
        inputs.instrument_class,
    );
    let scaled_adjustment = normalized_adjustment * max_dynamic_shift;

    let price_weight = (inputs.current_call_price - inputs.theoretical_call_price)
        + (inputs.current_put_price - inputs.theoretical_put_price);

    let predicted_reversal_price =
        round_half_even(inputs.strike + scaled_adjustment + price_weight, 2);

    let mean_abs = abs_sum / 4.0;
    let confidence = round_half_even((mean_abs / 2.0).tanh() * 100.0, 0);
    // tanh stays below 1, rounding alone could still reach 100.
    let confidence_score = confidence.clamp(0.0, MAX_CONFIDENCE as f64) as u8;

    ReversalPoint {
        strike: inputs.strike,
        predicted_reversal_price,
        confidence_score,
        breakdown: ReversalBreakdown {
            net_greeks: net,
            weights,
            contributions,
            raw_adjustment,
            time_sensitivity,
            vol_sensitivity,
            normalized_adjustment,
            max_dynamic_shift,
            scaled_adjustment,
            price_weight,
        },
    }
}

pub fn max_dynamic_shift(strike: f64, current_iv: f64, class: InstrumentClass) -> f64 {
    let iv_fraction = current_iv / 100.0;
    match class {
        InstrumentClass::Index => INDEX_SHIFT_CAP.min(strike * iv_fraction * INDEX_SHIFT_FACTOR),
        InstrumentClass::Stock => STOCK_SHIFT_CAP.min(strike * iv_fraction * STOCK_SHIFT_FACTOR),
    }
}

/// Banker's rounding of the exact binary value, so 2.675 (stored as
/// 2.67499..) goes down. Non-finite values pass through.
fn round_half_even(value: f64, dp: u32) -> f64 {
    Decimal::from_f64_retain(value)
        .map(|d| d.round_dp(dp))
        .and_then(|d| d.to_f64())
        .unwrap_or(value)
}
