use crate::model::{ChainSummary, StrikeQuote};

/// Aggregate open-interest view of one chain snapshot.
pub fn summarize(spot: f64, strikes: &[StrikeQuote]) -> ChainSummary {
    let (total_call_oi, total_put_oi, total_call_volume, total_put_volume) = strikes.iter().fold(
        (0.0, 0.0, 0.0, 0.0),
        |(call_oi, put_oi, call_vol, put_vol), row| {
            (
                call_oi + row.call_oi,
                put_oi + row.put_oi,
                call_vol + row.call_volume,
                put_vol + row.put_volume,
            )
        },
    );

    let put_call_ratio = if total_call_oi > 0.0 {
        Some(total_put_oi / total_call_oi)
    } else {
        None
    };

    ChainSummary {
        total_call_oi,
        total_put_oi,
        total_call_volume,
        total_put_volume,
        put_call_ratio,
        atm_strike: atm_strike(spot, strikes),
        max_pain_strike: max_pain_strike(strikes),
    }
}

/// Listed strike closest to spot; ties go to the lower strike.
pub fn atm_strike(spot: f64, strikes: &[StrikeQuote]) -> Option<f64> {
    strikes
        .iter()
        .map(|row| row.strike)
        .min_by(|a, b| {
            let da = (a - spot).abs();
            let db = (b - spot).abs();
            da.total_cmp(&db).then(a.total_cmp(b))
        })
}

/// Strike at which expiring here would pay option holders the least.
pub fn max_pain_strike(strikes: &[StrikeQuote]) -> Option<f64> {
    if strikes.iter().all(|row| row.call_oi <= 0.0 && row.put_oi <= 0.0) {
        return None;
    }
    strikes
        .iter()
        .map(|settle| {
            let payout: f64 = strikes
                .iter()
                .map(|row| {
                    let call_intrinsic = (settle.strike - row.strike).max(0.0);
                    let put_intrinsic = (row.strike - settle.strike).max(0.0);
                    call_intrinsic * row.call_oi + put_intrinsic * row.put_oi
                })
                .sum();
            (settle.strike, payout)
        })
        .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.total_cmp(&b.0)))
        .map(|(strike, _)| strike)
}
