use crate::model::{AnalyticsFrame, StrikeAnalytics};
use anyhow::Result;
use comfy_table::{presets::UTF8_BORDERS_ONLY, Cell, Table};
use csv::Writer;
use std::fs::File;
use std::path::Path;
use tracing::info;

/// Prints strikes around the ATM strike; `limit` caps the row count.
pub fn print_frame(frame: &AnalyticsFrame, limit: usize) -> Result<()> {
    let summary = &frame.summary;
    println!(
        "{} exp {} | spot {:.2} | PCR {} | ATM {} | max pain {} | as of {}",
        frame.symbol,
        format_expiry(frame.expiry),
        frame.spot,
        format_opt(summary.put_call_ratio, 3),
        format_opt(summary.atm_strike, 0),
        format_opt(summary.max_pain_strike, 0),
        frame.snapshot_timestamp.format("%Y-%m-%d %H:%M:%S"),
    );

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec![
        "Call OI",
        "Call IV",
        "Call LTP",
        "Call Theo",
        "Call Δ",
        "Strike",
        "Put Δ",
        "Put Theo",
        "Put LTP",
        "Put IV",
        "Put OI",
        "Reversal",
        "Conf",
    ]);

    for row in window(frame, limit) {
        table.add_row(vec![
            Cell::new(format!("{:.0}", row.call_oi)),
            Cell::new(format!("{:.2}", row.call_iv)),
            Cell::new(format!("{:.2}", row.call_price)),
            Cell::new(format!("{:.2}", row.call_theoretical)),
            Cell::new(format!("{:.3}", row.call_greeks.delta)),
            Cell::new(format!("{:.0}", row.strike)),
            Cell::new(format!("{:.3}", row.put_greeks.delta)),
            Cell::new(format!("{:.2}", row.put_theoretical)),
            Cell::new(format!("{:.2}", row.put_price)),
            Cell::new(format!("{:.2}", row.put_iv)),
            Cell::new(format!("{:.0}", row.put_oi)),
            Cell::new(format!("{:.2}", row.reversal.predicted_reversal_price)),
            Cell::new(row.reversal.confidence_score.to_string()),
        ]);
    }

    println!("{}", table);
    Ok(())
}

pub fn export_csv<P: AsRef<Path>>(frame: &AnalyticsFrame, path: P) -> Result<()> {
    let path = path.as_ref();
    let mut writer = Writer::from_writer(File::create(path)?);
    writer.write_record([
        "symbol",
        "expiry",
        "spot",
        "strike",
        "call_price",
        "call_iv",
        "call_theoretical",
        "call_delta",
        "call_gamma",
        "call_vega",
        "call_theta",
        "put_price",
        "put_iv",
        "put_theoretical",
        "put_delta",
        "put_gamma",
        "put_vega",
        "put_theta",
        "call_oi",
        "put_oi",
        "predicted_reversal_price",
        "confidence_score",
        "price_weight",
        "scaled_adjustment",
    ])?;
    for row in &frame.strikes {
        let record = vec![
            frame.symbol.clone(),
            frame.expiry.to_string(),
            frame.spot.to_string(),
            row.strike.to_string(),
            row.call_price.to_string(),
            row.call_iv.to_string(),
            row.call_theoretical.to_string(),
            row.call_greeks.delta.to_string(),
            row.call_greeks.gamma.to_string(),
            row.call_greeks.vega.to_string(),
            row.call_greeks.theta.to_string(),
            row.put_price.to_string(),
            row.put_iv.to_string(),
            row.put_theoretical.to_string(),
            row.put_greeks.delta.to_string(),
            row.put_greeks.gamma.to_string(),
            row.put_greeks.vega.to_string(),
            row.put_greeks.theta.to_string(),
            row.call_oi.to_string(),
            row.put_oi.to_string(),
            row.reversal.predicted_reversal_price.to_string(),
            row.reversal.confidence_score.to_string(),
            row.reversal.breakdown.price_weight.to_string(),
            row.reversal.breakdown.scaled_adjustment.to_string(),
        ];
        writer.write_record(record)?;
    }
    writer.flush()?;
    info!(target: "export.csv", path = %path.display(), rows = frame.strikes.len(), "wrote frame to disk");
    Ok(())
}

/// Up to `limit` strikes centred on the ATM strike.
fn window(frame: &AnalyticsFrame, limit: usize) -> &[StrikeAnalytics] {
    let rows = &frame.strikes;
    if rows.len() <= limit {
        return rows;
    }
    let centre = frame
        .summary
        .atm_strike
        .and_then(|atm| rows.iter().position(|row| row.strike == atm))
        .unwrap_or(rows.len() / 2);
    let start = centre.saturating_sub(limit / 2).min(rows.len() - limit);
    &rows[start..start + limit]
}

fn format_opt(value: Option<f64>, dp: usize) -> String {
    value
        .map(|v| format!("{:.*}", dp, v))
        .unwrap_or_else(|| "-".to_string())
}

fn format_expiry(expiry: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(expiry, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| expiry.to_string())
}
