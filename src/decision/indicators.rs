//! Multi-timeframe kline summaries fed into the Strategist's prompt
//! (spec §4.2): RSI14, MA20/MA50, ATR14, ADX14, a trend label from MA
//! ordering, and a volatility bucket from `ATR/price`. Pure functions
//! over `f64` — these are analytical inputs to a prompt, not money, so
//! `rust_decimal` buys nothing here.

use rust_decimal::prelude::ToPrimitive;

use crate::models::kline::{Kline, Timeframe};

#[derive(Debug, Clone)]
pub struct TimeframeSummary {
    pub timeframe: Timeframe,
    pub last_close: f64,
    pub rsi14: Option<f64>,
    pub ma20: Option<f64>,
    pub ma50: Option<f64>,
    pub atr14: Option<f64>,
    pub adx14: Option<f64>,
    pub trend: &'static str,
    pub volatility_bucket: &'static str,
}

pub fn summarize(timeframe: Timeframe, klines: &[Kline]) -> Option<TimeframeSummary> {
    let closes: Vec<f64> = klines.iter().filter_map(|k| k.close.to_f64()).collect();
    let last_close = *closes.last()?;

    let rsi14 = rsi(&closes, 14);
    let ma20 = sma(&closes, 20);
    let ma50 = sma(&closes, 50);
    let atr14 = atr(klines, 14);
    let adx14 = adx(klines, 14);

    let trend = match (ma20, ma50) {
        (Some(fast), Some(slow)) if fast > slow * 1.001 => "up",
        (Some(fast), Some(slow)) if fast < slow * 0.999 => "down",
        (Some(_), Some(_)) => "flat",
        _ => "unknown",
    };

    let volatility_bucket = match atr14 {
        Some(atr) if last_close > 0.0 => {
            let ratio = atr / last_close;
            if ratio < 0.005 {
                "low"
            } else if ratio < 0.015 {
                "normal"
            } else if ratio < 0.03 {
                "elevated"
            } else {
                "extreme"
            }
        }
        _ => "unknown",
    };

    Some(TimeframeSummary {
        timeframe,
        last_close,
        rsi14,
        ma20,
        ma50,
        atr14,
        adx14,
        trend,
        volatility_bucket,
    })
}

fn sma(values: &[f64], period: usize) -> Option<f64> {
    if values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Wilder's RSI over `period` closes.
fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if closes.len() < period + 1 {
        return None;
    }
    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let relevant = &deltas[deltas.len() - period..];
    let gain: f64 = relevant.iter().filter(|d| **d > 0.0).sum::<f64>() / period as f64;
    let loss: f64 = relevant.iter().filter(|d| **d < 0.0).map(|d| d.abs()).sum::<f64>() / period as f64;
    if loss == 0.0 {
        return Some(100.0);
    }
    let rs = gain / loss;
    Some(100.0 - (100.0 / (1.0 + rs)))
}

fn true_ranges(klines: &[Kline]) -> Vec<f64> {
    let mut out = Vec::with_capacity(klines.len());
    for (i, k) in klines.iter().enumerate() {
        let high = k.high.to_f64().unwrap_or(0.0);
        let low = k.low.to_f64().unwrap_or(0.0);
        let tr = if i == 0 {
            high - low
        } else {
            let prev_close = klines[i - 1].close.to_f64().unwrap_or(0.0);
            (high - low).max((high - prev_close).abs()).max((low - prev_close).abs())
        };
        out.push(tr);
    }
    out
}

fn atr(klines: &[Kline], period: usize) -> Option<f64> {
    let trs = true_ranges(klines);
    sma(&trs, period)
}

/// Wilder's ADX14 via +DM/-DM, smoothed DI, and DX.
fn adx(klines: &[Kline], period: usize) -> Option<f64> {
    adx_full(klines, period).map(|(adx, _, _)| adx)
}

/// Returns `(adx, +di, -di)`; direction is read off `+di` vs `-di`.
pub fn adx_full(klines: &[Kline], period: usize) -> Option<(f64, f64, f64)> {
    if klines.len() < period + 1 {
        return None;
    }
    let mut plus_dm = Vec::with_capacity(klines.len());
    let mut minus_dm = Vec::with_capacity(klines.len());
    for i in 1..klines.len() {
        let up_move = klines[i].high.to_f64().unwrap_or(0.0) - klines[i - 1].high.to_f64().unwrap_or(0.0);
        let down_move = klines[i - 1].low.to_f64().unwrap_or(0.0) - klines[i].low.to_f64().unwrap_or(0.0);
        plus_dm.push(if up_move > down_move && up_move > 0.0 { up_move } else { 0.0 });
        minus_dm.push(if down_move > up_move && down_move > 0.0 { down_move } else { 0.0 });
    }
    let trs = true_ranges(&klines[1..]);
    let atr = sma(&trs, period)?;
    if atr == 0.0 {
        return None;
    }
    let plus_di = 100.0 * sma(&plus_dm, period)? / atr;
    let minus_di = 100.0 * sma(&minus_dm, period)? / atr;
    let sum = plus_di + minus_di;
    let adx = if sum == 0.0 { 0.0 } else { 100.0 * (plus_di - minus_di).abs() / sum };
    Some((adx, plus_di, minus_di))
}

fn ema_series(values: &[f64], period: usize) -> Option<Vec<f64>> {
    if values.len() < period {
        return None;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut ema = values[..period].iter().sum::<f64>() / period as f64;
    out.push(ema);
    for &v in &values[period..] {
        ema = v * k + ema * (1.0 - k);
        out.push(ema);
    }
    Some(out)
}

/// MACD histogram (12/26 EMA minus a 9-EMA signal line) — only the
/// latest value; the sign is what the Trader's prompt tags as 金叉/死叉.
pub fn macd_histogram(closes: &[f64]) -> Option<f64> {
    let ema12 = ema_series(closes, 12)?;
    let ema26 = ema_series(closes, 26)?;
    let len = ema12.len().min(ema26.len());
    let macd_line: Vec<f64> = (0..len)
        .map(|i| ema12[ema12.len() - len + i] - ema26[ema26.len() - len + i])
        .collect();
    let signal = ema_series(&macd_line, 9)?;
    let macd_last = *macd_line.last()?;
    let signal_last = *signal.last()?;
    Some(macd_last - signal_last)
}

/// `inside` / `above_upper` / `below_lower` relative to a 20-period,
/// 2-stddev Bollinger band.
pub fn bollinger_position(closes: &[f64]) -> Option<&'static str> {
    let period = 20;
    if closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    let mean = window.iter().sum::<f64>() / period as f64;
    let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();
    let last = *closes.last()?;
    let upper = mean + 2.0 * std_dev;
    let lower = mean - 2.0 * std_dev;
    Some(if last > upper {
        "above_upper"
    } else if last < lower {
        "below_lower"
    } else {
        "inside"
    })
}

/// ADX strength bucket per spec §4.3: `<20 none, <40 weak, <60 strong, >=60 very strong`.
pub fn adx_strength_bucket(adx: f64) -> &'static str {
    if adx < 20.0 {
        "none"
    } else if adx < 40.0 {
        "weak"
    } else if adx < 60.0 {
        "strong"
    } else {
        "very_strong"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn kline(close: f64, high: f64, low: f64, ts: i64) -> Kline {
        Kline {
            exchange_id: "binance".into(),
            symbol: "BTC/USDT:USDT".into(),
            timeframe: Timeframe::H1,
            timestamp: ts,
            open: dec!(0),
            high: rust_decimal::Decimal::try_from(high).unwrap(),
            low: rust_decimal::Decimal::try_from(low).unwrap(),
            close: rust_decimal::Decimal::try_from(close).unwrap(),
            volume: dec!(0),
        }
    }

    #[test]
    fn rsi_is_100_when_every_delta_is_a_gain() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        assert_eq!(rsi(&closes, 14), Some(100.0));
    }

    #[test]
    fn summarize_returns_none_on_empty_series() {
        assert!(summarize(Timeframe::H1, &[]).is_none());
    }

    #[test]
    fn trend_up_when_fast_ma_clears_slow_ma() {
        let mut klines = Vec::new();
        for i in 0..60 {
            let price = 100.0 + i as f64 * 2.0;
            klines.push(kline(price, price + 1.0, price - 1.0, i));
        }
        let summary = summarize(Timeframe::H1, &klines).unwrap();
        assert_eq!(summary.trend, "up");
    }
}
