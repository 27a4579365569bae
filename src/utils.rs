use chrono::{DateTime, FixedOffset, Offset, Utc};

pub fn now_ts() -> f64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    now.as_secs_f64()
}

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// `1234567.0` -> `"1,234,567"`. Fractions are rounded away.
pub fn format_won(x: f64) -> String {
    let neg = x < 0.0;
    let digits = (x.abs().round() as u64).to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    if neg {
        format!("-{out}")
    } else {
        out
    }
}

/// Parses quote-feed numbers such as `"70,500"`, `"-1.25"` or `"+300"`.
pub fn parse_grouped_number(s: &str) -> Option<f64> {
    let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
    let cleaned = cleaned.strip_prefix('+').unwrap_or(&cleaned);
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn market_tz(utc_offset_hours: i32) -> FixedOffset {
    FixedOffset::east_opt(utc_offset_hours.clamp(-12, 14) * 3600).unwrap_or(Utc.fix())
}

pub fn local_to_ts(dt: &DateTime<FixedOffset>) -> f64 {
    dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_millis()) / 1000.0
}
