use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, TimeZone, Weekday};
use serde::Serialize;

use crate::{config::parse_hhmm, utils::market_tz};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketStatus {
    Open,
    Closed,
    PreMarket,
    AfterMarket,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketInfo {
    pub status: MarketStatus,
    pub is_trading_hours: bool,
    pub current_time: String,
    pub open_time: String,
    pub close_time: String,
    pub next_open: Option<String>,
    pub trading_day: String,
}

/// Regular session of a single exchange, evaluated in the exchange's fixed offset.
#[derive(Debug, Clone, Copy)]
pub struct MarketHours {
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub tz: FixedOffset,
}

impl MarketHours {
    pub fn parse(open: &str, close: &str, utc_offset_hours: i32) -> Result<Self> {
        let open_t = parse_hhmm("market_open", open)?;
        let close_t = parse_hhmm("market_close", close)?;
        if open_t >= close_t {
            anyhow::bail!("market_open must be before market_close ({open} >= {close})");
        }
        Ok(Self {
            open: open_t,
            close: close_t,
            tz: market_tz(utc_offset_hours),
        })
    }

    pub fn now(&self) -> DateTime<FixedOffset> {
        chrono::Utc::now().with_timezone(&self.tz)
    }

    pub fn status_at(&self, now: &DateTime<FixedOffset>) -> MarketStatus {
        if is_weekend(now.weekday()) {
            return MarketStatus::Closed;
        }
        let t = now.time();
        if t < self.open {
            MarketStatus::PreMarket
        } else if t <= self.close {
            MarketStatus::Open
        } else {
            MarketStatus::AfterMarket
        }
    }

    pub fn is_trading_hours(&self, now: &DateTime<FixedOffset>) -> bool {
        self.status_at(now) == MarketStatus::Open
    }

    /// Today's open when still before it on a weekday, else the next weekday's.
    pub fn next_open(&self, now: &DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        let mut day = now.date_naive();
        if is_weekend(day.weekday()) || now.time() >= self.open {
            day = day.succ_opt()?;
        }
        while is_weekend(day.weekday()) {
            day = day.succ_opt()?;
        }
        self.tz
            .from_local_datetime(&day.and_time(self.open))
            .single()
    }

    pub fn info_at(&self, now: &DateTime<FixedOffset>) -> MarketInfo {
        let status = self.status_at(now);
        MarketInfo {
            status,
            is_trading_hours: status == MarketStatus::Open,
            current_time: now.format("%Y-%m-%d %H:%M:%S").to_string(),
            open_time: self.open.format("%H:%M").to_string(),
            close_time: self.close.format("%H:%M").to_string(),
            next_open: self
                .next_open(now)
                .map(|d| d.format("%Y-%m-%d %H:%M").to_string()),
            trading_day: trading_day(now),
        }
    }
}

pub fn trading_day(now: &DateTime<FixedOffset>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// `YYYYMMDD`, the date format of the disclosure list API.
pub fn compact_day(now: &DateTime<FixedOffset>) -> String {
    now.format("%Y%m%d").to_string()
}

pub fn start_of_day(now: &DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
    now.timezone()
        .from_local_datetime(&now.date_naive().and_time(NaiveTime::MIN))
        .single()
}

pub fn until_next_midnight(now: &DateTime<FixedOffset>) -> std::time::Duration {
    let next = start_of_day(now).map(|d| d + Duration::days(1));
    match next {
        Some(n) => (n - *now).to_std().unwrap_or_default(),
        None => std::time::Duration::from_secs(24 * 3600),
    }
}

fn is_weekend(d: Weekday) -> bool {
    matches!(d, Weekday::Sat | Weekday::Sun)
}
