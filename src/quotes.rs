use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};

use crate::utils::{now_ts, parse_grouped_number, round2};

/// Latest price snapshot for one listed stock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Quote {
    pub code: String,
    pub name: String,
    pub current_price: f64,
    pub prev_close: f64,
    pub change: f64,
    pub change_rate: f64,
    pub volume: u64,
    pub trading_value: Option<f64>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub updated_ts: f64,
}

pub trait QuoteSource: Send + Sync {
    fn fetch<'a>(&'a self, code: &'a str) -> BoxFuture<'a, Result<Quote>>;
}

/// Concurrent lookups; failed codes are logged and left out.
pub async fn fetch_many(source: &dyn QuoteSource, codes: &[String]) -> Vec<Quote> {
    let results = join_all(codes.iter().map(|c| source.fetch(c))).await;
    let mut out = Vec::with_capacity(results.len());
    for (code, r) in codes.iter().zip(results) {
        match r {
            Ok(q) => out.push(q),
            Err(e) => log::warn!("quotes.fetch_failed code={} err={:#}", code, e),
        }
    }
    out
}

/// Realtime JSON polling endpoint (`{base}/{code}`).
pub struct NaverQuoteSource {
    http: reqwest::Client,
    base_url: String,
}

impl NaverQuoteSource {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .user_agent("Mozilla/5.0 (investwatch)")
            .build()
            .context("build quote http client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_quote(&self, code: &str) -> Result<Quote> {
        let url = format!("{}/{}", self.base_url, code);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?;
        let payload: NaverPayload = resp.json().await.context("decode quote payload")?;
        parse_naver_payload(code, payload, now_ts())
    }
}

impl QuoteSource for NaverQuoteSource {
    fn fetch<'a>(&'a self, code: &'a str) -> BoxFuture<'a, Result<Quote>> {
        Box::pin(self.fetch_quote(code))
    }
}

#[derive(Debug, Deserialize)]
struct NaverPayload {
    #[serde(default)]
    datas: Vec<NaverItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NaverItem {
    #[serde(default)]
    item_code: String,
    #[serde(default)]
    stock_name: String,
    #[serde(default)]
    close_price: String,
    #[serde(default)]
    compare_to_previous_close_price: String,
    #[serde(default)]
    compare_to_previous_price: Option<NaverDirection>,
    #[serde(default)]
    fluctuations_ratio: String,
    #[serde(default)]
    open_price: Option<String>,
    #[serde(default)]
    high_price: Option<String>,
    #[serde(default)]
    low_price: Option<String>,
    #[serde(default)]
    accumulated_trading_volume: Option<String>,
    #[serde(default)]
    accumulated_trading_value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NaverDirection {
    #[serde(default)]
    name: String,
}

/// Trading value is reported in millions with a `백만` suffix.
fn parse_trading_value(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    match raw.strip_suffix("백만") {
        Some(millions) => parse_grouped_number(millions).map(|v| v * 1_000_000.0),
        None => parse_grouped_number(raw),
    }
}

fn parse_naver_payload(code: &str, payload: NaverPayload, ts: f64) -> Result<Quote> {
    let item = payload
        .datas
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no quote data for {code}"))?;

    let current_price = parse_grouped_number(&item.close_price)
        .filter(|p| *p > 0.0)
        .ok_or_else(|| anyhow!("invalid close price for {code}: {:?}", item.close_price))?;

    let mut change = parse_grouped_number(&item.compare_to_previous_close_price).unwrap_or(0.0);
    let mut change_rate = parse_grouped_number(&item.fluctuations_ratio).unwrap_or(0.0);
    let falling = item
        .compare_to_previous_price
        .as_ref()
        .map(|d| matches!(d.name.as_str(), "FALLING" | "LOWER_LIMIT"))
        .unwrap_or(false);
    if falling {
        change = -change.abs();
        change_rate = -change_rate.abs();
    }

    let prev_close = current_price - change;
    if change_rate == 0.0 && change != 0.0 && prev_close > 0.0 {
        change_rate = change / prev_close * 100.0;
    }

    let name = if item.stock_name.is_empty() {
        code.to_string()
    } else {
        item.stock_name
    };
    let code = if item.item_code.is_empty() {
        code.to_string()
    } else {
        item.item_code
    };

    Ok(Quote {
        code,
        name,
        current_price,
        prev_close,
        change,
        change_rate: round2(change_rate),
        volume: item
            .accumulated_trading_volume
            .as_deref()
            .and_then(parse_grouped_number)
            .map(|v| v.max(0.0) as u64)
            .unwrap_or(0),
        trading_value: item
            .accumulated_trading_value
            .as_deref()
            .and_then(parse_trading_value),
        open: item.open_price.as_deref().and_then(parse_grouped_number),
        high: item.high_price.as_deref().and_then(parse_grouped_number),
        low: item.low_price.as_deref().and_then(parse_grouped_number),
        updated_ts: ts,
    })
}


#[cfg(test)]
mod tests {
    use super::testing::FixedQuotes;
    use super::*;

    fn payload(v: serde_json::Value) -> NaverPayload {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn parses_rising_quote() {
        let p = payload(serde_json::json!({
            "pollingInterval": 7000,
            "datas": [{
                "itemCode": "005930",
                "stockName": "삼성전자",
                "closePrice": "71,000",
                "compareToPreviousClosePrice": "500",
                "compareToPreviousPrice": {"code": "2", "text": "상승", "name": "RISING"},
                "fluctuationsRatio": "0.71",
                "openPrice": "70,500",
                "highPrice": "71,200",
                "lowPrice": "70,300",
                "accumulatedTradingVolume": "12,345,678",
                "accumulatedTradingValue": "876,543백만"
            }]
        }));
        let q = parse_naver_payload("005930", p, 10.0).unwrap();
        assert_eq!(q.name, "삼성전자");
        assert_eq!(q.current_price, 71_000.0);
        assert_eq!(q.prev_close, 70_500.0);
        assert_eq!(q.change_rate, 0.71);
        assert_eq!(q.volume, 12_345_678);
        assert_eq!(q.trading_value, Some(876_543_000_000.0));
        assert_eq!(q.high, Some(71_200.0));
        assert_eq!(q.updated_ts, 10.0);
    }

    #[test]
    fn falling_direction_forces_negative_change() {
        let p = payload(serde_json::json!({
            "datas": [{
                "itemCode": "035720",
                "stockName": "카카오",
                "closePrice": "40,000",
                "compareToPreviousClosePrice": "1,000",
                "compareToPreviousPrice": {"name": "FALLING"},
                "fluctuationsRatio": "2.44"
            }]
        }));
        let q = parse_naver_payload("035720", p, 0.0).unwrap();
        assert_eq!(q.change, -1_000.0);
        assert_eq!(q.prev_close, 41_000.0);
        assert_eq!(q.change_rate, -2.44);
    }

    #[test]
    fn empty_or_zero_price_is_an_error() {
        assert!(parse_naver_payload("000000", payload(serde_json::json!({"datas": []})), 0.0).is_err());
        let zero = payload(serde_json::json!({"datas": [{"closePrice": "0"}]}));
        assert!(parse_naver_payload("000000", zero, 0.0).is_err());
    }

    #[tokio::test]
    async fn fetch_many_drops_failures() {
        let src = FixedQuotes::default();
        src.set("005930", 70_000.0, 69_000.0);
        let codes = vec!["005930".to_string(), "999999".to_string()];
        let quotes = fetch_many(&src, &codes).await;
        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes[0].code, "005930");
    }
}
