use std::collections::HashSet;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::{
    quotes::Quote,
    utils::{format_won, round2},
};

pub const DAILY_SURGE_ID: &str = "daily_surge";
pub const DAILY_DROP_ID: &str = "daily_drop";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StockCategory {
    Mezzanine,
    #[default]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomAlertKind {
    Above,
    Below,
    Parity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomAlert {
    pub price: f64,
    pub kind: CustomAlertKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_surge() -> f64 {
    5.0
}

fn default_drop() -> f64 {
    -5.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringStock {
    pub code: String,
    pub name: String,
    pub acquisition_price: f64,
    pub quantity: i64,
    pub take_profit: Option<f64>,
    pub stop_loss: Option<f64>,
    pub daily_surge_threshold: f64,
    pub daily_drop_threshold: f64,
    pub alert_enabled: bool,
    pub category: StockCategory,
    pub conversion_price: Option<f64>,
    pub conversion_price_floor: Option<f64>,
    pub custom_alerts: Vec<CustomAlert>,

    pub current_price: Option<f64>,
    pub prev_price: Option<f64>,
    pub change_rate: Option<f64>,
    pub updated_ts: Option<f64>,
    pub created_ts: f64,
}

impl MonitoringStock {
    pub fn cost_basis(&self) -> f64 {
        self.acquisition_price * self.quantity as f64
    }

    pub fn market_value(&self) -> Option<f64> {
        self.current_price.map(|p| p * self.quantity as f64)
    }

    pub fn profit_loss(&self) -> Option<f64> {
        self.current_price
            .map(|p| (p - self.acquisition_price) * self.quantity as f64)
    }

    pub fn profit_loss_rate(&self) -> Option<f64> {
        let p = self.current_price?;
        if self.acquisition_price <= 0.0 {
            return None;
        }
        Some(round2((p - self.acquisition_price) / self.acquisition_price * 100.0))
    }

    pub fn parity_at(&self, price: f64) -> Option<f64> {
        if self.category != StockCategory::Mezzanine {
            return None;
        }
        parity(price, self.conversion_price?)
    }

    pub fn parity_floor_at(&self, price: f64) -> Option<f64> {
        if self.category != StockCategory::Mezzanine {
            return None;
        }
        parity(price, self.conversion_price_floor?)
    }

    pub fn view(&self) -> StockView<'_> {
        let parity = self.current_price.and_then(|p| self.parity_at(p));
        let parity_floor = self.current_price.and_then(|p| self.parity_floor_at(p));
        StockView {
            stock: self,
            profit_loss: self.profit_loss(),
            profit_loss_rate: self.profit_loss_rate(),
            parity,
            parity_floor,
        }
    }
}

/// Current price as a percentage of the conversion price, two decimals.
pub fn parity(price: f64, conversion_price: f64) -> Option<f64> {
    if conversion_price <= 0.0 {
        return None;
    }
    Some(round2(price / conversion_price * 100.0))
}

/// Stock plus the figures derived from its last price.
#[derive(Debug, Serialize)]
pub struct StockView<'a> {
    #[serde(flatten)]
    pub stock: &'a MonitoringStock,
    pub profit_loss: Option<f64>,
    pub profit_loss_rate: Option<f64>,
    pub parity: Option<f64>,
    pub parity_floor: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewStock {
    pub code: String,
    #[serde(default)]
    pub name: Option<String>,
    pub acquisition_price: f64,
    pub quantity: i64,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default = "default_surge")]
    pub daily_surge_threshold: f64,
    #[serde(default = "default_drop")]
    pub daily_drop_threshold: f64,
    #[serde(default = "default_true")]
    pub alert_enabled: bool,
    #[serde(default)]
    pub category: StockCategory,
    #[serde(default)]
    pub conversion_price: Option<f64>,
    #[serde(default)]
    pub conversion_price_floor: Option<f64>,
    #[serde(default)]
    pub custom_alerts: Vec<CustomAlert>,
}

impl NewStock {
    pub fn into_stock(self, fallback_name: Option<String>, created_ts: f64) -> Result<MonitoringStock> {
        let code = self.code.trim().to_string();
        if code.is_empty() {
            return Err(anyhow!("stock code is required"));
        }
        let name = self
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .or(fallback_name)
            .unwrap_or_else(|| code.clone());
        let stock = MonitoringStock {
            code,
            name,
            acquisition_price: self.acquisition_price,
            quantity: self.quantity,
            take_profit: self.take_profit,
            stop_loss: self.stop_loss,
            daily_surge_threshold: self.daily_surge_threshold,
            daily_drop_threshold: self.daily_drop_threshold,
            alert_enabled: self.alert_enabled,
            category: self.category,
            conversion_price: self.conversion_price,
            conversion_price_floor: self.conversion_price_floor,
            custom_alerts: self.custom_alerts,
            current_price: None,
            prev_price: None,
            change_rate: None,
            updated_ts: None,
            created_ts,
        };
        validate_stock(&stock)?;
        Ok(stock)
    }
}

/// Partial update; absent fields keep their value. `Some(None)` clears an optional threshold.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StockPatch {
    pub name: Option<String>,
    pub acquisition_price: Option<f64>,
    pub quantity: Option<i64>,
    #[serde(default, deserialize_with = "double_option")]
    pub take_profit: Option<Option<f64>>,
    #[serde(default, deserialize_with = "double_option")]
    pub stop_loss: Option<Option<f64>>,
    pub daily_surge_threshold: Option<f64>,
    pub daily_drop_threshold: Option<f64>,
    pub alert_enabled: Option<bool>,
    pub category: Option<StockCategory>,
    #[serde(default, deserialize_with = "double_option")]
    pub conversion_price: Option<Option<f64>>,
    #[serde(default, deserialize_with = "double_option")]
    pub conversion_price_floor: Option<Option<f64>>,
    pub custom_alerts: Option<Vec<CustomAlert>>,
}

fn double_option<'de, D>(de: D) -> std::result::Result<Option<Option<f64>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<f64>::deserialize(de).map(Some)
}

impl StockPatch {
    pub fn apply(self, stock: &mut MonitoringStock) -> Result<()> {
        let mut next = stock.clone();
        if let Some(v) = self.name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()) {
            next.name = v;
        }
        if let Some(v) = self.acquisition_price {
            next.acquisition_price = v;
        }
        if let Some(v) = self.quantity {
            next.quantity = v;
        }
        if let Some(v) = self.take_profit {
            next.take_profit = v;
        }
        if let Some(v) = self.stop_loss {
            next.stop_loss = v;
        }
        if let Some(v) = self.daily_surge_threshold {
            next.daily_surge_threshold = v;
        }
        if let Some(v) = self.daily_drop_threshold {
            next.daily_drop_threshold = v;
        }
        if let Some(v) = self.alert_enabled {
            next.alert_enabled = v;
        }
        if let Some(v) = self.category {
            next.category = v;
        }
        if let Some(v) = self.conversion_price {
            next.conversion_price = v;
        }
        if let Some(v) = self.conversion_price_floor {
            next.conversion_price_floor = v;
        }
        if let Some(v) = self.custom_alerts {
            next.custom_alerts = v;
        }
        validate_stock(&next)?;
        *stock = next;
        Ok(())
    }
}

pub fn validate_stock(s: &MonitoringStock) -> Result<()> {
    if !(s.acquisition_price > 0.0) {
        return Err(anyhow!("acquisition_price must be > 0"));
    }
    if s.quantity <= 0 {
        return Err(anyhow!("quantity must be > 0"));
    }
    for (label, v) in [
        ("take_profit", s.take_profit),
        ("stop_loss", s.stop_loss),
        ("conversion_price", s.conversion_price),
        ("conversion_price_floor", s.conversion_price_floor),
    ] {
        if let Some(v) = v {
            if !(v > 0.0) {
                return Err(anyhow!("{label} must be > 0"));
            }
        }
    }
    if !(s.daily_surge_threshold > 0.0) {
        return Err(anyhow!("daily_surge_threshold must be > 0"));
    }
    if !(s.daily_drop_threshold < 0.0) {
        return Err(anyhow!("daily_drop_threshold must be < 0"));
    }
    if s.custom_alerts.iter().any(|a| !(a.price > 0.0)) {
        return Err(anyhow!("custom alert price must be > 0"));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    TakeProfit,
    StopLoss,
    DailySurge,
    DailyDrop,
    Parity,
    PriceAbove,
    PriceBelow,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::TakeProfit => "take_profit",
            AlertKind::StopLoss => "stop_loss",
            AlertKind::DailySurge => "daily_surge",
            AlertKind::DailyDrop => "daily_drop",
            AlertKind::Parity => "parity",
            AlertKind::PriceAbove => "price_above",
            AlertKind::PriceBelow => "price_below",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AlertKind::TakeProfit => "Take profit",
            AlertKind::StopLoss => "Stop loss",
            AlertKind::DailySurge => "Daily surge",
            AlertKind::DailyDrop => "Daily drop",
            AlertKind::Parity => "Parity",
            AlertKind::PriceAbove => "Price above",
            AlertKind::PriceBelow => "Price below",
        }
    }

    pub fn is_important(self) -> bool {
        matches!(self, AlertKind::TakeProfit | AlertKind::StopLoss)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggeredAlert {
    pub alert_id: String,
    pub kind: AlertKind,
    pub code: String,
    pub name: String,
    pub current_price: f64,
    pub target_price: f64,
    pub change_rate: f64,
    pub parity: Option<f64>,
    pub message: String,
}

/// `80000.0` -> `80000`, `1.5` -> `1.5`
fn level_key(x: f64) -> String {
    if x.fract() == 0.0 {
        format!("{}", x as i64)
    } else {
        format!("{x}")
    }
}

/// Thresholds crossed by `quote` that are not in `fired` yet.
///
/// Every id fires at most once per day; the midnight reset clears `fired`.
/// Editing a take-profit to a new price yields a new id and re-arms it at once.
pub fn evaluate(
    stock: &MonitoringStock,
    quote: &Quote,
    parity_levels: &[f64],
    fired: &HashSet<String>,
) -> Vec<TriggeredAlert> {
    let mut out = Vec::new();
    if !stock.alert_enabled {
        return out;
    }
    let price = quote.current_price;
    let rate = quote.change_rate;
    let cur = format_won(price);
    let parity_now = stock.parity_at(price);

    let mut push = |id: String, kind: AlertKind, target: f64, message: String| {
        if fired.contains(&id) || out.iter().any(|a: &TriggeredAlert| a.alert_id == id) {
            return;
        }
        out.push(TriggeredAlert {
            alert_id: id,
            kind,
            code: stock.code.clone(),
            name: stock.name.clone(),
            current_price: price,
            target_price: target,
            change_rate: rate,
            parity: parity_now,
            message,
        });
    };

    if let Some(tp) = stock.take_profit {
        if price >= tp {
            push(
                format!("take_profit_{}", level_key(tp)),
                AlertKind::TakeProfit,
                tp,
                format!("{} reached take-profit {} (now {})", stock.name, format_won(tp), cur),
            );
        }
    }

    if let Some(sl) = stock.stop_loss {
        if price <= sl {
            push(
                format!("stop_loss_{}", level_key(sl)),
                AlertKind::StopLoss,
                sl,
                format!("{} hit stop-loss {} (now {})", stock.name, format_won(sl), cur),
            );
        }
    }

    if rate >= stock.daily_surge_threshold {
        push(
            DAILY_SURGE_ID.to_string(),
            AlertKind::DailySurge,
            quote.prev_close * (1.0 + stock.daily_surge_threshold / 100.0),
            format!("{} surged {:+.2}% today (now {})", stock.name, rate, cur),
        );
    }

    if rate <= stock.daily_drop_threshold {
        push(
            DAILY_DROP_ID.to_string(),
            AlertKind::DailyDrop,
            quote.prev_close * (1.0 + stock.daily_drop_threshold / 100.0),
            format!("{} dropped {:+.2}% today (now {})", stock.name, rate, cur),
        );
    }

    if let (Some(p), Some(conv)) = (parity_now, stock.conversion_price) {
        let custom_levels = stock
            .custom_alerts
            .iter()
            .filter(|a| a.enabled && a.kind == CustomAlertKind::Parity)
            .map(|a| a.price);
        for level in parity_levels.iter().copied().chain(custom_levels) {
            if p >= level {
                push(
                    format!("parity_{}", level_key(level)),
                    AlertKind::Parity,
                    conv * level / 100.0,
                    format!("{} parity reached {}% ({:.2}%, now {})", stock.name, level_key(level), p, cur),
                );
            }
        }
    }

    for a in stock.custom_alerts.iter().filter(|a| a.enabled) {
        let suffix = a
            .description
            .as_deref()
            .filter(|d| !d.is_empty())
            .map(|d| format!(" [{d}]"))
            .unwrap_or_default();
        match a.kind {
            CustomAlertKind::Above if price >= a.price => push(
                format!("above_{}", level_key(a.price)),
                AlertKind::PriceAbove,
                a.price,
                format!("{} rose above {} (now {}){}", stock.name, format_won(a.price), cur, suffix),
            ),
            CustomAlertKind::Below if price <= a.price => push(
                format!("below_{}", level_key(a.price)),
                AlertKind::PriceBelow,
                a.price,
                format!("{} fell below {} (now {}){}", stock.name, format_won(a.price), cur, suffix),
            ),
            _ => {}
        }
    }

    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PortfolioTotals {
    pub total_cost: f64,
    pub total_value: f64,
    pub total_profit_loss: f64,
    pub total_profit_loss_rate: f64,
}

/// Only stocks with a known price contribute.
pub fn portfolio_totals(stocks: &[MonitoringStock]) -> PortfolioTotals {
    let mut t = PortfolioTotals::default();
    for s in stocks {
        let Some(value) = s.market_value() else {
            continue;
        };
        t.total_cost += s.cost_basis();
        t.total_value += value;
    }
    t.total_profit_loss = t.total_value - t.total_cost;
    if t.total_cost > 0.0 {
        t.total_profit_loss_rate = round2(t.total_profit_loss / t.total_cost * 100.0);
    }
    t
}


#[cfg(test)]
mod tests {
    use super::testing::{quote, stock};
    use super::*;

    fn ids(alerts: &[TriggeredAlert]) -> Vec<&str> {
        alerts.iter().map(|a| a.alert_id.as_str()).collect()
    }

    #[test]
    fn take_profit_fires_once_per_level() {
        let mut s = stock("005930", 70_000.0, 10);
        s.take_profit = Some(80_000.0);
        let q = quote("005930", 80_500.0, 79_000.0);

        let first = evaluate(&s, &q, &[], &HashSet::new());
        assert_eq!(ids(&first), vec!["take_profit_80000"]);
        assert_eq!(first[0].target_price, 80_000.0);
        assert!(first[0].message.contains("80,000"));

        let fired: HashSet<String> = first.iter().map(|a| a.alert_id.clone()).collect();
        assert!(evaluate(&s, &q, &[], &fired).is_empty());

        s.take_profit = Some(80_200.0);
        assert_eq!(ids(&evaluate(&s, &q, &[], &fired)), vec!["take_profit_80200"]);
    }

    #[test]
    fn stop_loss_fires_at_or_below() {
        let mut s = stock("000660", 120_000.0, 5);
        s.stop_loss = Some(100_000.0);
        assert!(evaluate(&s, &quote("000660", 100_001.0, 100_500.0), &[], &HashSet::new()).is_empty());
        let alerts = evaluate(&s, &quote("000660", 100_000.0, 100_500.0), &[], &HashSet::new());
        assert_eq!(alerts[0].kind, AlertKind::StopLoss);
        assert!(alerts[0].kind.is_important());
    }

    #[test]
    fn daily_thresholds_use_change_rate() {
        let s = stock("035720", 40_000.0, 1);
        let up = evaluate(&s, &quote("035720", 42_000.0, 40_000.0), &[], &HashSet::new());
        assert_eq!(ids(&up), vec![DAILY_SURGE_ID]);
        assert_eq!(up[0].target_price, 42_000.0);
        assert!(up[0].message.contains("+5.00%"));

        let down = evaluate(&s, &quote("035720", 37_000.0, 40_000.0), &[], &HashSet::new());
        assert_eq!(ids(&down), vec![DAILY_DROP_ID]);
        assert_eq!(down[0].target_price, 38_000.0);

        let flat = evaluate(&s, &quote("035720", 40_400.0, 40_000.0), &[], &HashSet::new());
        assert!(flat.is_empty());
    }

    #[test]
    fn parity_levels_only_for_mezzanine() {
        let mut s = stock("096770", 100_000.0, 3);
        s.conversion_price = Some(100_000.0);
        let q = quote("096770", 101_000.0, 100_000.0);
        assert!(evaluate(&s, &q, &[80.0, 100.0, 120.0], &HashSet::new()).is_empty());

        s.category = StockCategory::Mezzanine;
        let alerts = evaluate(&s, &q, &[80.0, 100.0, 120.0], &HashSet::new());
        assert_eq!(ids(&alerts), vec!["parity_80", "parity_100"]);
        assert_eq!(alerts[1].target_price, 100_000.0);
        assert_eq!(alerts[1].parity, Some(101.0));
    }

    #[test]
    fn custom_alerts_respect_direction_and_enabled() {
        let mut s = stock("005380", 200_000.0, 2);
        s.custom_alerts = vec![
            CustomAlert { price: 210_000.0, kind: CustomAlertKind::Above, enabled: true, description: Some("breakout".into()) },
            CustomAlert { price: 190_000.0, kind: CustomAlertKind::Below, enabled: true, description: None },
            CustomAlert { price: 205_000.0, kind: CustomAlertKind::Above, enabled: false, description: None },
        ];
        let alerts = evaluate(&s, &quote("005380", 211_000.0, 209_000.0), &[], &HashSet::new());
        assert_eq!(ids(&alerts), vec!["above_210000"]);
        assert!(alerts[0].message.ends_with("[breakout]"));
    }

    #[test]
    fn disabled_stock_never_alerts() {
        let mut s = stock("005930", 70_000.0, 10);
        s.take_profit = Some(1.0);
        s.alert_enabled = false;
        assert!(evaluate(&s, &quote("005930", 99_000.0, 70_000.0), &[], &HashSet::new()).is_empty());
    }

    #[test]
    fn derived_figures() {
        let mut s = stock("005930", 70_000.0, 10);
        assert_eq!(s.profit_loss(), None);
        s.current_price = Some(77_000.0);
        assert_eq!(s.profit_loss(), Some(70_000.0));
        assert_eq!(s.profit_loss_rate(), Some(10.0));
        assert_eq!(s.parity_at(77_000.0), None);

        s.category = StockCategory::Mezzanine;
        s.conversion_price = Some(70_000.0);
        s.conversion_price_floor = Some(49_000.0);
        assert_eq!(s.parity_at(77_000.0), Some(110.0));
        assert_eq!(s.parity_floor_at(77_000.0), Some(157.14));

        let v = serde_json::to_value(s.view()).unwrap();
        assert_eq!(v["code"], "005930");
        assert_eq!(v["parity"], 110.0);
        assert_eq!(v["category"], "mezzanine");
    }

    #[test]
    fn patch_validates_before_applying() {
        let mut s = stock("005930", 70_000.0, 10);
        s.take_profit = Some(90_000.0);
        let bad = StockPatch { quantity: Some(0), ..Default::default() };
        assert!(bad.apply(&mut s).is_err());
        assert_eq!(s.quantity, 10);

        let clear: StockPatch = serde_json::from_value(serde_json::json!({"take_profit": null, "quantity": 20})).unwrap();
        clear.apply(&mut s).unwrap();
        assert_eq!(s.take_profit, None);
        assert_eq!(s.quantity, 20);
    }

    #[test]
    fn new_stock_requires_positive_numbers() {
        let raw = serde_json::json!({"code": "005930", "acquisition_price": 0, "quantity": 1});
        let ns: NewStock = serde_json::from_value(raw).unwrap();
        assert!(ns.into_stock(None, 0.0).is_err());

        let raw = serde_json::json!({"code": " 005930 ", "acquisition_price": 70000, "quantity": 1});
        let ns: NewStock = serde_json::from_value(raw).unwrap();
        let s = ns.into_stock(Some("삼성전자".into()), 5.0).unwrap();
        assert_eq!(s.code, "005930");
        assert_eq!(s.name, "삼성전자");
        assert_eq!(s.daily_drop_threshold, -5.0);
        assert!(s.alert_enabled);
    }

    #[test]
    fn totals_skip_unpriced() {
        let mut a = stock("A", 100.0, 10);
        a.current_price = Some(110.0);
        let b = stock("B", 50.0, 10);
        let t = portfolio_totals(&[a, b]);
        assert_eq!(t.total_cost, 1_000.0);
        assert_eq!(t.total_value, 1_100.0);
        assert_eq!(t.total_profit_loss, 100.0);
        assert_eq!(t.total_profit_loss_rate, 10.0);
    }
}
