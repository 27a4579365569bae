use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::{
    config::{parse_hhmm, Settings},
    dart::{CheckOutcome, DartService},
    hub::{run_pinger, EventKind, Hub},
    market::{compact_day, start_of_day, until_next_midnight, MarketHours, MarketInfo, MarketStatus},
    notifier::{daily_summary_email, stock_alert_email, system_alert_email, EmailMessage, Mailer},
    quotes::{fetch_many, Quote, QuoteSource},
    stocks::{evaluate, portfolio_totals, MonitoringStock, PortfolioTotals, TriggeredAlert},
    store::{AlertType, NewAlert, SqliteStore},
    utils::{local_to_ts, now_ts},
};

pub const STOCK_SETTINGS_KEY: &str = "stock_monitoring_settings";

pub const DART_NOTIFY_AFTER: u32 = 5;
pub const STOCK_NOTIFY_AFTER: u32 = 3;
pub const STOP_AFTER: u32 = 10;

/// Runtime-editable stock monitoring knobs, persisted in the settings table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockMonitorSettings {
    pub check_interval: u64,
    pub market_open: String,
    pub market_close: String,
    pub enable_email_alerts: bool,
    pub enable_websocket_alerts: bool,
    pub max_alerts_per_day: u64,
    pub retry_attempts: u32,
    pub timeout_seconds: u64,
}

impl StockMonitorSettings {
    pub fn defaults(s: &Settings) -> Self {
        Self {
            check_interval: s.stock_check_interval_secs,
            market_open: s.market_open.clone(),
            market_close: s.market_close.clone(),
            enable_email_alerts: true,
            enable_websocket_alerts: true,
            max_alerts_per_day: s.max_alerts_per_day,
            retry_attempts: 3,
            timeout_seconds: s.http_timeout_secs,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=3600).contains(&self.check_interval) {
            return Err(anyhow!("check_interval must be within 1..=3600 seconds"));
        }
        let open = parse_hhmm("market_open", &self.market_open)?;
        let close = parse_hhmm("market_close", &self.market_close)?;
        if open >= close {
            return Err(anyhow!("market_open must be before market_close"));
        }
        if self.timeout_seconds == 0 {
            return Err(anyhow!("timeout_seconds must be > 0"));
        }
        Ok(())
    }

    pub fn market_hours(&self, utc_offset_hours: i32) -> Result<MarketHours> {
        MarketHours::parse(&self.market_open, &self.market_close, utc_offset_hours)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    None,
    Notify,
    Stop,
}

/// Consecutive-failure policy: notify once when the streak reaches
/// `notify_at`, stop the loop at `stop_at`.
pub fn escalation_for(consecutive: u32, notify_at: u32, stop_at: u32) -> Escalation {
    if consecutive >= stop_at {
        Escalation::Stop
    } else if consecutive == notify_at {
        Escalation::Notify
    } else {
        Escalation::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketTransition {
    Opened,
    Closed,
}

/// The first observation after startup is never a transition.
pub fn market_transition(prev: Option<MarketStatus>, cur: MarketStatus) -> Option<MarketTransition> {
    match prev {
        Some(p) if p != MarketStatus::Open && cur == MarketStatus::Open => Some(MarketTransition::Opened),
        Some(MarketStatus::Open) if cur != MarketStatus::Open => Some(MarketTransition::Closed),
        _ => None,
    }
}

/// True when the last check (or start, if none yet) is older than `max_age` seconds.
pub fn is_stale(last_check_ts: Option<f64>, started_ts: Option<f64>, now: f64, max_age: f64) -> bool {
    match last_check_ts.or(started_ts) {
        Some(ts) => now - ts > max_age,
        None => false,
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorHealth {
    pub is_running: bool,
    pub started_ts: Option<f64>,
    pub check_count: u64,
    pub error_count: u32,
    pub last_check_ts: Option<f64>,
    pub last_error: Option<String>,
    pub next_check_ts: Option<f64>,
    pub alerts_sent_today: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StockCheckOutcome {
    pub skipped: bool,
    pub stocks: usize,
    pub quotes: usize,
    pub alerts: usize,
    pub emails_sent: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DartStatistics {
    pub configured: bool,
    pub is_running: bool,
    pub processed_count: i64,
    pub week_disclosures: i64,
    pub today_alerts: i64,
    pub companies: usize,
    pub active_companies: usize,
    pub keywords: usize,
    pub active_keywords: usize,
    pub last_check_ts: Option<f64>,
    pub next_check_ts: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StockStatistics {
    pub total_stocks: usize,
    pub active_alerts: usize,
    pub today_alerts: i64,
    pub alerts_sent_today: u64,
    pub market_status: MarketStatus,
    pub last_update_ts: Option<f64>,
    #[serde(flatten)]
    pub totals: PortfolioTotals,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub code: String,
    pub name: String,
    pub current_price: Option<f64>,
    pub change_rate: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Component {
    Dart,
    Stock,
}

impl Component {
    fn as_str(self) -> &'static str {
        match self {
            Component::Dart => "dart",
            Component::Stock => "stock",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Component::Dart => "DART monitor",
            Component::Stock => "Stock monitor",
        }
    }
}

pub struct MonitorInner {
    pub settings: Settings,
    pub store: SqliteStore,
    pub hub: Hub,
    pub mailer: Arc<Mailer>,
    pub dart: DartService,
    pub quotes: Arc<dyn QuoteSource>,
    dart_health: RwLock<MonitorHealth>,
    stock_health: RwLock<MonitorHealth>,
    stock_settings: RwLock<StockMonitorSettings>,
    market_hours: RwLock<MarketHours>,
    market_status: RwLock<Option<MarketStatus>>,
    interval_tx: watch::Sender<u64>,
    dart_lock: Mutex<()>,
    stock_lock: Mutex<()>,
}

/// Shared handle to both monitors; cheap to clone into tasks and handlers.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

impl std::ops::Deref for Monitor {
    type Target = MonitorInner;

    fn deref(&self) -> &MonitorInner {
        &self.inner
    }
}

impl Monitor {
    pub fn new(
        settings: Settings,
        store: SqliteStore,
        hub: Hub,
        mailer: Arc<Mailer>,
        quotes: Arc<dyn QuoteSource>,
    ) -> Result<Self> {
        let dart = DartService::new(settings.clone(), store.clone(), hub.clone(), mailer.clone())?;
        dart.seed_watch_lists()?;

        let stock_settings = match store.get_setting::<StockMonitorSettings>(STOCK_SETTINGS_KEY) {
            Ok(Some(s)) if s.validate().is_ok() => s,
            Ok(_) => StockMonitorSettings::defaults(&settings),
            Err(e) => {
                log::warn!("monitor.settings_unreadable err={:#}", e);
                StockMonitorSettings::defaults(&settings)
            }
        };
        let market_hours = stock_settings.market_hours(settings.market_utc_offset_hours)?;
        let (interval_tx, _) = watch::channel(stock_settings.check_interval);

        Ok(Self {
            inner: Arc::new(MonitorInner {
                settings,
                store,
                hub,
                mailer,
                dart,
                quotes,
                dart_health: RwLock::new(MonitorHealth::default()),
                stock_health: RwLock::new(MonitorHealth::default()),
                stock_settings: RwLock::new(stock_settings),
                market_hours: RwLock::new(market_hours),
                market_status: RwLock::new(None),
                interval_tx,
                dart_lock: Mutex::new(()),
                stock_lock: Mutex::new(()),
            }),
        })
    }

    pub fn dart_health(&self) -> MonitorHealth {
        self.dart_health.read().clone()
    }

    pub fn stock_health(&self) -> MonitorHealth {
        self.stock_health.read().clone()
    }

    pub fn stock_settings(&self) -> StockMonitorSettings {
        self.stock_settings.read().clone()
    }

    pub fn market_hours(&self) -> MarketHours {
        *self.market_hours.read()
    }

    pub fn market_info(&self) -> MarketInfo {
        let hours = self.market_hours();
        hours.info_at(&hours.now())
    }

    pub fn update_stock_settings(&self, next: StockMonitorSettings) -> Result<StockMonitorSettings> {
        next.validate()?;
        let hours = next.market_hours(self.settings.market_utc_offset_hours)?;
        self.store.put_setting(STOCK_SETTINGS_KEY, &next, now_ts())?;
        let prev = std::mem::replace(&mut *self.stock_settings.write(), next.clone());
        *self.market_hours.write() = hours;
        if prev.check_interval != next.check_interval {
            self.interval_tx.send_replace(next.check_interval);
            self.hub.publish(
                EventKind::SystemStatus,
                serde_json::json!({
                    "status": "interval_updated",
                    "message": format!("stock check interval {}s -> {}s", prev.check_interval, next.check_interval),
                    "check_interval": next.check_interval,
                }),
            );
            log::info!(
                "stock.interval_updated from={} to={}",
                prev.check_interval,
                next.check_interval
            );
        }
        Ok(next)
    }

    fn health(&self, c: Component) -> &RwLock<MonitorHealth> {
        match c {
            Component::Dart => &self.dart_health,
            Component::Stock => &self.stock_health,
        }
    }

    fn record_success(&self, c: Component, interval_secs: u64) {
        let now = now_ts();
        {
            let mut h = self.health(c).write();
            h.check_count += 1;
            h.error_count = 0;
            h.last_check_ts = Some(now);
            h.next_check_ts = Some(now + interval_secs as f64);
        }
        self.store
            .upsert_runtime_status(c.as_str(), "ok", "check_ok", None, now)
            .ok();
    }

    /// Returns the consecutive failure count.
    fn record_failure(&self, c: Component, err: &anyhow::Error, interval_secs: u64) -> u32 {
        let now = now_ts();
        let count = {
            let mut h = self.health(c).write();
            h.error_count += 1;
            h.last_error = Some(format!("{err:#}"));
            h.next_check_ts = Some(now + interval_secs as f64);
            h.error_count
        };
        log::error!("{}.check_failed consecutive={} err={:#}", c.as_str(), count, err);
        self.store
            .upsert_runtime_status(c.as_str(), "error", "check_failed", Some(&format!("{err:#}")), now)
            .ok();
        count
    }

    async fn system_email(&self, title: &str, message: &str, level: &str) {
        if let Err(e) = self.mailer.send(&system_alert_email(title, message, level)).await {
            log::warn!("email.system_failed title={:?} err={:#}", title, e);
        }
        self.store
            .insert_alert(
                AlertType::System,
                &NewAlert {
                    title: title.to_string(),
                    message: message.to_string(),
                    detail: serde_json::json!({"level": level}),
                    ..Default::default()
                },
                now_ts(),
            )
            .ok();
    }

    async fn set_running(&self, c: Component, running: bool, reason: &str) {
        {
            let mut h = self.health(c).write();
            h.is_running = running;
            if running {
                h.started_ts = Some(now_ts());
            } else {
                h.next_check_ts = None;
            }
        }
        let status = if running { "started" } else { "stopped" };
        let message = format!("{} {}: {}", c.label(), status, reason);
        self.hub.publish(
            EventKind::SystemStatus,
            serde_json::json!({"status": status, "component": c.as_str(), "message": message}),
        );
        self.store
            .upsert_runtime_status(c.as_str(), if running { "ok" } else { "warn" }, status, Some(reason), now_ts())
            .ok();
        log::info!("{}.{} reason={}", c.as_str(), status, reason);
        self.system_email(&format!("{} {}", c.label(), status), &message, if running { "info" } else { "warning" })
            .await;
    }

    /// Applies the failure policy; true means the loop must stop.
    async fn escalate(&self, c: Component, count: u32, notify_at: u32, err: &anyhow::Error) -> bool {
        match escalation_for(count, notify_at, STOP_AFTER) {
            Escalation::None => false,
            Escalation::Notify => {
                let message = format!("{count} consecutive failures: {err:#}");
                self.hub.publish(
                    EventKind::SystemStatus,
                    serde_json::json!({"status": "error", "component": c.as_str(), "message": message}),
                );
                self.system_email(&format!("{} failing", c.label()), &message, "error").await;
                false
            }
            Escalation::Stop => {
                self.set_running(c, false, &format!("{count} consecutive failures")).await;
                true
            }
        }
    }

    // ---- DART -----------------------------------------------------------

    pub async fn run_dart_check(&self) -> Result<CheckOutcome> {
        let _guard = self.dart_lock.lock().await;
        let interval = self.settings.dart_check_interval_secs;
        let hours = self.market_hours();
        let day = compact_day(&hours.now());
        match self.dart.check(&day).await {
            Ok(o) => {
                self.record_success(Component::Dart, interval);
                log::info!(
                    "dart.check.done day={} fetched={} watched={} alerts={} high={} emails={}",
                    day,
                    o.fetched,
                    o.watched,
                    o.alerts,
                    o.high_priority,
                    o.emails_sent
                );
                if o.alerts > 0 {
                    self.hub.publish(
                        EventKind::SystemStatus,
                        serde_json::json!({
                            "status": "completed",
                            "component": "dart",
                            "message": format!("{} new disclosure alerts", o.alerts),
                            "alerts": o.alerts,
                            "high_priority": o.high_priority,
                        }),
                    );
                }
                if o.high_priority > 0 {
                    self.system_email(
                        "High priority disclosures",
                        &format!("{} high priority disclosures found for {}", o.high_priority, day),
                        "info",
                    )
                    .await;
                }
                Ok(o)
            }
            Err(e) => {
                self.record_failure(Component::Dart, &e, interval);
                Err(e)
            }
        }
    }

    async fn dart_loop(self, mut shutdown: watch::Receiver<bool>) {
        if !self.dart.is_configured() {
            log::warn!("dart.disabled reason=no_api_key");
            self.store
                .upsert_runtime_status("dart", "warn", "disabled", Some("DART_API_KEY not set"), now_ts())
                .ok();
            return;
        }
        let interval = Duration::from_secs(self.settings.dart_check_interval_secs);
        let first = Duration::from_secs(self.settings.dart_initial_delay_secs);
        self.set_running(Component::Dart, true, "scheduled").await;
        self.dart_health.write().next_check_ts = Some(now_ts() + first.as_secs_f64());

        let mut tick = tokio::time::interval_at(Instant::now() + first, interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(e) = self.run_dart_check().await {
                let count = self.dart_health.read().error_count;
                if self.escalate(Component::Dart, count, DART_NOTIFY_AFTER, &e).await {
                    break;
                }
            }
        }
        self.dart_health.write().is_running = false;
    }

    // ---- stocks ---------------------------------------------------------

    /// Refreshes quotes and evaluates alerts. Outside trading hours this is a
    /// no-op unless `force` is set.
    pub async fn run_stock_check(&self, force: bool) -> Result<StockCheckOutcome> {
        let _guard = self.stock_lock.lock().await;
        let ss = self.stock_settings();
        let hours = self.market_hours();
        if !force && !hours.is_trading_hours(&hours.now()) {
            return Ok(StockCheckOutcome {
                skipped: true,
                ..Default::default()
            });
        }
        match self.stock_check_inner(&ss).await {
            Ok(o) => {
                self.record_success(Component::Stock, ss.check_interval);
                if o.alerts > 0 {
                    log::info!(
                        "stock.check.done stocks={} quotes={} alerts={} emails={}",
                        o.stocks,
                        o.quotes,
                        o.alerts,
                        o.emails_sent
                    );
                }
                Ok(o)
            }
            Err(e) => {
                self.record_failure(Component::Stock, &e, ss.check_interval);
                Err(e)
            }
        }
    }

    async fn stock_check_inner(&self, ss: &StockMonitorSettings) -> Result<StockCheckOutcome> {
        let stocks = self.store.fetch_stocks()?;
        let mut out = StockCheckOutcome {
            stocks: stocks.len(),
            ..Default::default()
        };
        if stocks.is_empty() {
            return Ok(out);
        }
        let codes: Vec<String> = stocks.iter().map(|s| s.code.clone()).collect();
        let quotes = self.fetch_quotes(&codes, ss).await;
        if quotes.is_empty() {
            return Err(anyhow!("no quotes returned for {} stocks", codes.len()));
        }
        out.quotes = quotes.len();
        let by_code: HashMap<&str, &Quote> = quotes.iter().map(|q| (q.code.as_str(), q)).collect();

        for stock in &stocks {
            let Some(q) = by_code.get(stock.code.as_str()) else {
                continue;
            };
            self.store
                .update_stock_quote(&stock.code, q.current_price, q.change_rate, q.updated_ts)?;
            self.hub.publish(
                EventKind::StockUpdate,
                serde_json::json!({
                    "type": "price_update",
                    "code": stock.code,
                    "name": stock.name,
                    "current_price": q.current_price,
                    "change": q.change,
                    "change_rate": q.change_rate,
                    "volume": q.volume,
                    "parity": stock.parity_at(q.current_price),
                }),
            );

            let fired = self.store.fired_alert_ids(&stock.code)?;
            for alert in evaluate(stock, q, &self.settings.parity_levels, &fired) {
                out.alerts += 1;
                if self.deliver_stock_alert(stock, &alert, ss).await? {
                    out.emails_sent += 1;
                }
            }
        }
        Ok(out)
    }

    /// Retries the codes that failed, up to `retry_attempts` rounds, each
    /// bounded by `timeout_seconds`.
    async fn fetch_quotes(&self, codes: &[String], ss: &StockMonitorSettings) -> Vec<Quote> {
        let mut got: Vec<Quote> = Vec::with_capacity(codes.len());
        let mut missing: Vec<String> = codes.to_vec();
        let limit = Duration::from_secs(ss.timeout_seconds.max(1));
        for round in 0..ss.retry_attempts.max(1) {
            if missing.is_empty() {
                break;
            }
            if round > 0 {
                log::debug!("stock.fetch_retry round={} missing={}", round, missing.len());
            }
            let batch = match tokio::time::timeout(limit, fetch_many(self.quotes.as_ref(), &missing)).await {
                Ok(b) => b,
                Err(_) => {
                    log::warn!("stock.fetch_timeout round={} secs={}", round, limit.as_secs());
                    Vec::new()
                }
            };
            missing.retain(|c| !batch.iter().any(|q| &q.code == c));
            got.extend(batch);
        }
        got
    }

    /// Marks, records and broadcasts one alert; true when an email went out.
    async fn deliver_stock_alert(
        &self,
        stock: &MonitoringStock,
        a: &TriggeredAlert,
        ss: &StockMonitorSettings,
    ) -> Result<bool> {
        let ts = now_ts();
        self.store
            .mark_alert_fired(&stock.code, &a.alert_id, ts)?;
        self.store.insert_alert(
            AlertType::Stock,
            &NewAlert {
                title: format!("{} {}", stock.name, a.kind.label()),
                message: a.message.clone(),
                stock_code: Some(stock.code.clone()),
                stock_name: Some(stock.name.clone()),
                price: Some(a.current_price),
                change_rate: Some(a.change_rate),
                detail: serde_json::json!({
                    "alert_id": a.alert_id,
                    "alert_type": a.kind,
                    "target_price": a.target_price,
                    "parity": a.parity,
                }),
            },
            ts,
        )?;
        log::info!(
            "stock.alert code={} id={} price={} target={}",
            stock.code,
            a.alert_id,
            a.current_price,
            a.target_price
        );

        if ss.enable_websocket_alerts {
            let mut data = serde_json::to_value(a)?;
            if let Some(obj) = data.as_object_mut() {
                obj.insert("type".into(), "alert".into());
                obj.insert("alert_type".into(), a.kind.as_str().into());
            }
            self.hub.publish(EventKind::StockUpdate, data.clone());
            if a.kind.is_important() {
                self.hub.publish(EventKind::AlertTriggered, data);
            }
        }

        if !ss.enable_email_alerts || !self.mailer.enabled() {
            return Ok(false);
        }
        Ok(self.send_budgeted(&stock_alert_email(a), ss.max_alerts_per_day, &stock.code).await)
    }

    /// Only delivered emails count against `max_per_day`. Checks are serialised
    /// by `stock_lock`, so the budget cannot be overrun between check and send.
    async fn send_budgeted(&self, email: &EmailMessage, max_per_day: u64, code: &str) -> bool {
        if self.stock_health.read().alerts_sent_today >= max_per_day {
            log::warn!("stock.email_budget_exhausted max={}", max_per_day);
            return false;
        }
        match self.mailer.send(email).await {
            Ok(true) => {
                self.stock_health.write().alerts_sent_today += 1;
                true
            }
            Ok(false) => false,
            Err(e) => {
                log::warn!("stock.email_failed code={} err={:#}", code, e);
                false
            }
        }
    }

    async fn stock_loop(self, mut shutdown: watch::Receiver<bool>) {
        let first = Duration::from_secs(self.settings.stock_initial_delay_secs);
        let mut interval_rx = self.interval_tx.subscribe();
        self.set_running(Component::Stock, true, "scheduled").await;

        let mut period = Duration::from_secs((*interval_rx.borrow_and_update()).max(1));
        let mut tick = tokio::time::interval_at(Instant::now() + first, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                changed = interval_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    period = Duration::from_secs((*interval_rx.borrow_and_update()).max(1));
                    tick = tokio::time::interval_at(Instant::now() + period, period);
                    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    continue;
                }
                _ = shutdown.changed() => break,
            }
            if let Err(e) = self.run_stock_check(false).await {
                let count = self.stock_health.read().error_count;
                if self.escalate(Component::Stock, count, STOCK_NOTIFY_AFTER, &e).await {
                    break;
                }
            }
        }
        self.stock_health.write().is_running = false;
    }

    // ---- market clock ---------------------------------------------------

    pub async fn observe_market(&self, info: &MarketInfo) -> Option<MarketTransition> {
        let prev = self.market_status.write().replace(info.status);
        let t = market_transition(prev, info.status)?;
        match t {
            MarketTransition::Opened => {
                self.hub.system_status("market_opened", &format!("market opened at {}", info.current_time));
                log::info!("market.opened at={}", info.current_time);
            }
            MarketTransition::Closed => {
                self.hub.system_status("market_closed", &format!("market closed at {}", info.current_time));
                log::info!("market.closed at={}", info.current_time);
                self.send_daily_summary(&info.trading_day).await;
            }
        }
        Some(t)
    }

    pub async fn send_daily_summary(&self, day: &str) {
        let stocks = match self.store.fetch_stocks() {
            Ok(s) => s,
            Err(e) => {
                log::warn!("summary.load_failed err={:#}", e);
                return;
            }
        };
        if stocks.is_empty() {
            return;
        }
        if let Err(e) = self.mailer.send(&daily_summary_email(&stocks, day)).await {
            log::warn!("summary.email_failed err={:#}", e);
        }
    }

    async fn market_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => break,
            }
            let info = self.market_info();
            self.observe_market(&info).await;
        }
    }

    pub fn daily_reset(&self) -> Result<usize> {
        let cleared = self.store.clear_fired_alerts()?;
        self.stock_health.write().alerts_sent_today = 0;
        self.dart_health.write().alerts_sent_today = 0;
        self.hub.system_status("daily_reset", "alert markers cleared for the new day");
        log::info!("monitor.daily_reset cleared={}", cleared);
        Ok(cleared)
    }

    async fn midnight_loop(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let hours = self.market_hours();
            let wait = until_next_midnight(&hours.now()) + Duration::from_secs(1);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => break,
            }
            if let Err(e) = self.daily_reset() {
                log::error!("monitor.daily_reset_failed err={:#}", e);
            }
        }
    }

    // ---- statistics -----------------------------------------------------

    fn today_start_ts(&self) -> f64 {
        let now = self.market_hours().now();
        start_of_day(&now).map(|d| local_to_ts(&d)).unwrap_or_else(now_ts)
    }

    pub fn dart_statistics(&self) -> Result<DartStatistics> {
        let now = self.market_hours().now();
        let week_ago = compact_day(&(now - chrono::Duration::days(7)));
        let companies = self.store.fetch_companies()?;
        let keywords = self.store.fetch_keywords()?;
        let h = self.dart_health();
        Ok(DartStatistics {
            configured: self.dart.is_configured(),
            is_running: h.is_running,
            processed_count: self.store.processed_count()?,
            week_disclosures: self.store.count_matched_disclosures_since(&week_ago)?,
            today_alerts: self.store.count_alerts_since(AlertType::Dart, self.today_start_ts())?,
            companies: companies.len(),
            active_companies: companies.iter().filter(|c| c.is_active).count(),
            keywords: keywords.len(),
            active_keywords: keywords.iter().filter(|k| k.is_active).count(),
            last_check_ts: h.last_check_ts,
            next_check_ts: h.next_check_ts,
        })
    }

    pub fn stock_statistics(&self) -> Result<StockStatistics> {
        let stocks = self.store.fetch_stocks()?;
        Ok(StockStatistics {
            total_stocks: stocks.len(),
            active_alerts: stocks.iter().filter(|s| s.alert_enabled).count(),
            today_alerts: self.store.count_alerts_since(AlertType::Stock, self.today_start_ts())?,
            alerts_sent_today: self.stock_health.read().alerts_sent_today,
            market_status: self.market_info().status,
            last_update_ts: stocks.iter().filter_map(|s| s.updated_ts).reduce(f64::max),
            totals: portfolio_totals(&stocks),
        })
    }

    /// Watched companies and monitored stocks whose name or code contains
    /// `q`, with a live quote where one is available.
    pub async fn search_stocks(&self, q: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let needle = q.trim().to_lowercase();
        let mut hits: Vec<(String, String)> = Vec::new();
        let candidates = self
            .store
            .fetch_stocks()?
            .into_iter()
            .map(|s| (s.code, s.name))
            .chain(
                self.store
                    .fetch_companies()?
                    .into_iter()
                    .map(|c| (c.stock_code, c.corp_name)),
            );
        for (code, name) in candidates {
            if hits.len() >= limit {
                break;
            }
            let matched = name.to_lowercase().contains(&needle) || code.contains(&needle);
            if matched && !code.is_empty() && !hits.iter().any(|(c, _)| *c == code) {
                hits.push((code, name));
            }
        }
        let codes: Vec<String> = hits.iter().map(|(c, _)| c.clone()).collect();
        let quotes = fetch_many(self.quotes.as_ref(), &codes).await;
        Ok(hits
            .into_iter()
            .map(|(code, name)| {
                let q = quotes.iter().find(|q| q.code == code);
                SearchResult {
                    current_price: q.map(|q| q.current_price),
                    change_rate: q.map(|q| q.change_rate),
                    code,
                    name,
                }
            })
            .collect())
    }

    // ---- health ---------------------------------------------------------

    /// Components that have fallen behind their schedule.
    pub fn stale_components(&self, now: f64) -> Vec<&'static str> {
        let mut out = Vec::new();
        let dart = self.dart_health();
        let dart_max = 2.0 * self.settings.dart_check_interval_secs as f64
            + self.settings.dart_initial_delay_secs as f64;
        if dart.is_running && is_stale(dart.last_check_ts, dart.started_ts, now, dart_max) {
            out.push("dart");
        }
        let stock = self.stock_health();
        let ss = self.stock_settings();
        let hours = self.market_hours();
        let stock_max = 3.0 * ss.check_interval as f64 + self.settings.stock_initial_delay_secs as f64;
        if stock.is_running
            && hours.is_trading_hours(&hours.now())
            && is_stale(stock.last_check_ts, stock.started_ts, now, stock_max)
        {
            out.push("stock");
        }
        out
    }

    async fn health_loop(self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.settings.health_check_secs);
        let mut tick = tokio::time::interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => break,
            }
            let now = now_ts();
            for c in self.stale_components(now) {
                log::warn!("{}.health.stale", c);
                self.store
                    .upsert_runtime_status(c, "warn", "stale", Some("no recent successful check"), now)
                    .ok();
            }
        }
    }

    /// Starts every background loop; they exit when `shutdown` flips.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let hub_ping = Duration::from_secs(self.settings.ws_ping_secs);
        vec![
            tokio::spawn(self.clone().dart_loop(shutdown.clone())),
            tokio::spawn(self.clone().stock_loop(shutdown.clone())),
            tokio::spawn(self.clone().market_loop(shutdown.clone())),
            tokio::spawn(self.clone().midnight_loop(shutdown.clone())),
            tokio::spawn(self.clone().health_loop(shutdown.clone())),
            tokio::spawn(run_pinger(self.hub.clone(), hub_ping, shutdown)),
        ]
    }
}


#[cfg(test)]
mod tests {
    use super::testing::monitor;
    use super::*;
    use crate::stocks::testing::stock;

    #[test]
    fn escalation_thresholds() {
        assert_eq!(escalation_for(1, 3, 10), Escalation::None);
        assert_eq!(escalation_for(3, 3, 10), Escalation::Notify);
        assert_eq!(escalation_for(4, 3, 10), Escalation::None);
        assert_eq!(escalation_for(10, 3, 10), Escalation::Stop);
        assert_eq!(escalation_for(12, 5, 10), Escalation::Stop);
    }

    #[test]
    fn market_transitions() {
        use MarketStatus::*;
        assert_eq!(market_transition(None, Open), None);
        assert_eq!(market_transition(Some(PreMarket), Open), Some(MarketTransition::Opened));
        assert_eq!(market_transition(Some(Open), AfterMarket), Some(MarketTransition::Closed));
        assert_eq!(market_transition(Some(Open), Open), None);
        assert_eq!(market_transition(Some(AfterMarket), Closed), None);
    }

    #[test]
    fn staleness() {
        assert!(!is_stale(None, None, 100.0, 10.0));
        assert!(is_stale(None, Some(0.0), 100.0, 10.0));
        assert!(!is_stale(Some(95.0), Some(0.0), 100.0, 10.0));
    }

    #[test]
    fn stock_settings_validation() {
        let s = StockMonitorSettings::defaults(&testing::test_settings());
        assert!(s.validate().is_ok());
        assert!(StockMonitorSettings { check_interval: 0, ..s.clone() }.validate().is_err());
        assert!(StockMonitorSettings { market_open: "16:00".into(), ..s.clone() }.validate().is_err());
    }

    #[tokio::test]
    async fn forced_check_fires_and_dedups_alerts() {
        let (_dir, m, quotes) = monitor();
        let mut s = stock("005930", 70_000.0, 10);
        s.take_profit = Some(80_000.0);
        m.store.insert_stock(&s).unwrap();
        m.store.insert_stock(&stock("035720", 40_000.0, 5)).unwrap();
        quotes.set("005930", 80_500.0, 80_000.0);
        quotes.set("035720", 43_000.0, 40_000.0);

        let mut rx = m.hub.subscribe();
        let o = m.run_stock_check(true).await.unwrap();
        assert!(!o.skipped);
        assert_eq!(o.quotes, 2);
        assert_eq!(o.alerts, 2);

        let mut kinds = Vec::new();
        while let Ok(raw) = rx.try_recv() {
            let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
            kinds.push(format!("{}:{}", v["type"].as_str().unwrap(), v["data"]["type"].as_str().unwrap_or("")));
        }
        assert!(kinds.contains(&"stock_update:price_update".to_string()));
        assert!(kinds.contains(&"stock_update:alert".to_string()));
        assert!(kinds.contains(&"alert_triggered:alert".to_string()));

        let again = m.run_stock_check(true).await.unwrap();
        assert_eq!(again.alerts, 0);

        let saved = m.store.fetch_stock("005930").unwrap().unwrap();
        assert_eq!(saved.current_price, Some(80_500.0));
        let page = m.store.fetch_alerts(Some(AlertType::Stock), 0.0, 0, 10).unwrap();
        assert_eq!(page.total_count, 2);

        // Both thresholds still hold on the next day and fire again.
        assert_eq!(m.daily_reset().unwrap(), 2);
        assert_eq!(m.run_stock_check(true).await.unwrap().alerts, 2);
        let fired = m.store.fired_alert_ids("005930").unwrap();
        assert!(fired.contains("take_profit_80000"));
        assert_eq!(m.run_stock_check(true).await.unwrap().alerts, 0);
        assert_eq!(m.stock_health().check_count, 4);
    }

    #[tokio::test]
    async fn failed_email_does_not_spend_the_budget() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let (_dir, m, quotes) = testing::monitor_with(Hub::new(4), Mailer::unreachable(port));
        let mut s = stock("005930", 70_000.0, 10);
        s.stop_loss = Some(65_000.0);
        m.store.insert_stock(&s).unwrap();
        quotes.set("005930", 64_000.0, 64_500.0);

        let o = m.run_stock_check(true).await.unwrap();
        assert_eq!(o.alerts, 1);
        assert_eq!(o.emails_sent, 0);
        assert_eq!(m.stock_health().alerts_sent_today, 0);
    }

    #[tokio::test]
    async fn failed_checks_count_consecutively() {
        let (_dir, m, _quotes) = monitor();
        m.store.insert_stock(&stock("005930", 70_000.0, 10)).unwrap();
        assert!(m.run_stock_check(true).await.is_err());
        assert!(m.run_stock_check(true).await.is_err());
        let h = m.stock_health();
        assert_eq!(h.error_count, 2);
        assert!(h.last_error.unwrap().contains("no quotes"));
    }

    #[tokio::test]
    async fn empty_watchlist_is_a_successful_check() {
        let (_dir, m, _quotes) = monitor();
        let o = m.run_stock_check(true).await.unwrap();
        assert_eq!(o.stocks, 0);
        assert_eq!(m.stock_health().error_count, 0);
    }

    #[tokio::test]
    async fn interval_update_persists_and_notifies() {
        let (_dir, m, _quotes) = monitor();
        let mut rx = m.hub.subscribe();
        let mut rx_interval = m.interval_tx.subscribe();
        let next = StockMonitorSettings { check_interval: 30, ..m.stock_settings() };
        m.update_stock_settings(next).unwrap();
        assert_eq!(*rx_interval.borrow_and_update(), 30);
        let v: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(v["data"]["status"], "interval_updated");
        let stored: StockMonitorSettings = m.store.get_setting(STOCK_SETTINGS_KEY).unwrap().unwrap();
        assert_eq!(stored.check_interval, 30);

        let bad = StockMonitorSettings { check_interval: 0, ..m.stock_settings() };
        assert!(m.update_stock_settings(bad).is_err());
        assert_eq!(m.stock_settings().check_interval, 30);
    }

    #[tokio::test]
    async fn statistics_and_search() {
        let (_dir, m, quotes) = monitor();
        let mut s = stock("005930", 70_000.0, 10);
        s.name = "삼성전자".into();
        m.store.insert_stock(&s).unwrap();
        quotes.set("005930", 77_000.0, 75_000.0);
        m.run_stock_check(true).await.unwrap();

        let st = m.stock_statistics().unwrap();
        assert_eq!(st.total_stocks, 1);
        assert_eq!(st.active_alerts, 1);
        assert_eq!(st.totals.total_profit_loss, 70_000.0);

        let found = m.search_stocks("삼성", 20).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].current_price, Some(77_000.0));
        let found = m.search_stocks("0357", 20).await.unwrap();
        assert_eq!(found[0].name, "카카오");
        assert_eq!(found[0].current_price, None);

        let ds = m.dart_statistics().unwrap();
        assert!(!ds.configured);
        assert_eq!(ds.companies, 2);
    }

    #[tokio::test]
    async fn market_observation_emits_transitions() {
        let (_dir, m, _quotes) = monitor();
        let hours = MarketHours::parse("09:00", "15:35", 9).unwrap();
        let at = |h: u32| {
            use chrono::TimeZone;
            hours.info_at(&hours.tz.with_ymd_and_hms(2024, 3, 4, h, 0, 0).single().unwrap())
        };
        assert_eq!(m.observe_market(&at(8)).await, None);
        assert_eq!(m.observe_market(&at(10)).await, Some(MarketTransition::Opened));
        assert_eq!(m.observe_market(&at(11)).await, None);
        assert_eq!(m.observe_market(&at(16)).await, Some(MarketTransition::Closed));
    }
}
