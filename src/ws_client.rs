use std::fmt;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::Value as JsonValue;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::frame::coding::CloseCode, Message},
};

use crate::{
    dart::HIGH_PRIORITY_SCORE,
    hub::{Event, EventKind},
    stocks::AlertKind,
};

const PONG: &str = r#"{"type":"pong"}"#;

/// Exponential reconnect schedule: `base * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl Backoff {
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// `base_delay` plus up to 10% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let d = self.base_delay(attempt);
        let jitter: f64 = rand::rng().random_range(0.0..=0.1);
        d + d.mul_f64(jitter)
    }
}

/// Attempt counter that resets on every successful connect.
#[derive(Debug)]
pub struct Reconnect {
    backoff: Backoff,
    attempts: u32,
}

impl Reconnect {
    pub fn new(backoff: Backoff) -> Self {
        Self { backoff, attempts: 0 }
    }

    pub fn connected(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// `None` once the attempts are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.backoff.max_attempts {
            return None;
        }
        let d = self.backoff.delay(self.attempts);
        self.attempts += 1;
        Some(d)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Dart,
    Stock,
    System,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub source: Source,
    pub priority: Priority,
    pub title: String,
    pub message: String,
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let src = match self.source {
            Source::Dart => "DART",
            Source::Stock => "STOCK",
            Source::System => "SYSTEM",
        };
        let mark = if self.priority == Priority::High { "!" } else { " " };
        write!(f, "{mark} [{src}] {}: {}", self.title, self.message)
    }
}

fn field<'a>(data: &'a JsonValue, key: &str) -> &'a str {
    data.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

fn stock_notification(data: &JsonValue, force_high: bool) -> Notification {
    let kind = field(data, "alert_type");
    let important = [AlertKind::TakeProfit, AlertKind::StopLoss]
        .iter()
        .any(|k| k.as_str() == kind);
    Notification {
        source: Source::Stock,
        priority: if force_high || important { Priority::High } else { Priority::Normal },
        title: format!("{} {}", field(data, "name"), kind).trim().to_string(),
        message: field(data, "message").to_string(),
    }
}

/// Maps a feed event to something worth showing; routine traffic yields `None`.
pub fn classify(ev: &Event) -> Option<Notification> {
    let d = &ev.data;
    match ev.kind {
        EventKind::DartUpdate => {
            let score = d.get("priority_score").and_then(|v| v.as_u64()).unwrap_or(0);
            Some(Notification {
                source: Source::Dart,
                priority: if score >= u64::from(HIGH_PRIORITY_SCORE) {
                    Priority::High
                } else {
                    Priority::Normal
                },
                title: field(d, "corp_name").to_string(),
                message: field(d, "report_nm").to_string(),
            })
        }
        EventKind::StockUpdate if field(d, "type") == "alert" => Some(stock_notification(d, false)),
        EventKind::AlertTriggered => Some(stock_notification(d, true)),
        EventKind::SystemStatus if matches!(field(d, "status"), "error" | "stopped") => Some(Notification {
            source: Source::System,
            priority: Priority::High,
            title: field(d, "status").to_string(),
            message: field(d, "message").to_string(),
        }),
        EventKind::Error => Some(Notification {
            source: Source::System,
            priority: Priority::High,
            title: "error".to_string(),
            message: field(d, "message").to_string(),
        }),
        _ => None,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Normal,
    Dropped,
}

async fn session<F>(url: &str, reconnect: &mut Reconnect, on_notify: &mut F) -> Result<SessionEnd>
where
    F: FnMut(&Notification),
{
    let (ws, _) = connect_async(url)
        .await
        .with_context(|| format!("connect {url}"))?;
    reconnect.connected();
    log::info!("tail.connected url={}", url);
    let (mut write, mut read) = ws.split();

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(t)) => {
                let ev: Event = match serde_json::from_str(t.as_str()) {
                    Ok(ev) => ev,
                    Err(e) => {
                        log::debug!("tail.skip_frame err={}", e);
                        continue;
                    }
                };
                if ev.kind == EventKind::Ping {
                    if let Err(e) = write.send(Message::text(PONG.to_string())).await {
                        log::warn!("tail.pong_failed err={}", e);
                        return Ok(SessionEnd::Dropped);
                    }
                } else if let Some(n) = classify(&ev) {
                    on_notify(&n);
                }
            }
            Ok(Message::Ping(p)) => {
                let _ = write.send(Message::Pong(p)).await;
            }
            Ok(Message::Close(frame)) => {
                let code = frame.as_ref().map(|f| f.code);
                log::info!("tail.closed code={:?}", code);
                return Ok(if code == Some(CloseCode::Normal) {
                    SessionEnd::Normal
                } else {
                    SessionEnd::Dropped
                });
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("tail.read_error err={}", e);
                return Ok(SessionEnd::Dropped);
            }
        }
    }
    Ok(SessionEnd::Dropped)
}

/// Follows the server's event feed, reconnecting with `backoff` until the
/// server closes normally or the attempts run out.
pub async fn tail<F>(url: &str, backoff: Backoff, mut on_notify: F) -> Result<()>
where
    F: FnMut(&Notification),
{
    let mut reconnect = Reconnect::new(backoff);
    loop {
        match session(url, &mut reconnect, &mut on_notify).await {
            Ok(SessionEnd::Normal) => return Ok(()),
            Ok(SessionEnd::Dropped) => log::warn!("tail.dropped url={}", url),
            Err(e) => log::warn!("tail.connect_failed attempt={} err={:#}", reconnect.attempts(), e),
        }
        let Some(delay) = reconnect.next_delay() else {
            return Err(anyhow!(
                "gave up after {} reconnect attempts",
                backoff.max_attempts
            ));
        };
        log::info!("tail.reconnect in_ms={}", delay.as_millis());
        tokio::time::sleep(delay).await;
    }
}
