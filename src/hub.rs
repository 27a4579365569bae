use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::utils::now_ts;

const CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    DartUpdate,
    StockUpdate,
    AlertTriggered,
    SystemStatus,
    UserConnected,
    UserDisconnected,
    Error,
    Ping,
}

/// Wire envelope: `{"type": ..., "data": ..., "timestamp": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: JsonValue,
    pub timestamp: String,
}

impl Event {
    pub fn new(kind: EventKind, data: JsonValue) -> Self {
        Self {
            kind,
            data,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn encode(&self) -> Arc<str> {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","data":{"message":"encode failed"}}"#.to_string())
            .into()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("connection limit reached ({0})")]
pub struct HubFull(pub usize);

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub connected_ts: f64,
    pub last_seen_ts: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub total_connections: usize,
    pub max_connections: usize,
    pub connections: Vec<ConnectionInfo>,
}

struct HubInner {
    tx: broadcast::Sender<Arc<str>>,
    conns: RwLock<HashMap<Uuid, ConnectionInfo>>,
    max_connections: usize,
}

/// Fan-out of server events to every connected WebSocket.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new(max_connections: usize) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(HubInner {
                tx,
                conns: RwLock::new(HashMap::new()),
                max_connections,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.inner.tx.subscribe()
    }

    /// Claims a connection slot; the slot is released when the guard drops.
    pub fn register(&self) -> Result<ConnectionGuard, HubFull> {
        let mut conns = self.inner.conns.write();
        if conns.len() >= self.inner.max_connections {
            return Err(HubFull(self.inner.max_connections));
        }
        let id = Uuid::new_v4();
        let ts = now_ts();
        conns.insert(
            id,
            ConnectionInfo {
                id,
                connected_ts: ts,
                last_seen_ts: ts,
            },
        );
        Ok(ConnectionGuard {
            hub: self.clone(),
            id,
        })
    }

    fn unregister(&self, id: Uuid) {
        self.inner.conns.write().remove(&id);
    }

    pub fn touch(&self, id: Uuid) {
        if let Some(c) = self.inner.conns.write().get_mut(&id) {
            c.last_seen_ts = now_ts();
        }
    }

    pub fn is_idle(&self, id: Uuid, now: f64, idle_secs: f64) -> bool {
        self.inner
            .conns
            .read()
            .get(&id)
            .map(|c| now - c.last_seen_ts > idle_secs)
            .unwrap_or(true)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.conns.read().len()
    }

    /// Returns the number of sockets that will see the event.
    pub fn publish(&self, kind: EventKind, data: JsonValue) -> usize {
        self.inner.tx.send(Event::new(kind, data).encode()).unwrap_or(0)
    }

    pub fn system_status(&self, status: &str, message: &str) -> usize {
        self.publish(
            EventKind::SystemStatus,
            serde_json::json!({"status": status, "message": message}),
        )
    }

    pub fn stats(&self) -> HubStats {
        let conns = self.inner.conns.read();
        let mut list: Vec<ConnectionInfo> = conns.values().cloned().collect();
        list.sort_by(|a, b| a.connected_ts.total_cmp(&b.connected_ts));
        HubStats {
            total_connections: conns.len(),
            max_connections: self.inner.max_connections,
            connections: list,
        }
    }
}

pub struct ConnectionGuard {
    hub: Hub,
    pub id: Uuid,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}

/// Broadcasts `ping` every `every` until shutdown.
pub async fn run_pinger(hub: Hub, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                if hub.connection_count() > 0 {
                    hub.publish(EventKind::Ping, serde_json::json!({"ts": now_ts()}));
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_enforces_cap_and_releases_on_drop() {
        let hub = Hub::new(2);
        let a = hub.register().unwrap();
        let _b = hub.register().unwrap();
        assert!(matches!(hub.register(), Err(HubFull(2))));
        drop(a);
        assert_eq!(hub.connection_count(), 1);
        assert!(hub.register().is_ok());
    }

    #[test]
    fn publish_wraps_events_in_envelope() {
        let hub = Hub::new(4);
        assert_eq!(hub.publish(EventKind::Ping, serde_json::json!({})), 0);

        let mut rx = hub.subscribe();
        assert_eq!(hub.system_status("started", "monitor up"), 1);
        let raw = rx.try_recv().unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["type"], "system_status");
        assert_eq!(v["data"]["status"], "started");
        assert!(v["timestamp"].as_str().is_some());
    }

    #[test]
    fn idle_detection_uses_last_seen() {
        let hub = Hub::new(1);
        let g = hub.register().unwrap();
        let now = now_ts();
        assert!(!hub.is_idle(g.id, now, 300.0));
        assert!(hub.is_idle(g.id, now + 301.0, 300.0));
        hub.touch(g.id);
        assert!(!hub.is_idle(g.id, now + 1.0, 300.0));
        assert!(hub.is_idle(Uuid::new_v4(), now, 300.0));

        let stats = hub.stats();
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.max_connections, 1);
    }
}
