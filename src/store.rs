use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{
    dart::{Disclosure, KeywordTier, ScoredDisclosure, WatchedCompany, WatchedKeyword},
    stocks::{CustomAlert, MonitoringStock, StockCategory},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Dart,
    Stock,
    System,
}

impl AlertType {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertType::Dart => "dart",
            AlertType::Stock => "stock",
            AlertType::System => "system",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewAlert {
    pub title: String,
    pub message: String,
    pub stock_code: Option<String>,
    pub stock_name: Option<String>,
    pub price: Option<f64>,
    pub change_rate: Option<f64>,
    pub detail: JsonValue,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AlertRecord {
    pub id: i64,
    pub alert_type: String,
    pub title: String,
    pub message: String,
    pub stock_code: Option<String>,
    pub stock_name: Option<String>,
    pub price: Option<f64>,
    pub change_rate: Option<f64>,
    pub detail: JsonValue,
    pub is_read: bool,
    pub created_ts: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertPage {
    pub items: Vec<AlertRecord>,
    pub total_count: i64,
    pub unread_count: i64,
}

#[derive(Debug, Clone, Default)]
pub struct DisclosureFilter {
    /// Inclusive lower bound on `rcept_dt` (`YYYYMMDD`).
    pub since_day: String,
    pub keyword: Option<String>,
    pub company: Option<String>,
    pub offset: u32,
    pub limit: u32,
}

#[derive(Clone)]
pub struct SqliteStore {
    path: String,
}

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self> {
        if path.trim().is_empty() {
            anyhow::bail!("SQLITE_PATH is empty");
        }
        if path != ":memory:" && !path.starts_with("file:") {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create sqlite parent dir for {path}"))?;
            }
        }
        // rusqlite::Connection is not Send/Sync; each operation opens its own.
        Ok(Self { path: path.to_string() })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn open_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).with_context(|| format!("open sqlite {}", self.path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Ok(conn)
    }

    pub fn init_db(&self) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS alert_history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  alert_type TEXT NOT NULL,
  title TEXT NOT NULL,
  message TEXT NOT NULL,
  stock_code TEXT,
  stock_name TEXT,
  price REAL,
  change_rate REAL,
  detail_json TEXT,
  is_read INTEGER NOT NULL DEFAULT 0,
  created_ts REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_alert_type_ts ON alert_history(alert_type, created_ts);

CREATE TABLE IF NOT EXISTS processed_disclosures (
  rcept_no TEXT PRIMARY KEY,
  processed_ts REAL
);

CREATE INDEX IF NOT EXISTS idx_processed_ts ON processed_disclosures(processed_ts);

CREATE TABLE IF NOT EXISTS disclosures (
  rcept_no TEXT PRIMARY KEY,
  corp_cls TEXT,
  corp_code TEXT,
  corp_name TEXT,
  stock_code TEXT,
  report_nm TEXT,
  rcept_dt TEXT,
  flr_nm TEXT,
  rm TEXT,
  matched_keywords_json TEXT,
  priority_score INTEGER,
  dart_url TEXT,
  fetched_ts REAL
);

CREATE INDEX IF NOT EXISTS idx_disclosures_dt ON disclosures(rcept_dt);

CREATE TABLE IF NOT EXISTS dart_keywords (
  keyword TEXT PRIMARY KEY,
  weight REAL,
  category TEXT,
  is_active INTEGER
);

CREATE TABLE IF NOT EXISTS dart_companies (
  stock_code TEXT PRIMARY KEY,
  corp_code TEXT,
  corp_name TEXT,
  is_active INTEGER,
  last_checked_ts REAL
);

CREATE TABLE IF NOT EXISTS monitoring_stocks (
  code TEXT PRIMARY KEY,
  name TEXT,
  acquisition_price REAL,
  quantity INTEGER,
  take_profit REAL,
  stop_loss REAL,
  daily_surge_threshold REAL,
  daily_drop_threshold REAL,
  alert_enabled INTEGER,
  category TEXT,
  conversion_price REAL,
  conversion_price_floor REAL,
  custom_alerts_json TEXT,
  current_price REAL,
  change_rate REAL,
  updated_ts REAL,
  created_ts REAL,
  prev_price REAL
);

CREATE TABLE IF NOT EXISTS triggered_alerts (
  code TEXT,
  alert_id TEXT,
  fired_ts REAL,
  PRIMARY KEY(code, alert_id)
);

CREATE TABLE IF NOT EXISTS settings_kv (
  key TEXT PRIMARY KEY,
  value_json TEXT,
  updated_ts REAL
);

CREATE TABLE IF NOT EXISTS runtime_status (
  component TEXT PRIMARY KEY,
  ts REAL,
  level TEXT,
  message TEXT,
  detail TEXT
);
"#,
        )?;
        Ok(())
    }

    // ---- runtime status -------------------------------------------------

    pub fn upsert_runtime_status(
        &self,
        component: &str,
        level: &str,
        message: &str,
        detail: Option<&str>,
        ts: f64,
    ) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute(
            r#"
INSERT INTO runtime_status(component, ts, level, message, detail)
VALUES(?,?,?,?,?)
ON CONFLICT(component) DO UPDATE SET
  ts=excluded.ts,
  level=excluded.level,
  message=excluded.message,
  detail=excluded.detail
"#,
            params![component, ts, level, message, detail],
        )?;
        Ok(())
    }

    pub fn fetch_runtime_statuses(&self) -> Result<JsonValue> {
        let conn = self.open_conn()?;
        let mut stmt =
            conn.prepare("SELECT component, ts, level, message, detail FROM runtime_status ORDER BY component")?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                serde_json::json!({
                    "ts": r.get::<_, Option<f64>>(1)?,
                    "level": r.get::<_, Option<String>>(2)?,
                    "message": r.get::<_, Option<String>>(3)?,
                    "detail": r.get::<_, Option<String>>(4)?,
                }),
            ))
        })?;
        let mut out = serde_json::Map::new();
        for row in rows {
            let (k, v) = row?;
            out.insert(k, v);
        }
        Ok(JsonValue::Object(out))
    }

    // ---- settings -------------------------------------------------------

    pub fn get_setting<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let conn = self.open_conn()?;
        let raw: Option<String> = conn
            .query_row("SELECT value_json FROM settings_kv WHERE key=?", params![key], |r| r.get(0))
            .optional()?;
        match raw {
            None => Ok(None),
            Some(s) => Ok(Some(
                serde_json::from_str(&s).with_context(|| format!("decode setting {key}"))?,
            )),
        }
    }

    pub fn put_setting<T: Serialize>(&self, key: &str, value: &T, ts: f64) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute(
            r#"
INSERT INTO settings_kv(key, value_json, updated_ts) VALUES(?,?,?)
ON CONFLICT(key) DO UPDATE SET value_json=excluded.value_json, updated_ts=excluded.updated_ts
"#,
            params![key, serde_json::to_string(value)?, ts],
        )?;
        Ok(())
    }

    // ---- alert history --------------------------------------------------

    pub fn insert_alert(&self, alert_type: AlertType, a: &NewAlert, ts: f64) -> Result<i64> {
        let conn = self.open_conn()?;
        conn.execute(
            r#"
INSERT INTO alert_history(
  alert_type, title, message, stock_code, stock_name, price, change_rate, detail_json, is_read, created_ts
)
VALUES(?,?,?,?,?,?,?,?,0,?)
"#,
            params![
                alert_type.as_str(),
                a.title,
                a.message,
                a.stock_code,
                a.stock_name,
                a.price,
                a.change_rate,
                serde_json::to_string(&a.detail)?,
                ts
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn fetch_alerts(
        &self,
        alert_type: Option<AlertType>,
        since_ts: f64,
        offset: u32,
        limit: u32,
    ) -> Result<AlertPage> {
        let conn = self.open_conn()?;
        let kind = alert_type.map(|t| t.as_str());
        let (total_count, unread_count): (i64, i64) = conn.query_row(
            r#"
SELECT COUNT(*), COALESCE(SUM(CASE WHEN is_read=0 THEN 1 ELSE 0 END), 0)
FROM alert_history
WHERE (?1 IS NULL OR alert_type=?1) AND created_ts >= ?2
"#,
            params![kind, since_ts],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let mut stmt = conn.prepare(
            r#"
SELECT id, alert_type, title, message, stock_code, stock_name, price, change_rate, detail_json, is_read, created_ts
FROM alert_history
WHERE (?1 IS NULL OR alert_type=?1) AND created_ts >= ?2
ORDER BY created_ts DESC, id DESC
LIMIT ?3 OFFSET ?4
"#,
        )?;
        let items = stmt
            .query_map(params![kind, since_ts, limit, offset], alert_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(AlertPage {
            items,
            total_count,
            unread_count,
        })
    }

    /// False when no alert of that type has the id.
    pub fn mark_alert_read(&self, alert_type: AlertType, id: i64) -> Result<bool> {
        let conn = self.open_conn()?;
        let n = conn.execute(
            "UPDATE alert_history SET is_read=1 WHERE id=? AND alert_type=?",
            params![id, alert_type.as_str()],
        )?;
        Ok(n > 0)
    }

    pub fn count_alerts_since(&self, alert_type: AlertType, since_ts: f64) -> Result<i64> {
        let conn = self.open_conn()?;
        let n = conn.query_row(
            "SELECT COUNT(*) FROM alert_history WHERE alert_type=? AND created_ts >= ?",
            params![alert_type.as_str(), since_ts],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    // ---- disclosures ----------------------------------------------------

    /// Receipt numbers from `ids` that were already processed.
    pub fn processed_among(&self, ids: &[String]) -> Result<HashSet<String>> {
        let conn = self.open_conn()?;
        let mut stmt = conn.prepare("SELECT 1 FROM processed_disclosures WHERE rcept_no=?")?;
        let mut out = HashSet::new();
        for id in ids {
            if stmt.exists(params![id])? {
                out.insert(id.clone());
            }
        }
        Ok(out)
    }

    pub fn mark_processed(&self, ids: &[String], ts: f64) -> Result<()> {
        let mut conn = self.open_conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("INSERT OR IGNORE INTO processed_disclosures(rcept_no, processed_ts) VALUES(?,?)")?;
            for id in ids {
                stmt.execute(params![id, ts])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn processed_count(&self) -> Result<i64> {
        let conn = self.open_conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM processed_disclosures", [], |r| r.get(0))?)
    }

    /// Keeps the newest `keep` receipts; returns how many were dropped.
    pub fn prune_processed(&self, keep: u32) -> Result<usize> {
        let conn = self.open_conn()?;
        let n = conn.execute(
            r#"
DELETE FROM processed_disclosures WHERE rcept_no NOT IN (
  SELECT rcept_no FROM processed_disclosures ORDER BY processed_ts DESC, rcept_no DESC LIMIT ?
)
"#,
            params![keep],
        )?;
        Ok(n)
    }

    pub fn upsert_disclosure(&self, d: &ScoredDisclosure) -> Result<()> {
        let conn = self.open_conn()?;
        let x = &d.disclosure;
        conn.execute(
            r#"
INSERT INTO disclosures(
  rcept_no, corp_cls, corp_code, corp_name, stock_code, report_nm, rcept_dt, flr_nm, rm,
  matched_keywords_json, priority_score, dart_url, fetched_ts
)
VALUES(?,?,?,?,?,?,?,?,?,?,?,?,?)
ON CONFLICT(rcept_no) DO UPDATE SET
  report_nm=excluded.report_nm,
  rm=excluded.rm,
  matched_keywords_json=excluded.matched_keywords_json,
  priority_score=excluded.priority_score,
  fetched_ts=excluded.fetched_ts
"#,
            params![
                x.rcept_no,
                x.corp_cls,
                x.corp_code,
                x.corp_name,
                x.stock_code,
                x.report_nm,
                x.rcept_dt,
                x.flr_nm,
                x.rm,
                serde_json::to_string(&d.matched_keywords)?,
                d.priority_score,
                d.dart_url,
                d.fetched_ts
            ],
        )?;
        Ok(())
    }

    pub fn fetch_disclosures(&self, f: &DisclosureFilter) -> Result<(Vec<ScoredDisclosure>, i64)> {
        let conn = self.open_conn()?;
        let keyword = f.keyword.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let company = f.company.as_deref().map(str::trim).filter(|s| !s.is_empty());
        const WHERE: &str = r#"
WHERE rcept_dt >= ?1
  AND (?2 IS NULL OR instr(report_nm, ?2) > 0 OR instr(matched_keywords_json, ?2) > 0)
  AND (?3 IS NULL OR instr(corp_name, ?3) > 0 OR stock_code = ?3 OR corp_code = ?3)
"#;
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM disclosures {WHERE}"),
            params![f.since_day, keyword, company],
            |r| r.get(0),
        )?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DISCLOSURE_COLS} FROM disclosures {WHERE} ORDER BY rcept_dt DESC, rcept_no DESC LIMIT ?4 OFFSET ?5"
        ))?;
        let rows = stmt
            .query_map(
                params![f.since_day, keyword, company, f.limit, f.offset],
                disclosure_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((rows, total))
    }

    pub fn fetch_disclosure(&self, rcept_no: &str) -> Result<Option<ScoredDisclosure>> {
        let conn = self.open_conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {DISCLOSURE_COLS} FROM disclosures WHERE rcept_no=?"),
                params![rcept_no],
                disclosure_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn count_matched_disclosures_since(&self, since_day: &str) -> Result<i64> {
        let conn = self.open_conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM disclosures WHERE rcept_dt >= ? AND priority_score > 0",
            params![since_day],
            |r| r.get(0),
        )?)
    }

    // ---- watch lists ----------------------------------------------------

    pub fn seed_keywords_if_empty(&self, keywords: &[WatchedKeyword]) -> Result<bool> {
        let conn = self.open_conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM dart_keywords", [], |r| r.get(0))?;
        drop(conn);
        if n > 0 {
            return Ok(false);
        }
        self.replace_keywords(keywords)?;
        Ok(true)
    }

    pub fn replace_keywords(&self, keywords: &[WatchedKeyword]) -> Result<()> {
        let mut conn = self.open_conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM dart_keywords", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO dart_keywords(keyword, weight, category, is_active) VALUES(?,?,?,?)",
            )?;
            for k in keywords {
                stmt.execute(params![k.keyword, k.weight, k.category.as_str(), k.is_active])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn fetch_keywords(&self) -> Result<Vec<WatchedKeyword>> {
        let conn = self.open_conn()?;
        let mut stmt =
            conn.prepare("SELECT keyword, weight, category, is_active FROM dart_keywords ORDER BY rowid")?;
        let rows = stmt
            .query_map([], |r| {
                let category: String = r.get(2)?;
                Ok(WatchedKeyword {
                    keyword: r.get(0)?,
                    weight: r.get::<_, Option<f64>>(1)?.unwrap_or(1.0),
                    category: KeywordTier::parse(&category),
                    is_active: r.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn seed_companies_if_empty(&self, companies: &[WatchedCompany]) -> Result<bool> {
        let conn = self.open_conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM dart_companies", [], |r| r.get(0))?;
        drop(conn);
        if n > 0 {
            return Ok(false);
        }
        self.replace_companies(companies)?;
        Ok(true)
    }

    pub fn replace_companies(&self, companies: &[WatchedCompany]) -> Result<()> {
        let mut conn = self.open_conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM dart_companies", [])?;
        {
            let mut stmt = tx.prepare(
                r#"
INSERT OR REPLACE INTO dart_companies(stock_code, corp_code, corp_name, is_active, last_checked_ts)
VALUES(?,?,?,?,?)
"#,
            )?;
            for c in companies {
                stmt.execute(params![c.stock_code, c.corp_code, c.corp_name, c.is_active, c.last_checked_ts])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn fetch_companies(&self) -> Result<Vec<WatchedCompany>> {
        let conn = self.open_conn()?;
        let mut stmt = conn.prepare(
            "SELECT stock_code, corp_code, corp_name, is_active, last_checked_ts FROM dart_companies ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(WatchedCompany {
                    stock_code: r.get(0)?,
                    corp_code: r.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    corp_name: r.get(2)?,
                    is_active: r.get(3)?,
                    last_checked_ts: r.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn touch_companies_checked(&self, ts: f64) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute("UPDATE dart_companies SET last_checked_ts=? WHERE is_active=1", params![ts])?;
        Ok(())
    }

    // ---- monitored stocks -----------------------------------------------

    /// False when the code is already monitored.
    pub fn insert_stock(&self, s: &MonitoringStock) -> Result<bool> {
        let conn = self.open_conn()?;
        let n = conn.execute(
            &format!("INSERT OR IGNORE INTO monitoring_stocks({STOCK_COLS}) VALUES(?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)"),
            params_from_iter(stock_params(s)?),
        )?;
        Ok(n > 0)
    }

    /// False when the code is not monitored.
    pub fn update_stock(&self, s: &MonitoringStock) -> Result<bool> {
        let conn = self.open_conn()?;
        let n = conn.execute(
            r#"
UPDATE monitoring_stocks SET
  name=?2, acquisition_price=?3, quantity=?4, take_profit=?5, stop_loss=?6,
  daily_surge_threshold=?7, daily_drop_threshold=?8, alert_enabled=?9, category=?10,
  conversion_price=?11, conversion_price_floor=?12, custom_alerts_json=?13
WHERE code=?1
"#,
            params![
                s.code,
                s.name,
                s.acquisition_price,
                s.quantity,
                s.take_profit,
                s.stop_loss,
                s.daily_surge_threshold,
                s.daily_drop_threshold,
                s.alert_enabled,
                category_str(s.category),
                s.conversion_price,
                s.conversion_price_floor,
                serde_json::to_string(&s.custom_alerts)?
            ],
        )?;
        Ok(n > 0)
    }

    /// The outgoing `current_price` moves to `prev_price`.
    pub fn update_stock_quote(&self, code: &str, price: f64, change_rate: f64, ts: f64) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute(
            "UPDATE monitoring_stocks SET prev_price=current_price, current_price=?, change_rate=?, updated_ts=? WHERE code=?",
            params![price, change_rate, ts, code],
        )?;
        Ok(())
    }

    pub fn delete_stock(&self, code: &str) -> Result<bool> {
        let mut conn = self.open_conn()?;
        let tx = conn.transaction()?;
        let n = tx.execute("DELETE FROM monitoring_stocks WHERE code=?", params![code])?;
        tx.execute("DELETE FROM triggered_alerts WHERE code=?", params![code])?;
        tx.commit()?;
        Ok(n > 0)
    }

    pub fn fetch_stocks(&self) -> Result<Vec<MonitoringStock>> {
        let conn = self.open_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {STOCK_COLS} FROM monitoring_stocks ORDER BY created_ts, code"
        ))?;
        let rows = stmt
            .query_map([], stock_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn fetch_stock(&self, code: &str) -> Result<Option<MonitoringStock>> {
        let conn = self.open_conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {STOCK_COLS} FROM monitoring_stocks WHERE code=?"),
                params![code],
                stock_from_row,
            )
            .optional()?;
        Ok(row)
    }

    // ---- fired alert markers --------------------------------------------

    pub fn fired_alert_ids(&self, code: &str) -> Result<HashSet<String>> {
        let conn = self.open_conn()?;
        let mut stmt = conn.prepare("SELECT alert_id FROM triggered_alerts WHERE code=?")?;
        let ids = stmt
            .query_map(params![code], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(ids)
    }

    pub fn mark_alert_fired(&self, code: &str, alert_id: &str, ts: f64) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO triggered_alerts(code, alert_id, fired_ts) VALUES(?,?,?)",
            params![code, alert_id, ts],
        )?;
        Ok(())
    }

    /// Markers only hold for one trading day; the midnight reset drops all of them.
    pub fn clear_fired_alerts(&self) -> Result<usize> {
        let conn = self.open_conn()?;
        Ok(conn.execute("DELETE FROM triggered_alerts", [])?)
    }
}

const DISCLOSURE_COLS: &str = "rcept_no, corp_cls, corp_code, corp_name, stock_code, report_nm, rcept_dt, flr_nm, rm, \
matched_keywords_json, priority_score, dart_url, fetched_ts";

const STOCK_COLS: &str = "code, name, acquisition_price, quantity, take_profit, stop_loss, \
daily_surge_threshold, daily_drop_threshold, alert_enabled, category, conversion_price, conversion_price_floor, \
custom_alerts_json, current_price, change_rate, updated_ts, created_ts, prev_price";

fn category_str(c: StockCategory) -> &'static str {
    match c {
        StockCategory::Mezzanine => "mezzanine",
        StockCategory::Other => "other",
    }
}

fn stock_params(s: &MonitoringStock) -> Result<Vec<rusqlite::types::Value>> {
    use rusqlite::types::Value;
    let opt = |v: Option<f64>| v.map(Value::Real).unwrap_or(Value::Null);
    Ok(vec![
        Value::Text(s.code.clone()),
        Value::Text(s.name.clone()),
        Value::Real(s.acquisition_price),
        Value::Integer(s.quantity),
        opt(s.take_profit),
        opt(s.stop_loss),
        Value::Real(s.daily_surge_threshold),
        Value::Real(s.daily_drop_threshold),
        Value::Integer(i64::from(s.alert_enabled)),
        Value::Text(category_str(s.category).to_string()),
        opt(s.conversion_price),
        opt(s.conversion_price_floor),
        Value::Text(serde_json::to_string(&s.custom_alerts)?),
        opt(s.current_price),
        opt(s.change_rate),
        opt(s.updated_ts),
        Value::Real(s.created_ts),
        opt(s.prev_price),
    ])
}

fn stock_from_row(r: &Row<'_>) -> rusqlite::Result<MonitoringStock> {
    let category: Option<String> = r.get(9)?;
    let custom_raw: Option<String> = r.get(12)?;
    let custom_alerts: Vec<CustomAlert> = custom_raw
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();
    Ok(MonitoringStock {
        code: r.get(0)?,
        name: r.get(1)?,
        acquisition_price: r.get(2)?,
        quantity: r.get(3)?,
        take_profit: r.get(4)?,
        stop_loss: r.get(5)?,
        daily_surge_threshold: r.get(6)?,
        daily_drop_threshold: r.get(7)?,
        alert_enabled: r.get(8)?,
        category: match category.as_deref() {
            Some("mezzanine") => StockCategory::Mezzanine,
            _ => StockCategory::Other,
        },
        conversion_price: r.get(10)?,
        conversion_price_floor: r.get(11)?,
        custom_alerts,
        current_price: r.get(13)?,
        change_rate: r.get(14)?,
        updated_ts: r.get(15)?,
        created_ts: r.get::<_, Option<f64>>(16)?.unwrap_or(0.0),
        prev_price: r.get(17)?,
    })
}

fn disclosure_from_row(r: &Row<'_>) -> rusqlite::Result<ScoredDisclosure> {
    let text = |i: usize| -> rusqlite::Result<String> { Ok(r.get::<_, Option<String>>(i)?.unwrap_or_default()) };
    let matched: Vec<String> = r
        .get::<_, Option<String>>(9)?
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();
    Ok(ScoredDisclosure {
        disclosure: Disclosure {
            rcept_no: r.get(0)?,
            corp_cls: text(1)?,
            corp_code: text(2)?,
            corp_name: text(3)?,
            stock_code: text(4)?,
            report_nm: text(5)?,
            rcept_dt: text(6)?,
            flr_nm: text(7)?,
            rm: text(8)?,
        },
        matched_keywords: matched,
        priority_score: r.get::<_, Option<u32>>(10)?.unwrap_or(0),
        dart_url: text(11)?,
        fetched_ts: r.get::<_, Option<f64>>(12)?.unwrap_or(0.0),
    })
}

fn alert_from_row(r: &Row<'_>) -> rusqlite::Result<AlertRecord> {
    let detail_raw: Option<String> = r.get(8)?;
    Ok(AlertRecord {
        id: r.get(0)?,
        alert_type: r.get(1)?,
        title: r.get(2)?,
        message: r.get(3)?,
        stock_code: r.get(4)?,
        stock_name: r.get(5)?,
        price: r.get(6)?,
        change_rate: r.get(7)?,
        detail: detail_raw
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or(JsonValue::Null),
        is_read: r.get(9)?,
        created_ts: r.get(10)?,
    })
}

#[cfg(test)]
pub mod testing {
    use super::SqliteStore;

    /// Fresh store in its own temp dir; keep the guard alive for the test.
    pub fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sqlite");
        let store = SqliteStore::new(path.to_str().unwrap()).unwrap();
        store.init_db().unwrap();
        (dir, store)
    }
}
