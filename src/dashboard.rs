use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderValue, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast::error::RecvError, watch};
use tower_http::cors::{Any, CorsLayer};

use crate::{
    dart::{validate_companies, validate_keywords, WatchedCompany, WatchedKeyword, HIGH_PRIORITY_SCORE},
    hub::{Event, EventKind},
    market::compact_day,
    monitor::{Monitor, StockMonitorSettings},
    quotes::fetch_many,
    stocks::{portfolio_totals, NewStock, StockPatch},
    store::{AlertType, DisclosureFilter},
    utils::now_ts,
};

const INDEX_HTML: &str = include_str!("index.html");
const SEARCH_LIMIT: usize = 20;
const MAX_PRICE_CODES: usize = 50;

#[derive(Clone)]
pub struct DashboardState {
    pub monitor: Monitor,
    /// Open sockets are closed with 1000 when this flips.
    pub shutdown: watch::Receiver<bool>,
}

/// JSON error body `{"ok": false, "error": ...}` with a matching status.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unavailable(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = match &self {
            ApiError::Internal(e) => {
                log::error!("api.error err={:#}", e);
                format!("{e:#}")
            }
            other => other.to_string(),
        };
        (status, Json(serde_json::json!({"ok": false, "error": error}))).into_response()
    }
}

type ApiResult = Result<Json<JsonValue>, ApiError>;

fn bad_request(e: anyhow::Error) -> ApiError {
    ApiError::BadRequest(format!("{e:#}"))
}

pub fn router(state: DashboardState) -> Router {
    let cors = cors_layer(&state.monitor.settings.cors_origins);
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/status", get(api_status))
        .route("/ws", get(ws_upgrade))
        .route("/api/dart/disclosures", get(dart_disclosures))
        .route("/api/dart/disclosures/{rcept_no}", get(dart_disclosure))
        .route("/api/dart/keywords", get(dart_keywords).put(dart_put_keywords))
        .route("/api/dart/companies", get(dart_companies).put(dart_put_companies))
        .route("/api/dart/settings", get(dart_settings))
        .route("/api/dart/alerts", get(dart_alerts))
        .route("/api/dart/alerts/{id}/read", put(dart_alert_read))
        .route("/api/dart/statistics", get(dart_statistics))
        .route("/api/dart/check-now", post(dart_check_now))
        .route("/api/dart/health", get(dart_health))
        .route("/api/stocks/prices/{code}", get(stock_price))
        .route("/api/stocks/prices", post(stock_prices))
        .route("/api/stocks/monitoring", get(stocks_list).post(stocks_add))
        .route(
            "/api/stocks/monitoring/{code}",
            put(stocks_update).delete(stocks_delete),
        )
        .route("/api/stocks/alerts", get(stock_alerts))
        .route("/api/stocks/alerts/{id}/read", put(stock_alert_read))
        .route("/api/stocks/statistics", get(stock_statistics))
        .route("/api/stocks/settings", get(stock_settings).put(stock_put_settings))
        .route("/api/stocks/search", get(stock_search))
        .route("/api/stocks/market-info", get(market_info))
        .route("/api/stocks/check-now", post(stock_check_now))
        .route("/api/stocks/health", get(stock_health))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return base.allow_origin(Any);
    }
    let list: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    base.allow_origin(list)
}

pub async fn serve_dashboard(monitor: Monitor, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", monitor.settings.http_host, monitor.settings.http_port)
        .parse()
        .context("dashboard addr parse")?;
    let app = router(DashboardState {
        monitor,
        shutdown: shutdown.clone(),
    });

    log::info!("dashboard.start url=http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    log::info!("dashboard.stopped");
    Ok(())
}

async fn index(State(st): State<DashboardState>) -> impl IntoResponse {
    Html(INDEX_HTML.replace("{{APP_NAME}}", &st.monitor.settings.app_name))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "ts": now_ts(),
    }))
}

async fn api_status(State(st): State<DashboardState>) -> impl IntoResponse {
    let m = &st.monitor;
    let components = m
        .store
        .fetch_runtime_statuses()
        .unwrap_or_else(|_| serde_json::json!({}));
    Json(serde_json::json!({
        "ok": true,
        "ts": now_ts(),
        "app_name": m.settings.app_name,
        "config": m.settings,
        "monitors": {
            "dart": m.dart_health(),
            "stock": m.stock_health(),
        },
        "websocket": m.hub.stats(),
        "market": m.market_info(),
        "components": components,
    }))
}

// ---- paging --------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PageQ {
    page: Option<u32>,
    page_size: Option<u32>,
    days: Option<u32>,
    keyword: Option<String>,
    company: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Paging {
    page: u32,
    page_size: u32,
    days: u32,
    offset: u32,
}

impl Paging {
    fn total_pages(&self, total: i64) -> i64 {
        let size = i64::from(self.page_size);
        (total + size - 1) / size
    }
}

fn paging(q: &PageQ) -> Result<Paging, ApiError> {
    let page = q.page.unwrap_or(1);
    let page_size = q.page_size.unwrap_or(20);
    let days = q.days.unwrap_or(7);
    if page < 1 {
        return Err(ApiError::BadRequest("page must be >= 1".into()));
    }
    if !(1..=100).contains(&page_size) {
        return Err(ApiError::BadRequest("page_size must be within 1..=100".into()));
    }
    if !(1..=30).contains(&days) {
        return Err(ApiError::BadRequest("days must be within 1..=30".into()));
    }
    let offset = (page - 1)
        .checked_mul(page_size)
        .ok_or_else(|| ApiError::BadRequest("page is out of range".into()))?;
    Ok(Paging {
        page,
        page_size,
        days,
        offset,
    })
}

fn alert_page(m: &Monitor, kind: AlertType, q: &PageQ) -> ApiResult {
    let p = paging(q)?;
    let since = now_ts() - f64::from(p.days) * 86_400.0;
    let page = m.store.fetch_alerts(Some(kind), since, p.offset, p.page_size)?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "alerts": page.items,
        "total_count": page.total_count,
        "unread_count": page.unread_count,
        "page": p.page,
        "page_size": p.page_size,
        "total_pages": p.total_pages(page.total_count),
    })))
}

fn mark_read(m: &Monitor, kind: AlertType, id: i64) -> ApiResult {
    if !m.store.mark_alert_read(kind, id)? {
        return Err(ApiError::NotFound(format!("alert {id} not found")));
    }
    Ok(Json(serde_json::json!({"ok": true, "id": id})))
}

// ---- DART ----------------------------------------------------------------

async fn dart_disclosures(State(st): State<DashboardState>, Query(q): Query<PageQ>) -> ApiResult {
    let p = paging(&q)?;
    let now = st.monitor.market_hours().now();
    let since_day = compact_day(&(now - chrono::Duration::days(i64::from(p.days))));
    let (items, total) = st.monitor.store.fetch_disclosures(&DisclosureFilter {
        since_day,
        keyword: q.keyword,
        company: q.company,
        offset: p.offset,
        limit: p.page_size,
    })?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "disclosures": items,
        "total_count": total,
        "page": p.page,
        "page_size": p.page_size,
        "total_pages": p.total_pages(total),
    })))
}

async fn dart_disclosure(State(st): State<DashboardState>, Path(rcept_no): Path<String>) -> ApiResult {
    match st.monitor.store.fetch_disclosure(&rcept_no)? {
        Some(d) => Ok(Json(serde_json::json!({"ok": true, "disclosure": d}))),
        None => Err(ApiError::NotFound(format!("disclosure {rcept_no} not found"))),
    }
}

async fn dart_keywords(State(st): State<DashboardState>) -> ApiResult {
    let keywords = st.monitor.store.fetch_keywords()?;
    Ok(Json(serde_json::json!({"ok": true, "keywords": keywords})))
}

#[derive(Debug, Deserialize)]
struct KeywordsBody {
    keywords: Vec<WatchedKeyword>,
}

async fn dart_put_keywords(State(st): State<DashboardState>, Json(body): Json<KeywordsBody>) -> ApiResult {
    validate_keywords(&body.keywords).map_err(bad_request)?;
    st.monitor.store.replace_keywords(&body.keywords)?;
    log::info!("dart.keywords_updated count={}", body.keywords.len());
    Ok(Json(serde_json::json!({"ok": true, "keywords": body.keywords})))
}

async fn dart_companies(State(st): State<DashboardState>) -> ApiResult {
    let companies = st.monitor.store.fetch_companies()?;
    Ok(Json(serde_json::json!({"ok": true, "companies": companies})))
}

#[derive(Debug, Deserialize)]
struct CompaniesBody {
    companies: Vec<WatchedCompany>,
}

async fn dart_put_companies(State(st): State<DashboardState>, Json(body): Json<CompaniesBody>) -> ApiResult {
    validate_companies(&body.companies).map_err(bad_request)?;
    st.monitor.store.replace_companies(&body.companies)?;
    log::info!("dart.companies_updated count={}", body.companies.len());
    Ok(Json(serde_json::json!({"ok": true, "companies": body.companies})))
}

async fn dart_settings(State(st): State<DashboardState>) -> ApiResult {
    let s = &st.monitor.settings;
    Ok(Json(serde_json::json!({
        "ok": true,
        "settings": {
            "configured": st.monitor.dart.is_configured(),
            "check_interval_secs": s.dart_check_interval_secs,
            "initial_delay_secs": s.dart_initial_delay_secs,
            "corp_cls": s.dart_corp_cls,
            "max_pages": s.dart_max_pages,
            "exclude_keywords": s.dart_exclude_keywords,
            "major_companies": s.dart_major_companies,
            "high_priority_score": HIGH_PRIORITY_SCORE,
            "email_enabled": st.monitor.mailer.enabled(),
        }
    })))
}

async fn dart_alerts(State(st): State<DashboardState>, Query(q): Query<PageQ>) -> ApiResult {
    alert_page(&st.monitor, AlertType::Dart, &q)
}

async fn dart_alert_read(State(st): State<DashboardState>, Path(id): Path<i64>) -> ApiResult {
    mark_read(&st.monitor, AlertType::Dart, id)
}

async fn dart_statistics(State(st): State<DashboardState>) -> ApiResult {
    let stats = st.monitor.dart_statistics()?;
    Ok(Json(serde_json::json!({"ok": true, "statistics": stats})))
}

async fn dart_check_now(State(st): State<DashboardState>) -> ApiResult {
    if !st.monitor.dart.is_configured() {
        return Err(ApiError::Unavailable("DART_API_KEY is not configured".into()));
    }
    let outcome = st.monitor.run_dart_check().await?;
    Ok(Json(serde_json::json!({"ok": true, "result": outcome})))
}

async fn dart_health(State(st): State<DashboardState>) -> ApiResult {
    Ok(Json(serde_json::json!({
        "ok": true,
        "configured": st.monitor.dart.is_configured(),
        "health": st.monitor.dart_health(),
    })))
}

// ---- stocks --------------------------------------------------------------

async fn stock_price(State(st): State<DashboardState>, Path(code): Path<String>) -> ApiResult {
    match st.monitor.quotes.fetch(&code).await {
        Ok(q) => Ok(Json(serde_json::json!({"ok": true, "quote": q}))),
        Err(e) => {
            log::warn!("quotes.lookup_failed code={} err={:#}", code, e);
            Err(ApiError::NotFound(format!("no quote for {code}")))
        }
    }
}

#[derive(Debug, Deserialize)]
struct PricesBody {
    codes: Vec<String>,
}

async fn stock_prices(State(st): State<DashboardState>, Json(body): Json<PricesBody>) -> ApiResult {
    if body.codes.is_empty() || body.codes.len() > MAX_PRICE_CODES {
        return Err(ApiError::BadRequest(format!(
            "codes must hold 1..={MAX_PRICE_CODES} entries"
        )));
    }
    let quotes = fetch_many(st.monitor.quotes.as_ref(), &body.codes).await;
    let failed: Vec<&String> = body
        .codes
        .iter()
        .filter(|c| !quotes.iter().any(|q| &q.code == *c))
        .collect();
    Ok(Json(serde_json::json!({"ok": true, "quotes": quotes, "failed": failed})))
}

async fn stocks_list(State(st): State<DashboardState>) -> ApiResult {
    let stocks = st.monitor.store.fetch_stocks()?;
    let views: Vec<_> = stocks.iter().map(|s| s.view()).collect();
    Ok(Json(serde_json::json!({
        "ok": true,
        "stocks": views,
        "totals": portfolio_totals(&stocks),
    })))
}

async fn stocks_add(State(st): State<DashboardState>, Json(body): Json<NewStock>) -> ApiResult {
    let m = &st.monitor;
    let code = body.code.trim().to_string();
    if m.store.fetch_stock(&code)?.is_some() {
        return Err(ApiError::Conflict(format!("{code} is already monitored")));
    }
    let fallback_name = if body.name.as_deref().map_or(true, |n| n.trim().is_empty()) && !code.is_empty() {
        m.quotes.fetch(&code).await.ok().map(|q| q.name)
    } else {
        None
    };
    let stock = body.into_stock(fallback_name, now_ts()).map_err(bad_request)?;
    if !m.store.insert_stock(&stock)? {
        return Err(ApiError::Conflict(format!("{} is already monitored", stock.code)));
    }
    log::info!("stock.added code={} name={}", stock.code, stock.name);
    Ok(Json(serde_json::json!({"ok": true, "stock": stock.view()})))
}

async fn stocks_update(
    State(st): State<DashboardState>,
    Path(code): Path<String>,
    Json(patch): Json<StockPatch>,
) -> ApiResult {
    let m = &st.monitor;
    let Some(mut stock) = m.store.fetch_stock(&code)? else {
        return Err(ApiError::NotFound(format!("{code} is not monitored")));
    };
    patch.apply(&mut stock).map_err(bad_request)?;
    m.store.update_stock(&stock)?;
    log::info!("stock.updated code={}", code);
    Ok(Json(serde_json::json!({"ok": true, "stock": stock.view()})))
}

async fn stocks_delete(State(st): State<DashboardState>, Path(code): Path<String>) -> ApiResult {
    if !st.monitor.store.delete_stock(&code)? {
        return Err(ApiError::NotFound(format!("{code} is not monitored")));
    }
    log::info!("stock.removed code={}", code);
    Ok(Json(serde_json::json!({"ok": true, "code": code})))
}

async fn stock_alerts(State(st): State<DashboardState>, Query(q): Query<PageQ>) -> ApiResult {
    alert_page(&st.monitor, AlertType::Stock, &q)
}

async fn stock_alert_read(State(st): State<DashboardState>, Path(id): Path<i64>) -> ApiResult {
    mark_read(&st.monitor, AlertType::Stock, id)
}

async fn stock_statistics(State(st): State<DashboardState>) -> ApiResult {
    let stats = st.monitor.stock_statistics()?;
    Ok(Json(serde_json::json!({"ok": true, "statistics": stats})))
}

async fn stock_settings(State(st): State<DashboardState>) -> ApiResult {
    Ok(Json(serde_json::json!({"ok": true, "settings": st.monitor.stock_settings()})))
}

async fn stock_put_settings(
    State(st): State<DashboardState>,
    Json(next): Json<StockMonitorSettings>,
) -> ApiResult {
    let saved = st.monitor.update_stock_settings(next).map_err(bad_request)?;
    Ok(Json(serde_json::json!({"ok": true, "settings": saved})))
}

#[derive(Debug, Deserialize)]
struct SearchQ {
    #[serde(default)]
    q: String,
}

async fn stock_search(State(st): State<DashboardState>, Query(q): Query<SearchQ>) -> ApiResult {
    let query = q.q.trim();
    if query.chars().count() < 2 {
        return Err(ApiError::BadRequest("q must be at least 2 characters".into()));
    }
    let results = st.monitor.search_stocks(query, SEARCH_LIMIT).await?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "query": query,
        "total_count": results.len(),
        "results": results,
    })))
}

async fn market_info(State(st): State<DashboardState>) -> ApiResult {
    Ok(Json(serde_json::json!({"ok": true, "market_info": st.monitor.market_info()})))
}

async fn stock_check_now(State(st): State<DashboardState>) -> ApiResult {
    let outcome = st.monitor.run_stock_check(true).await?;
    Ok(Json(serde_json::json!({"ok": true, "result": outcome})))
}

async fn stock_health(State(st): State<DashboardState>) -> ApiResult {
    Ok(Json(serde_json::json!({
        "ok": true,
        "health": st.monitor.stock_health(),
        "market": st.monitor.market_info(),
    })))
}

// ---- websocket -----------------------------------------------------------

async fn ws_upgrade(ws: WebSocketUpgrade, State(st): State<DashboardState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(st, socket))
}

fn text(s: &str) -> Message {
    Message::Text(Utf8Bytes::from(s.to_string()))
}

async fn handle_socket(st: DashboardState, socket: WebSocket) {
    let hub = st.monitor.hub.clone();
    let mut shutdown = st.shutdown.clone();
    let (mut tx, mut inbound) = socket.split();

    let guard = match hub.register() {
        Ok(g) => g,
        Err(e) => {
            log::warn!("ws.rejected reason={}", e);
            let frame = CloseFrame {
                code: close_code::POLICY,
                reason: Utf8Bytes::from_static("connection limit reached"),
            };
            let _ = tx.send(Message::Close(Some(frame))).await;
            return;
        }
    };
    let id = guard.id;
    let mut events = hub.subscribe();
    log::info!("ws.connected id={} total={}", id, hub.connection_count());

    let hello = Event::new(
        EventKind::UserConnected,
        serde_json::json!({"connection_id": id, "message": "connected"}),
    )
    .encode();
    if tx.send(text(&hello)).await.is_err() {
        return;
    }

    let idle_secs = st.monitor.settings.ws_idle_timeout_secs as f64;
    let mut idle_check = tokio::time::interval(Duration::from_secs(30));
    idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            ev = events.recv() => match ev {
                Ok(payload) => {
                    if tx.send(text(&payload)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => log::warn!("ws.lagged id={} skipped={}", id, n),
                Err(RecvError::Closed) => break,
            },
            msg = inbound.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Text(t))) => {
                    hub.touch(id);
                    if is_client_ping(&t) && tx.send(text(r#"{"type":"pong"}"#)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(_)) => hub.touch(id),
                Some(Err(e)) => {
                    log::debug!("ws.recv_error id={} err={}", id, e);
                    break;
                }
            },
            Ok(()) = shutdown.changed() => {
                if *shutdown.borrow() {
                    let frame = CloseFrame {
                        code: close_code::NORMAL,
                        reason: Utf8Bytes::from_static("server shutting down"),
                    };
                    let _ = tx.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
            _ = idle_check.tick() => {
                if hub.is_idle(id, now_ts(), idle_secs) {
                    log::info!("ws.idle_timeout id={}", id);
                    let frame = CloseFrame {
                        code: close_code::AWAY,
                        reason: Utf8Bytes::from_static("idle timeout"),
                    };
                    let _ = tx.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    }
    drop(guard);
    hub.publish(
        EventKind::UserDisconnected,
        serde_json::json!({"connection_id": id, "total_connections": hub.connection_count()}),
    );
    log::info!("ws.disconnected id={} total={}", id, hub.connection_count());
}

fn is_client_ping(raw: &str) -> bool {
    serde_json::from_str::<JsonValue>(raw)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "ping"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use tokio::net::TcpStream;
    use tokio_tungstenite::{
        connect_async,
        tungstenite::{protocol::frame::coding::CloseCode, Message as WsMessage},
        MaybeTlsStream, WebSocketStream,
    };

    use super::*;
    use crate::hub::Hub;
    use crate::monitor::testing::{monitor, monitor_with};
    use crate::notifier::Mailer;
    use crate::quotes::testing::FixedQuotes;

    type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn call(app: &Router, method: Method, uri: &str, body: Option<JsonValue>) -> (StatusCode, JsonValue) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.map(|b| b.to_string()).unwrap_or_default()))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(JsonValue::Null))
    }

    fn state(m: &Monitor) -> (DashboardState, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            DashboardState {
                monitor: m.clone(),
                shutdown: rx,
            },
            tx,
        )
    }

    fn app() -> (tempfile::TempDir, Router, Monitor, Arc<FixedQuotes>) {
        let (dir, m, quotes) = monitor();
        let (st, _tx) = state(&m);
        (dir, router(st), m, quotes)
    }

    /// Serves the router on an ephemeral port; flipping the sender shuts sockets down.
    async fn serve(m: &Monitor) -> (SocketAddr, watch::Sender<bool>) {
        let (st, tx) = state(m);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router(st)).await;
        });
        (addr, tx)
    }

    async fn ws_connect(addr: SocketAddr) -> WsClient {
        let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        ws
    }

    async fn next_frame(ws: &mut WsClient) -> WsMessage {
        tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame within 5s")
            .expect("stream open")
            .expect("frame ok")
    }

    async fn next_json(ws: &mut WsClient) -> JsonValue {
        loop {
            if let WsMessage::Text(t) = next_frame(ws).await {
                return serde_json::from_str(t.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn health_and_index() {
        let (_dir, app, _m, _q) = app();
        let (status, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let html = resp.into_body().collect().await.unwrap().to_bytes();
        let html = String::from_utf8_lossy(&html);
        assert!(html.contains("investwatch"));
        assert!(!html.contains("{{APP_NAME}}"));
    }

    #[tokio::test]
    async fn stock_crud_flow() {
        let (_dir, app, _m, quotes) = app();
        quotes.set("005930", 71_000.0, 70_000.0);

        let new = serde_json::json!({"code": "005930", "acquisition_price": 70000, "quantity": 10, "take_profit": 80000});
        let (status, body) = call(&app, Method::POST, "/api/stocks/monitoring", Some(new.clone())).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["stock"]["name"], "name-005930");

        let (status, body) = call(&app, Method::POST, "/api/stocks/monitoring", Some(new)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["ok"], false);

        let bad = serde_json::json!({"code": "000660", "acquisition_price": 0, "quantity": 1});
        let (status, _) = call(&app, Method::POST, "/api/stocks/monitoring", Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let patch = serde_json::json!({"take_profit": null, "quantity": 20});
        let (status, body) = call(&app, Method::PUT, "/api/stocks/monitoring/005930", Some(patch)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stock"]["quantity"], 20);
        assert!(body["stock"]["take_profit"].is_null());

        let (status, _) = call(&app, Method::PUT, "/api/stocks/monitoring/999999", Some(serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = call(&app, Method::POST, "/api/stocks/check-now", None).await;
        assert_eq!(body["result"]["quotes"], 1);

        let (_, body) = call(&app, Method::GET, "/api/stocks/monitoring", None).await;
        assert_eq!(body["stocks"][0]["current_price"], 71_000.0);
        assert_eq!(body["stocks"][0]["profit_loss"], 20_000.0);

        let (status, _) = call(&app, Method::DELETE, "/api/stocks/monitoring/005930", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, Method::DELETE, "/api/stocks/monitoring/005930", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn validation_errors() {
        let (_dir, app, _m, _q) = app();
        let (status, body) = call(&app, Method::GET, "/api/stocks/search?q=a", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);

        for uri in [
            "/api/dart/disclosures?page=0",
            "/api/dart/disclosures?page_size=101",
            "/api/dart/disclosures?days=31",
            "/api/dart/alerts?days=0",
        ] {
            let (status, _) = call(&app, Method::GET, uri, None).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        }

        let (status, _) = call(&app, Method::GET, "/api/dart/disclosures/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, Method::PUT, "/api/stocks/alerts/42/read", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, Method::POST, "/api/dart/check-now", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, _) = call(&app, Method::POST, "/api/stocks/prices", Some(serde_json::json!({"codes": []}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn huge_page_numbers_are_rejected() {
        let (_dir, app, _m, _q) = app();
        for uri in [
            "/api/dart/alerts?page=50000000&page_size=100",
            "/api/stocks/alerts?page=4294967295&page_size=2",
            "/api/dart/disclosures?page=50000000&page_size=100",
        ] {
            let (status, body) = call(&app, Method::GET, uri, None).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(body["ok"], false);
        }
        let (status, body) = call(&app, Method::GET, "/api/dart/alerts?page=3&page_size=100", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["page"], 3);
    }

    #[tokio::test]
    async fn status_reports_config_without_secrets() {
        let (_dir, app, _m, _q) = app();
        let (status, body) = call(&app, Method::GET, "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["config"]["app_name"], "investwatch");
        assert!(body["config"].get("email_password").is_none());
        assert!(body["config"].get("dart_api_key").is_none());
    }

    #[tokio::test]
    async fn watch_lists_round_trip_through_api() {
        let (_dir, app, _m, _q) = app();
        let (_, body) = call(&app, Method::GET, "/api/dart/companies", None).await;
        assert_eq!(body["companies"].as_array().unwrap().len(), 2);

        let put_body = serde_json::json!({"keywords": [{"keyword": "합병", "category": "high"}, {"keyword": "수주"}]});
        let (status, _) = call(&app, Method::PUT, "/api/dart/keywords", Some(put_body)).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(&app, Method::GET, "/api/dart/keywords", None).await;
        assert_eq!(body["keywords"].as_array().unwrap().len(), 2);

        let dup = serde_json::json!({"keywords": [{"keyword": "합병"}, {"keyword": "합병"}]});
        let (status, _) = call(&app, Method::PUT, "/api/dart/keywords", Some(dup)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn settings_and_alert_reads() {
        let (_dir, app, m, _q) = app();
        let (_, body) = call(&app, Method::GET, "/api/stocks/settings", None).await;
        let mut s = body["settings"].clone();
        s["check_interval"] = 20.into();
        let (status, body) = call(&app, Method::PUT, "/api/stocks/settings", Some(s.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["settings"]["check_interval"], 20);
        s["market_close"] = "08:00".into();
        let (status, _) = call(&app, Method::PUT, "/api/stocks/settings", Some(s)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let id = m
            .store
            .insert_alert(
                AlertType::Stock,
                &crate::store::NewAlert {
                    title: "t".into(),
                    message: "m".into(),
                    ..Default::default()
                },
                now_ts(),
            )
            .unwrap();
        let (_, body) = call(&app, Method::GET, "/api/stocks/alerts", None).await;
        assert_eq!(body["unread_count"], 1);
        let (status, _) = call(&app, Method::PUT, &format!("/api/stocks/alerts/{id}/read"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, Method::PUT, &format!("/api/dart/alerts/{id}/read"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (_, body) = call(&app, Method::GET, "/api/stocks/alerts", None).await;
        assert_eq!(body["unread_count"], 0);
    }

    #[tokio::test]
    async fn socket_greets_answers_pings_and_announces_leaves() {
        let (_dir, m, _q) = monitor();
        let (addr, _tx) = serve(&m).await;

        let mut a = ws_connect(addr).await;
        let hello = next_json(&mut a).await;
        assert_eq!(hello["type"], "user_connected");
        let a_id = hello["data"]["connection_id"].as_str().unwrap().to_string();
        assert_eq!(m.hub.stats().connections[0].id.to_string(), a_id);

        a.send(WsMessage::text(r#"{"type":"ping"}"#.to_string())).await.unwrap();
        assert_eq!(next_json(&mut a).await, serde_json::json!({"type": "pong"}));

        let mut b = ws_connect(addr).await;
        let b_id = next_json(&mut b).await["data"]["connection_id"].as_str().unwrap().to_string();
        assert_ne!(a_id, b_id);
        b.close(None).await.unwrap();

        let left = next_json(&mut a).await;
        assert_eq!(left["type"], "user_disconnected");
        assert_eq!(left["data"]["connection_id"], b_id.as_str());
        assert_eq!(m.hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn socket_over_capacity_is_closed_with_policy_code() {
        let (_dir, m, _q) = monitor_with(Hub::new(1), Mailer::disabled());
        let (addr, _tx) = serve(&m).await;

        let mut first = ws_connect(addr).await;
        assert_eq!(next_json(&mut first).await["type"], "user_connected");

        let mut second = ws_connect(addr).await;
        match next_frame(&mut second).await {
            WsMessage::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 1008);
            }
            other => panic!("expected close frame, got {other:?}"),
        }
        assert_eq!(m.hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_sockets_normally() {
        let (_dir, m, _q) = monitor();
        let (addr, tx) = serve(&m).await;
        let mut ws = ws_connect(addr).await;
        assert_eq!(next_json(&mut ws).await["type"], "user_connected");

        tx.send(true).unwrap();
        match next_frame(&mut ws).await {
            WsMessage::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcast_events_reach_sockets() {
        let (_dir, m, _q) = monitor();
        let (addr, _tx) = serve(&m).await;
        let mut ws = ws_connect(addr).await;
        next_json(&mut ws).await;

        m.hub.system_status("market_opened", "market opened");
        let ev = next_json(&mut ws).await;
        assert_eq!(ev["type"], "system_status");
        assert_eq!(ev["data"]["status"], "market_opened");
    }

    #[test]
    fn client_ping_detection() {
        assert!(is_client_ping(r#"{"type":"ping"}"#));
        assert!(!is_client_ping(r#"{"type":"pong"}"#));
        assert!(!is_client_ping("hello"));
    }
}
