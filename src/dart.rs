use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    config::Settings,
    hub::{EventKind, Hub},
    notifier::{dart_alert_email, Mailer},
    store::{AlertType, NewAlert, SqliteStore},
    utils::now_ts,
};

pub const DART_VIEWER_URL: &str = "https://dart.fss.or.kr/dsaf001/main.do";
pub const HIGH_PRIORITY_SCORE: u32 = 50;
pub const PROCESSED_KEEP: u32 = 10_000;

const BASE_SCORE: f64 = 10.0;
const MAJOR_COMPANY_BONUS: f64 = 20.0;
const MAX_SCORE: f64 = 100.0;

/// One row of the disclosure list API.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Disclosure {
    pub rcept_no: String,
    #[serde(default)]
    pub corp_cls: String,
    #[serde(default)]
    pub corp_code: String,
    #[serde(default)]
    pub corp_name: String,
    #[serde(default)]
    pub stock_code: String,
    #[serde(default)]
    pub report_nm: String,
    #[serde(default)]
    pub rcept_dt: String,
    #[serde(default)]
    pub flr_nm: String,
    #[serde(default)]
    pub rm: String,
}

impl Disclosure {
    pub fn viewer_url(&self) -> String {
        format!("{DART_VIEWER_URL}?rcpNo={}", self.rcept_no)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScoredDisclosure {
    #[serde(flatten)]
    pub disclosure: Disclosure,
    pub matched_keywords: Vec<String>,
    pub priority_score: u32,
    pub dart_url: String,
    pub fetched_ts: f64,
}

impl ScoredDisclosure {
    pub fn is_alert(&self) -> bool {
        !self.matched_keywords.is_empty()
    }

    pub fn is_high_priority(&self) -> bool {
        self.priority_score >= HIGH_PRIORITY_SCORE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeywordTier {
    High,
    Medium,
    #[default]
    General,
}

impl KeywordTier {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "high" => KeywordTier::High,
            "medium" => KeywordTier::Medium,
            _ => KeywordTier::General,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KeywordTier::High => "high",
            KeywordTier::Medium => "medium",
            KeywordTier::General => "general",
        }
    }

    fn points(self) -> f64 {
        match self {
            KeywordTier::High => 30.0,
            KeywordTier::Medium => 20.0,
            KeywordTier::General => 10.0,
        }
    }
}

fn default_weight() -> f64 {
    1.0
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchedKeyword {
    pub keyword: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub category: KeywordTier,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

impl WatchedKeyword {
    pub fn new(keyword: &str, category: KeywordTier) -> Self {
        Self {
            keyword: keyword.to_string(),
            weight: 1.0,
            category,
            is_active: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchedCompany {
    pub stock_code: String,
    #[serde(default)]
    pub corp_code: String,
    pub corp_name: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub last_checked_ts: Option<f64>,
}

impl WatchedCompany {
    pub fn new(stock_code: &str, corp_name: &str) -> Self {
        Self {
            stock_code: stock_code.to_string(),
            corp_code: String::new(),
            corp_name: corp_name.to_string(),
            is_active: true,
            last_checked_ts: None,
        }
    }

    pub fn matches(&self, d: &Disclosure) -> bool {
        if !self.is_active {
            return false;
        }
        (!self.stock_code.is_empty() && self.stock_code == d.stock_code)
            || (!self.corp_code.is_empty() && self.corp_code == d.corp_code)
            || (!self.corp_name.is_empty() && self.corp_name == d.corp_name)
    }
}

pub fn default_keywords(settings: &Settings) -> Vec<WatchedKeyword> {
    settings
        .dart_keywords
        .iter()
        .map(|(k, tier)| WatchedKeyword::new(k, KeywordTier::parse(tier)))
        .collect()
}

pub fn default_companies(settings: &Settings) -> Vec<WatchedCompany> {
    settings
        .dart_companies
        .iter()
        .map(|(code, name)| WatchedCompany::new(code, name))
        .collect()
}

pub fn validate_keywords(keywords: &[WatchedKeyword]) -> Result<()> {
    let mut seen = HashSet::new();
    for k in keywords {
        let kw = k.keyword.trim();
        if kw.is_empty() {
            anyhow::bail!("keyword must not be empty");
        }
        if !(k.weight > 0.0) {
            anyhow::bail!("keyword {kw} weight must be > 0");
        }
        if !seen.insert(kw.to_string()) {
            anyhow::bail!("duplicate keyword {kw}");
        }
    }
    Ok(())
}

pub fn validate_companies(companies: &[WatchedCompany]) -> Result<()> {
    let mut seen = HashSet::new();
    for c in companies {
        if c.stock_code.trim().is_empty() || c.corp_name.trim().is_empty() {
            anyhow::bail!("company needs stock_code and corp_name");
        }
        if !seen.insert(c.stock_code.trim().to_string()) {
            anyhow::bail!("duplicate stock_code {}", c.stock_code);
        }
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum DartError {
    #[error("dart request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("dart api status {status}: {message}")]
    Api { status: String, message: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DartListResponse {
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub page_no: u64,
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub total_page: u64,
    #[serde(default)]
    pub list: Vec<Disclosure>,
}

impl DartListResponse {
    /// `000` is success and `013` means no filings for the window.
    pub fn into_result(mut self) -> Result<Self, DartError> {
        match self.status.as_str() {
            "000" => Ok(self),
            "013" => {
                self.list.clear();
                self.total_page = 0;
                Ok(self)
            }
            _ => Err(DartError::Api {
                status: self.status,
                message: self.message,
            }),
        }
    }
}

pub struct DartClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    corp_cls: String,
}

impl DartClient {
    pub fn new(base_url: &str, api_key: &str, corp_cls: &str, timeout_secs: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .context("build dart http client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            corp_cls: corp_cls.to_string(),
        })
    }

    pub async fn fetch_list(
        &self,
        bgn_de: &str,
        end_de: &str,
        page_no: u64,
        page_count: u64,
    ) -> Result<DartListResponse, DartError> {
        let page_no = page_no.to_string();
        let page_count = page_count.to_string();
        let resp = self
            .http
            .get(format!("{}/list.json", self.base_url))
            .query(&[
                ("crtfc_key", self.api_key.as_str()),
                ("bgn_de", bgn_de),
                ("end_de", end_de),
                ("corp_cls", self.corp_cls.as_str()),
                ("sort", "date"),
                ("sort_mth", "desc"),
                ("page_no", page_no.as_str()),
                ("page_count", page_count.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;
        let body: DartListResponse = resp.json().await?;
        body.into_result()
    }

    /// All filings of one day, newest first, walking at most `max_pages` pages.
    pub async fn fetch_day(&self, day: &str, max_pages: u64) -> Result<Vec<Disclosure>, DartError> {
        let mut out = Vec::new();
        let mut page = 1;
        loop {
            let resp = self.fetch_list(day, day, page, 100).await?;
            let total_page = resp.total_page;
            log::debug!(
                "dart.page day={} page={}/{} items={} total={}",
                day,
                resp.page_no,
                total_page,
                resp.list.len(),
                resp.total_count
            );
            out.extend(resp.list);
            if page >= total_page || page >= max_pages {
                break;
            }
            page += 1;
        }
        Ok(out)
    }
}

/// Keyword matching and priority scoring over report titles.
#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    keywords: Vec<WatchedKeyword>,
    exclude: Vec<String>,
    major_companies: Vec<String>,
}

impl KeywordMatcher {
    pub fn new(keywords: Vec<WatchedKeyword>, exclude: Vec<String>, major_companies: Vec<String>) -> Self {
        Self {
            keywords: keywords.into_iter().filter(|k| k.is_active).collect(),
            exclude,
            major_companies,
        }
    }

    pub fn is_excluded(&self, report_nm: &str) -> bool {
        self.exclude.iter().any(|x| !x.is_empty() && report_nm.contains(x.as_str()))
    }

    /// `None` when excluded or nothing matched; otherwise (keywords, score).
    pub fn score(&self, d: &Disclosure) -> Option<(Vec<String>, u32)> {
        if self.is_excluded(&d.report_nm) {
            return None;
        }
        let text = format!("{} {}", d.report_nm, d.rm);
        let mut matched = Vec::new();
        let mut score = BASE_SCORE;
        for k in &self.keywords {
            if text.contains(k.keyword.as_str()) {
                matched.push(k.keyword.clone());
                score += (k.category.points() * k.weight).round();
            }
        }
        if matched.is_empty() {
            return None;
        }
        if self.major_companies.iter().any(|c| c == &d.corp_name) {
            score += MAJOR_COMPANY_BONUS;
        }
        Some((matched, score.min(MAX_SCORE) as u32))
    }
}

/// Splits a fetched batch into watched disclosures, highest priority first.
/// Receipts in `processed` and unwatched companies are skipped.
pub fn triage(
    items: Vec<Disclosure>,
    processed: &HashSet<String>,
    companies: &[WatchedCompany],
    matcher: &KeywordMatcher,
    ts: f64,
) -> Vec<ScoredDisclosure> {
    let mut seen = HashSet::new();
    let mut out: Vec<ScoredDisclosure> = items
        .into_iter()
        .filter(|d| !processed.contains(&d.rcept_no) && seen.insert(d.rcept_no.clone()))
        .filter(|d| companies.iter().any(|c| c.matches(d)))
        .map(|d| {
            let (matched_keywords, priority_score) = matcher.score(&d).unwrap_or_default();
            ScoredDisclosure {
                dart_url: d.viewer_url(),
                disclosure: d,
                matched_keywords,
                priority_score,
                fetched_ts: ts,
            }
        })
        .collect();
    out.sort_by(|a, b| {
        b.priority_score
            .cmp(&a.priority_score)
            .then_with(|| b.disclosure.rcept_no.cmp(&a.disclosure.rcept_no))
    });
    out
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckOutcome {
    pub fetched: usize,
    pub watched: usize,
    pub alerts: usize,
    pub high_priority: usize,
    pub emails_sent: usize,
}

/// Fetch, score, notify and record disclosure alerts.
pub struct DartService {
    settings: Settings,
    client: Option<DartClient>,
    store: SqliteStore,
    hub: Hub,
    mailer: Arc<Mailer>,
}

impl DartService {
    pub fn new(settings: Settings, store: SqliteStore, hub: Hub, mailer: Arc<Mailer>) -> Result<Self> {
        let client = match settings.dart_api_key.as_deref() {
            Some(key) => Some(DartClient::new(
                &settings.dart_base_url,
                key,
                &settings.dart_corp_cls,
                settings.http_timeout_secs,
            )?),
            None => None,
        };
        Ok(Self {
            settings,
            client,
            store,
            hub,
            mailer,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.client.is_some()
    }

    pub fn seed_watch_lists(&self) -> Result<()> {
        if self.store.seed_keywords_if_empty(&default_keywords(&self.settings))? {
            log::info!("dart.seed keywords={}", self.settings.dart_keywords.len());
        }
        if self.store.seed_companies_if_empty(&default_companies(&self.settings))? {
            log::info!("dart.seed companies={}", self.settings.dart_companies.len());
        }
        Ok(())
    }

    pub fn matcher(&self) -> Result<KeywordMatcher> {
        Ok(KeywordMatcher::new(
            self.store.fetch_keywords()?,
            self.settings.dart_exclude_keywords.clone(),
            self.settings.dart_major_companies.clone(),
        ))
    }

    /// Scores and stores a fetched batch; every receipt in it becomes processed.
    pub fn ingest(&self, items: Vec<Disclosure>, ts: f64) -> Result<Vec<ScoredDisclosure>> {
        let ids: Vec<String> = items.iter().map(|d| d.rcept_no.clone()).collect();
        let processed = self.store.processed_among(&ids)?;
        let companies = self.store.fetch_companies()?;
        let watched = triage(items, &processed, &companies, &self.matcher()?, ts);
        for d in &watched {
            self.store.upsert_disclosure(d)?;
        }
        self.store.mark_processed(&ids, ts)?;
        self.store.prune_processed(PROCESSED_KEEP)?;
        Ok(watched)
    }

    pub async fn process_new_disclosures(&self, day: &str) -> Result<(usize, Vec<ScoredDisclosure>)> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("DART_API_KEY is not configured"))?;
        let items = client
            .fetch_day(day, self.settings.dart_max_pages)
            .await
            .with_context(|| format!("fetch disclosures for {day}"))?;
        let fetched = items.len();
        let ts = now_ts();
        let watched = self.ingest(items, ts)?;
        self.store.touch_companies_checked(ts)?;
        Ok((fetched, watched))
    }

    /// Emails (when enabled), broadcasts and records each alert. Returns emails sent.
    pub async fn send_alerts(&self, alerts: &[ScoredDisclosure]) -> Result<usize> {
        let mut sent = 0;
        for a in alerts.iter().filter(|a| a.is_alert()) {
            match self.mailer.send(&dart_alert_email(a)).await {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(e) => log::warn!("dart.email_failed rcept_no={} err={:#}", a.disclosure.rcept_no, e),
            }
            self.hub.publish(EventKind::DartUpdate, serde_json::to_value(a)?);
            self.store.insert_alert(
                AlertType::Dart,
                &NewAlert {
                    title: format!("{} - {}", a.disclosure.corp_name, a.disclosure.report_nm),
                    message: format!(
                        "keywords: {} (priority {})",
                        a.matched_keywords.join(", "),
                        a.priority_score
                    ),
                    stock_code: Some(a.disclosure.stock_code.clone()).filter(|s| !s.is_empty()),
                    stock_name: Some(a.disclosure.corp_name.clone()),
                    price: None,
                    change_rate: None,
                    detail: serde_json::json!({
                        "rcept_no": a.disclosure.rcept_no,
                        "keywords": a.matched_keywords,
                        "priority_score": a.priority_score,
                        "url": a.dart_url,
                    }),
                },
                now_ts(),
            )?;
        }
        Ok(sent)
    }

    pub async fn check(&self, day: &str) -> Result<CheckOutcome> {
        let (fetched, watched) = self.process_new_disclosures(day).await?;
        let alerts: Vec<ScoredDisclosure> = watched.iter().filter(|d| d.is_alert()).cloned().collect();
        let emails_sent = self.send_alerts(&alerts).await?;
        Ok(CheckOutcome {
            fetched,
            watched: watched.len(),
            alerts: alerts.len(),
            high_priority: alerts.iter().filter(|a| a.is_high_priority()).count(),
            emails_sent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::temp_store;

    fn d(rcept_no: &str, corp: &str, stock_code: &str, report: &str) -> Disclosure {
        Disclosure {
            rcept_no: rcept_no.into(),
            corp_cls: "Y".into(),
            corp_code: String::new(),
            corp_name: corp.into(),
            stock_code: stock_code.into(),
            report_nm: report.into(),
            rcept_dt: "20240304".into(),
            flr_nm: corp.into(),
            rm: String::new(),
        }
    }

    fn matcher() -> KeywordMatcher {
        KeywordMatcher::new(
            vec![
                WatchedKeyword::new("합병", KeywordTier::High),
                WatchedKeyword::new("배당", KeywordTier::Medium),
                WatchedKeyword::new("수주", KeywordTier::General),
                WatchedKeyword { is_active: false, ..WatchedKeyword::new("소송", KeywordTier::General) },
            ],
            vec!["기업설명회".into(), "(IR)".into()],
            vec!["삼성전자".into()],
        )
    }

    #[test]
    fn scoring_tiers_and_major_bonus() {
        let m = matcher();
        let (kw, score) = m.score(&d("1", "카카오", "035720", "회사합병결정")).unwrap();
        assert_eq!(kw, vec!["합병".to_string()]);
        assert_eq!(score, 40);

        let (_, score) = m.score(&d("2", "삼성전자", "005930", "회사합병결정 및 현금배당")).unwrap();
        assert_eq!(score, 10 + 30 + 20 + 20);

        let (_, score) = m.score(&d("3", "카카오", "035720", "단일판매ㆍ공급계약(수주)")).unwrap();
        assert_eq!(score, 20);
    }

    #[test]
    fn score_is_capped() {
        let heavy = KeywordMatcher::new(
            vec![WatchedKeyword { weight: 5.0, ..WatchedKeyword::new("합병", KeywordTier::High) }],
            vec![],
            vec![],
        );
        assert_eq!(heavy.score(&d("1", "x", "", "합병")).unwrap().1, 100);
    }

    #[test]
    fn exclusions_and_inactive_keywords_do_not_match() {
        let m = matcher();
        assert!(m.score(&d("1", "카카오", "035720", "기업설명회(IR) 개최 - 합병 설명")).is_none());
        assert!(m.score(&d("2", "카카오", "035720", "소송등의제기")).is_none());
        assert!(m.score(&d("3", "카카오", "035720", "임원ㆍ주요주주특정증권등소유상황보고서")).is_none());
    }

    #[test]
    fn remarks_are_searched_too() {
        let mut x = d("1", "카카오", "035720", "주요사항보고서");
        x.rm = "배당".into();
        assert!(matcher().score(&x).is_some());
    }

    #[test]
    fn triage_filters_and_orders() {
        let companies = vec![WatchedCompany::new("005930", "삼성전자"), WatchedCompany::new("035720", "카카오")];
        let processed: HashSet<String> = ["4".to_string()].into_iter().collect();
        let items = vec![
            d("1", "카카오", "035720", "현금배당결정"),
            d("2", "삼성전자", "005930", "회사합병결정"),
            d("3", "LG전자", "066570", "회사합병결정"),
            d("4", "카카오", "035720", "회사합병결정"),
            d("5", "카카오", "035720", "기업설명회"),
            d("2", "삼성전자", "005930", "회사합병결정"),
        ];
        let out = triage(items, &processed, &companies, &matcher(), 1.0);
        let ids: Vec<&str> = out.iter().map(|x| x.disclosure.rcept_no.as_str()).collect();
        assert_eq!(ids, vec!["2", "1", "5"]);
        assert_eq!(out[0].priority_score, 60);
        assert!(out[0].is_high_priority());
        assert!(!out[2].is_alert());
        assert_eq!(out[0].dart_url, "https://dart.fss.or.kr/dsaf001/main.do?rcpNo=2");
    }

    #[test]
    fn inactive_company_is_not_watched() {
        let mut c = WatchedCompany::new("005930", "삼성전자");
        assert!(c.matches(&d("1", "삼성전자", "", "x")));
        c.is_active = false;
        assert!(!c.matches(&d("1", "삼성전자", "005930", "x")));
    }

    #[test]
    fn list_response_status_handling() {
        let ok: DartListResponse = serde_json::from_value(serde_json::json!({
            "status": "000", "message": "정상", "page_no": 1, "page_count": 100,
            "total_count": 1, "total_page": 1,
            "list": [{"corp_cls": "Y", "corp_name": "삼성전자", "corp_code": "00126380", "stock_code": "005930",
                      "report_nm": "회사합병결정", "rcept_no": "20240304000001", "flr_nm": "삼성전자",
                      "rcept_dt": "20240304", "rm": "유"}]
        }))
        .unwrap();
        let ok = ok.into_result().unwrap();
        assert_eq!(ok.list.len(), 1);
        assert_eq!(ok.list[0].stock_code, "005930");

        let none: DartListResponse =
            serde_json::from_value(serde_json::json!({"status": "013", "message": "조회된 데이타가 없습니다."})).unwrap();
        assert!(none.into_result().unwrap().list.is_empty());

        let bad: DartListResponse =
            serde_json::from_value(serde_json::json!({"status": "020", "message": "요청 제한을 초과하였습니다."})).unwrap();
        match bad.into_result() {
            Err(DartError::Api { status, .. }) => assert_eq!(status, "020"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn keyword_and_company_validation() {
        assert!(validate_keywords(&[WatchedKeyword::new("합병", KeywordTier::High)]).is_ok());
        assert!(validate_keywords(&[WatchedKeyword::new(" ", KeywordTier::High)]).is_err());
        assert!(validate_keywords(&[
            WatchedKeyword::new("합병", KeywordTier::High),
            WatchedKeyword::new("합병", KeywordTier::General)
        ])
        .is_err());
        assert!(validate_companies(&[WatchedCompany::new("", "x")]).is_err());
    }

    #[tokio::test]
    async fn ingest_marks_everything_processed_once() {
        let (_dir, store) = temp_store();
        let settings = Settings::from_lookup(&|k: &str| match k {
            "DART_COMPANIES" => Some("005930:삼성전자".to_string()),
            _ => None,
        })
        .unwrap();
        let svc = DartService::new(
            settings.clone(),
            store.clone(),
            Hub::new(4),
            Arc::new(Mailer::from_settings(&settings).unwrap()),
        )
        .unwrap();
        assert!(!svc.is_configured());
        svc.seed_watch_lists().unwrap();

        let batch = vec![
            d("10", "삼성전자", "005930", "회사합병결정"),
            d("11", "카카오", "035720", "회사합병결정"),
        ];
        let first = svc.ingest(batch.clone(), 1.0).unwrap();
        assert_eq!(first.len(), 1);
        assert!(store.processed_among(&["11".to_string()]).unwrap().contains("11"));
        assert!(svc.ingest(batch, 2.0).unwrap().is_empty());

        let mut rx = svc.hub.subscribe();
        assert_eq!(svc.send_alerts(&first).await.unwrap(), 0);
        let ev = rx.try_recv().unwrap();
        assert!(ev.contains("\"dart_update\""));
        let page = store.fetch_alerts(Some(AlertType::Dart), 0.0, 0, 10).unwrap();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.items[0].detail["rcept_no"], "10");
    }
}
