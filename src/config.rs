use std::env;

use anyhow::{anyhow, Result};
use chrono::NaiveTime;
use serde::Serialize;

/// Watched companies used when `DART_COMPANIES` is not set: (stock code, corp name).
pub const DEFAULT_COMPANIES: &[(&str, &str)] = &[
    ("005930", "삼성전자"),
    ("000660", "SK하이닉스"),
    ("035420", "NAVER"),
    ("005380", "현대차"),
    ("000270", "기아"),
    ("005490", "POSCO홀딩스"),
    ("035720", "카카오"),
    ("051910", "LG화학"),
    ("006400", "삼성SDI"),
    ("012330", "현대모비스"),
    ("028260", "삼성물산"),
    ("066570", "LG전자"),
    ("034020", "두산에너빌리티"),
    ("003670", "포스코퓨처엠"),
    ("096770", "SK이노베이션"),
    ("018260", "삼성에스디에스"),
    ("086790", "하나금융지주"),
    ("316140", "우리금융지주"),
    ("055550", "신한지주"),
    ("105560", "KB금융"),
    ("017670", "SK텔레콤"),
    ("030200", "KT"),
    ("032640", "LG유플러스"),
];

/// Disclosure keywords with their scoring tier: (keyword, high|medium|general).
pub const DEFAULT_KEYWORDS: &[(&str, &str)] = &[
    ("합병", "high"),
    ("분할", "high"),
    ("매각", "high"),
    ("취득", "high"),
    ("투자", "high"),
    ("지분", "high"),
    ("출자", "high"),
    ("유상증자", "medium"),
    ("무상증자", "medium"),
    ("배당", "medium"),
    ("자기주식", "medium"),
    ("신주", "general"),
    ("주식매수", "general"),
    ("전환사채", "general"),
    ("신주인수권부사채", "general"),
    ("교환사채", "general"),
    ("공급계약", "general"),
    ("수주", "general"),
    ("소송", "general"),
    ("회생절차", "general"),
    ("파산", "general"),
    ("상장폐지", "general"),
    ("대표이사", "general"),
    ("최대주주", "general"),
    ("영업정지", "general"),
    ("MOU", "general"),
];

/// Report titles containing any of these are investor-relations noise.
pub const DEFAULT_EXCLUDE_KEYWORDS: &[&str] = &["기업설명회", "IR개최", "설명회개최", "IR)", "(IR)"];

pub const DEFAULT_MAJOR_COMPANIES: &[&str] = &["삼성전자", "SK하이닉스", "NAVER", "네이버", "카카오"];

type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn get_env(src: Lookup<'_>, key: &str) -> Option<String> {
    src(key)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn get_env_bool(src: Lookup<'_>, key: &str, default: bool) -> bool {
    match get_env(src, key) {
        None => default,
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"),
    }
}

fn get_env_f64(src: Lookup<'_>, key: &str, default: f64) -> Result<f64> {
    match get_env(src, key) {
        None => Ok(default),
        Some(v) => Ok(v
            .parse::<f64>()
            .map_err(|e| anyhow!("{key} invalid float: {e}"))?),
    }
}

fn get_env_u64(src: Lookup<'_>, key: &str, default: u64) -> Result<u64> {
    match get_env(src, key) {
        None => Ok(default),
        Some(v) => Ok(v
            .parse::<u64>()
            .map_err(|e| anyhow!("{key} invalid int: {e}"))?),
    }
}

fn get_env_string(src: Lookup<'_>, key: &str, default: &str) -> String {
    get_env(src, key).unwrap_or_else(|| default.to_string())
}

fn get_env_list(src: Lookup<'_>, key: &str) -> Option<Vec<String>> {
    get_env(src, key).map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

/// `005930:삼성전자,000660:SK하이닉스`
pub fn parse_companies(items: &[String]) -> Result<Vec<(String, String)>> {
    items
        .iter()
        .map(|item| {
            let (code, name) = item
                .split_once(':')
                .ok_or_else(|| anyhow!("DART_COMPANIES entry must be code:name (got {item})"))?;
            let (code, name) = (code.trim(), name.trim());
            if code.is_empty() || name.is_empty() {
                return Err(anyhow!("DART_COMPANIES entry must be code:name (got {item})"));
            }
            Ok((code.to_string(), name.to_string()))
        })
        .collect()
}

/// `합병:high,수주` (tier defaults to general)
pub fn parse_keywords(items: &[String]) -> Result<Vec<(String, String)>> {
    items
        .iter()
        .map(|item| {
            let (kw, tier) = match item.split_once(':') {
                Some((kw, tier)) => (kw.trim(), tier.trim().to_lowercase()),
                None => (item.trim(), "general".to_string()),
            };
            if !matches!(tier.as_str(), "high" | "medium" | "general") {
                return Err(anyhow!("DART_KEYWORDS tier must be high|medium|general (got {tier})"));
            }
            Ok((kw.to_string(), tier))
        })
        .collect()
}

pub fn parse_hhmm(key: &str, v: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(v.trim(), "%H:%M").map_err(|e| anyhow!("{key} must be HH:MM (got {v}): {e}"))
}

#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub app_name: String,

    // DART
    #[serde(skip_serializing)]
    pub dart_api_key: Option<String>,
    pub dart_base_url: String,
    pub dart_check_interval_secs: u64,
    pub dart_initial_delay_secs: u64,
    pub dart_corp_cls: String,
    pub dart_max_pages: u64,
    pub dart_companies: Vec<(String, String)>,
    pub dart_keywords: Vec<(String, String)>,
    pub dart_exclude_keywords: Vec<String>,
    pub dart_major_companies: Vec<String>,

    // Stocks
    pub quote_base_url: String,
    pub stock_check_interval_secs: u64,
    pub stock_initial_delay_secs: u64,
    pub market_open: String,
    pub market_close: String,
    pub market_utc_offset_hours: i32,
    pub max_alerts_per_day: u64,
    pub parity_levels: Vec<f64>,

    // Email
    pub email_enabled: bool,
    pub smtp_server: String,
    pub smtp_port: u16,
    pub email_sender: String,
    #[serde(skip_serializing)]
    pub email_password: String,
    pub email_receiver: String,

    // WebSocket hub
    pub ws_max_connections: usize,
    pub ws_ping_secs: u64,
    pub ws_idle_timeout_secs: u64,

    // Monitors
    pub health_check_secs: u64,
    pub http_timeout_secs: u64,

    // Storage / HTTP
    pub sqlite_path: String,
    pub http_host: String,
    pub http_port: u16,
    pub cors_origins: Vec<String>,
}

impl Settings {
    pub fn load() -> Result<Self> {
        Self::from_lookup(&|k: &str| env::var(k).ok())
    }

    pub fn from_lookup(src: Lookup<'_>) -> Result<Self> {
        let dart_companies = match get_env_list(src, "DART_COMPANIES") {
            Some(items) => parse_companies(&items)?,
            None => DEFAULT_COMPANIES
                .iter()
                .map(|(c, n)| (c.to_string(), n.to_string()))
                .collect(),
        };
        let dart_keywords = match get_env_list(src, "DART_KEYWORDS") {
            Some(items) => parse_keywords(&items)?,
            None => DEFAULT_KEYWORDS
                .iter()
                .map(|(k, t)| (k.to_string(), t.to_string()))
                .collect(),
        };
        let dart_exclude_keywords = get_env_list(src, "DART_EXCLUDE_KEYWORDS")
            .unwrap_or_else(|| DEFAULT_EXCLUDE_KEYWORDS.iter().map(|s| s.to_string()).collect());
        let dart_major_companies = get_env_list(src, "DART_MAJOR_COMPANIES")
            .unwrap_or_else(|| DEFAULT_MAJOR_COMPANIES.iter().map(|s| s.to_string()).collect());

        let parity_levels = match get_env_list(src, "PARITY_LEVELS") {
            None => vec![80.0, 100.0, 120.0],
            Some(items) => items
                .iter()
                .map(|s| s.parse::<f64>().map_err(|e| anyhow!("PARITY_LEVELS invalid float: {e}")))
                .collect::<Result<Vec<_>>>()?,
        };

        let smtp_port = get_env_u64(src, "SMTP_PORT", 587)?;
        let http_port = get_env_u64(src, "HTTP_PORT", 8000)?;
        let utc_offset = get_env_f64(src, "MARKET_UTC_OFFSET_HOURS", 9.0)?;

        let s = Self {
            app_name: get_env_string(src, "APP_NAME", "investwatch"),

            dart_api_key: get_env(src, "DART_API_KEY"),
            dart_base_url: get_env_string(src, "DART_BASE_URL", "https://opendart.fss.or.kr/api"),
            dart_check_interval_secs: get_env_u64(src, "DART_CHECK_INTERVAL_SECS", 1800)?,
            dart_initial_delay_secs: get_env_u64(src, "DART_INITIAL_DELAY_SECS", 60)?,
            dart_corp_cls: get_env_string(src, "DART_CORP_CLS", "Y"),
            dart_max_pages: get_env_u64(src, "DART_MAX_PAGES", 10)?,
            dart_companies,
            dart_keywords,
            dart_exclude_keywords,
            dart_major_companies,

            quote_base_url: get_env_string(
                src,
                "QUOTE_BASE_URL",
                "https://polling.finance.naver.com/api/realtime/domestic/stock",
            ),
            stock_check_interval_secs: get_env_u64(src, "STOCK_CHECK_INTERVAL_SECS", 10)?,
            stock_initial_delay_secs: get_env_u64(src, "STOCK_INITIAL_DELAY_SECS", 30)?,
            market_open: get_env_string(src, "MARKET_OPEN", "09:00"),
            market_close: get_env_string(src, "MARKET_CLOSE", "15:35"),
            market_utc_offset_hours: utc_offset.round() as i32,
            max_alerts_per_day: get_env_u64(src, "MAX_ALERTS_PER_DAY", 100)?,
            parity_levels,

            email_enabled: get_env_bool(src, "EMAIL_ENABLED", false),
            smtp_server: get_env_string(src, "SMTP_SERVER", "smtp.gmail.com"),
            smtp_port: u16::try_from(smtp_port).map_err(|_| anyhow!("SMTP_PORT out of range"))?,
            email_sender: get_env_string(src, "EMAIL_SENDER", ""),
            email_password: get_env_string(src, "EMAIL_PASSWORD", ""),
            email_receiver: get_env_string(src, "EMAIL_RECEIVER", ""),

            ws_max_connections: get_env_u64(src, "WS_MAX_CONNECTIONS", 50)? as usize,
            ws_ping_secs: get_env_u64(src, "WS_PING_SECS", 60)?,
            ws_idle_timeout_secs: get_env_u64(src, "WS_IDLE_TIMEOUT_SECS", 300)?,

            health_check_secs: get_env_u64(src, "HEALTH_CHECK_SECS", 300)?,
            http_timeout_secs: get_env_u64(src, "HTTP_TIMEOUT_SECS", 30)?,

            sqlite_path: get_env_string(src, "SQLITE_PATH", "./data/investwatch.sqlite"),
            http_host: get_env_string(src, "HTTP_HOST", "127.0.0.1"),
            http_port: u16::try_from(http_port).map_err(|_| anyhow!("HTTP_PORT out of range"))?,
            cors_origins: get_env_list(src, "CORS_ORIGINS").unwrap_or_else(|| {
                vec![
                    "http://localhost:3000".to_string(),
                    "http://127.0.0.1:3000".to_string(),
                ]
            }),
        };
        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dart_check_interval_secs == 0 {
            return Err(anyhow!("DART_CHECK_INTERVAL_SECS must be > 0"));
        }
        if self.stock_check_interval_secs == 0 {
            return Err(anyhow!("STOCK_CHECK_INTERVAL_SECS must be > 0"));
        }
        if self.health_check_secs == 0 || self.ws_ping_secs == 0 {
            return Err(anyhow!("HEALTH_CHECK_SECS and WS_PING_SECS must be > 0"));
        }
        if self.dart_max_pages == 0 {
            return Err(anyhow!("DART_MAX_PAGES must be > 0"));
        }
        let open = parse_hhmm("MARKET_OPEN", &self.market_open)?;
        let close = parse_hhmm("MARKET_CLOSE", &self.market_close)?;
        if open >= close {
            return Err(anyhow!(
                "MARKET_OPEN must be before MARKET_CLOSE (got {} >= {})",
                self.market_open,
                self.market_close
            ));
        }
        if !(-12..=14).contains(&self.market_utc_offset_hours) {
            return Err(anyhow!("MARKET_UTC_OFFSET_HOURS must be within -12..=14"));
        }
        if self.ws_max_connections == 0 {
            return Err(anyhow!("WS_MAX_CONNECTIONS must be > 0"));
        }
        if self.http_port == 0 {
            return Err(anyhow!("HTTP_PORT must be > 0"));
        }
        if self.email_enabled && (self.email_sender.is_empty() || self.email_receiver.is_empty()) {
            return Err(anyhow!("EMAIL_ENABLED requires EMAIL_SENDER and EMAIL_RECEIVER"));
        }
        if self.parity_levels.iter().any(|l| !(*l > 0.0)) {
            return Err(anyhow!("PARITY_LEVELS must be positive"));
        }
        Ok(())
    }

    pub fn dart_enabled(&self) -> bool {
        self.dart_api_key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load_with(vars: &[(&str, &str)]) -> Result<Settings> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(&move |k: &str| map.get(k).cloned())
    }

    #[test]
    fn defaults_load_and_validate() {
        let s = load_with(&[]).unwrap();
        assert_eq!(s.dart_check_interval_secs, 1800);
        assert_eq!(s.stock_check_interval_secs, 10);
        assert_eq!(s.market_open, "09:00");
        assert_eq!(s.market_close, "15:35");
        assert_eq!(s.market_utc_offset_hours, 9);
        assert_eq!(s.ws_max_connections, 50);
        assert_eq!(s.smtp_port, 587);
        assert_eq!(s.dart_companies.len(), DEFAULT_COMPANIES.len());
        assert_eq!(s.parity_levels, vec![80.0, 100.0, 120.0]);
        assert!(!s.dart_enabled());
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let s = load_with(&[("DART_API_KEY", "   "), ("HTTP_PORT", "")]).unwrap();
        assert!(s.dart_api_key.is_none());
        assert_eq!(s.http_port, 8000);
    }

    #[test]
    fn invalid_numbers_name_the_variable() {
        let err = load_with(&[("STOCK_CHECK_INTERVAL_SECS", "ten")]).unwrap_err();
        assert!(err.to_string().contains("STOCK_CHECK_INTERVAL_SECS"));
    }

    #[test]
    fn inverted_market_window_is_rejected() {
        let err = load_with(&[("MARKET_OPEN", "16:00"), ("MARKET_CLOSE", "09:00")]).unwrap_err();
        assert!(err.to_string().contains("MARKET_OPEN"));
        assert!(load_with(&[("MARKET_OPEN", "9am")]).is_err());
    }

    #[test]
    fn zero_interval_and_cap_are_rejected() {
        assert!(load_with(&[("DART_CHECK_INTERVAL_SECS", "0")]).is_err());
        assert!(load_with(&[("WS_MAX_CONNECTIONS", "0")]).is_err());
    }

    #[test]
    fn email_requires_addresses() {
        assert!(load_with(&[("EMAIL_ENABLED", "true")]).is_err());
        let s = load_with(&[
            ("EMAIL_ENABLED", "yes"),
            ("EMAIL_SENDER", "bot@example.com"),
            ("EMAIL_RECEIVER", "desk@example.com"),
        ])
        .unwrap();
        assert!(s.email_enabled);
    }

    #[test]
    fn company_and_keyword_overrides_parse() {
        let s = load_with(&[
            ("DART_COMPANIES", "005930:삼성전자, 035720:카카오"),
            ("DART_KEYWORDS", "합병:high,수주"),
        ])
        .unwrap();
        assert_eq!(
            s.dart_companies,
            vec![
                ("005930".to_string(), "삼성전자".to_string()),
                ("035720".to_string(), "카카오".to_string())
            ]
        );
        assert_eq!(s.dart_keywords[0], ("합병".to_string(), "high".to_string()));
        assert_eq!(s.dart_keywords[1], ("수주".to_string(), "general".to_string()));

        assert!(load_with(&[("DART_COMPANIES", "005930")]).is_err());
        assert!(load_with(&[("DART_KEYWORDS", "합병:urgent")]).is_err());
    }
}
