use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use profile_scout::browser::DEFAULT_APP_ID;
use profile_scout::proxy_pool::DEFAULT_SOCKS_PORT;
use profile_scout::{
    Credentials, ProxyCredentials, ProxyEndpoint, ProxyPoolConfig, ScoutConfig, SessionConfig,
};

/// Service configuration loaded from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct AppConfig {
    // Proxies
    pub proxy_pool: Vec<String>,
    pub proxy_credentials: Option<ProxyCredentials>,
    pub proxy_default_port: u16,
    pub proxy_failure_threshold: u32,
    pub proxy_cooldown: Duration,
    pub proxy_connect_check: bool,
    pub proxy_backoff: Duration,

    // Scraping
    pub scraper_retries: u32,
    pub scraper_timeout: Duration,
    pub cache_ttl: Duration,
    pub request_wait: Duration,

    // Instagram
    pub instagram_credentials: Option<Credentials>,
    pub instagram_sessionid: Option<String>,
    pub instagram_csrftoken: Option<String>,
    pub instagram_cookie_file: PathBuf,
    pub instagram_app_id: String,
    pub session_ttl: Duration,
    pub login_retry: Duration,

    // Storage
    pub cache_dir: PathBuf,
    pub images_dir: PathBuf,

    // Browser
    pub browserless_url: String,
    pub browserless_token: Option<String>,

    // API
    pub api_host: String,
    pub api_port: u16,
    pub api_auth_header: String,
    pub api_auth_key: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.log_keys();
        Ok(config)
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let proxy_credentials = match (var("PROXY_USERNAME"), var("PROXY_PASSWORD")) {
            (Some(username), password) => Some(ProxyCredentials {
                username,
                password: password.unwrap_or_default(),
            }),
            (None, _) => None,
        };
        let instagram_credentials = match (var("INSTAGRAM_USERNAME"), var("INSTAGRAM_PASSWORD")) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            _ => None,
        };

        Ok(Self {
            proxy_pool: var("PROXY_POOL")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            proxy_credentials,
            proxy_default_port: parse_or(&var, "PROXY_DEFAULT_PORT", DEFAULT_SOCKS_PORT)?,
            proxy_failure_threshold: parse_or(&var, "PROXY_FAILURE_THRESHOLD", 3)?,
            proxy_cooldown: secs_or(&var, "PROXY_COOLDOWN_SECONDS", 600.0)?,
            proxy_connect_check: parse_or(&var, "PROXY_CONNECT_CHECK", true)?,
            proxy_backoff: secs_or(&var, "PROXY_BACKOFF_SECONDS", 2.0)?,
            scraper_retries: parse_or(&var, "SCRAPER_RETRIES", 3)?,
            scraper_timeout: secs_or(&var, "SCRAPER_TIMEOUT_SECONDS", 20.0)?,
            cache_ttl: secs_or(&var, "CACHE_TTL_SECONDS", 3600.0)?,
            request_wait: secs_or(&var, "REQUEST_WAIT_SECONDS", 90.0)?,
            instagram_credentials,
            instagram_sessionid: var("INSTAGRAM_SESSIONID"),
            instagram_csrftoken: var("INSTAGRAM_CSRFTOKEN"),
            instagram_cookie_file: var("INSTAGRAM_COOKIE_FILE")
                .unwrap_or_else(|| "/data/instagram_cookies.json".to_string())
                .into(),
            instagram_app_id: var("INSTAGRAM_APP_ID").unwrap_or_else(|| DEFAULT_APP_ID.to_string()),
            session_ttl: secs_or(&var, "SESSION_TTL_SECONDS", 604_800.0)?,
            login_retry: secs_or(&var, "LOGIN_RETRY_SECONDS", 300.0)?,
            cache_dir: var("CACHE_DIR").unwrap_or_else(|| "/data/cache".to_string()).into(),
            images_dir: var("IMAGES_DIR").unwrap_or_else(|| "/data/images".to_string()).into(),
            browserless_url: var("BROWSERLESS_URL")
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
            browserless_token: var("BROWSERLESS_TOKEN"),
            api_host: var("API_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            api_port: parse_or(&var, "API_PORT", 8000)?,
            api_auth_header: var("API_AUTH_HEADER").unwrap_or_else(|| "X-API-Key".to_string()),
            api_auth_key: var("API_AUTH_KEY"),
        })
    }

    pub fn proxy_endpoints(&self) -> Result<Vec<ProxyEndpoint>> {
        self.proxy_pool
            .iter()
            .map(|entry| {
                ProxyEndpoint::parse(entry, self.proxy_default_port, self.proxy_credentials.as_ref())
                    .with_context(|| format!("invalid PROXY_POOL entry {entry:?}"))
            })
            .collect()
    }

    pub fn pool_config(&self) -> ProxyPoolConfig {
        ProxyPoolConfig {
            failure_threshold: self.proxy_failure_threshold.max(1),
            cooldown: self.proxy_cooldown,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        let mut seed_cookies = BTreeMap::new();
        if let Some(v) = &self.instagram_sessionid {
            seed_cookies.insert("sessionid".to_string(), v.clone());
        }
        if let Some(v) = &self.instagram_csrftoken {
            seed_cookies.insert("csrftoken".to_string(), v.clone());
        }

        SessionConfig {
            credentials: self.instagram_credentials.clone(),
            cookie_file: Some(self.instagram_cookie_file.clone()),
            seed_cookies,
            session_ttl: self.session_ttl,
            login_retry_after: self.login_retry,
        }
    }

    pub fn scout_config(&self) -> ScoutConfig {
        ScoutConfig {
            max_retries: self.scraper_retries.max(1),
            cache_ttl: self.cache_ttl,
            retry_backoff: self.proxy_backoff,
            wait_timeout: self.request_wait,
            connect_check: self.proxy_connect_check.then_some(Duration::from_secs(5)),
        }
    }

    fn log_keys(&self) {
        fn preview(val: &str) -> String {
            let head: String = val.chars().take(5).collect();
            format!("{head}...({} chars)", val.chars().count())
        }
        fn preview_opt(val: &Option<String>) -> String {
            match val {
                Some(v) if !v.is_empty() => preview(v),
                _ => "<not set>".to_string(),
            }
        }

        tracing::info!("Config loaded:");
        tracing::info!("  PROXY_POOL: {} endpoints", self.proxy_pool.len());
        tracing::info!(
            "  INSTAGRAM_USERNAME: {}",
            self.instagram_credentials
                .as_ref()
                .map(|c| c.username.as_str())
                .unwrap_or("<not set>")
        );
        tracing::info!("  INSTAGRAM_SESSIONID: {}", preview_opt(&self.instagram_sessionid));
        tracing::info!("  BROWSERLESS_URL: {}", self.browserless_url);
        tracing::info!("  BROWSERLESS_TOKEN: {}", preview_opt(&self.browserless_token));
        tracing::info!("  API_AUTH_KEY: {}", preview_opt(&self.api_auth_key));
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{key} has invalid value {raw:?}")),
        None => Ok(default),
    }
}

fn secs_or(var: &impl Fn(&str) -> Option<String>, key: &str, default: f64) -> Result<Duration> {
    let secs: f64 = parse_or(var, key, default)?;
    Duration::try_from_secs_f64(secs).with_context(|| format!("{key} must be a non-negative number"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let c = config(&[]).unwrap();
        assert!(c.proxy_pool.is_empty());
        assert_eq!(c.proxy_default_port, 1080);
        assert_eq!(c.cache_ttl, Duration::from_secs(3600));
        assert_eq!(c.scraper_retries, 3);
        assert_eq!(c.api_port, 8000);
        assert_eq!(c.api_auth_header, "X-API-Key");
        assert_eq!(c.instagram_app_id, "936619743392459");
        assert!(c.instagram_credentials.is_none());
        assert!(c.scout_config().connect_check.is_some());
    }

    #[test]
    fn proxy_pool_gets_shared_credentials_and_default_port() {
        let c = config(&[
            ("PROXY_POOL", "10.0.0.1, 10.0.0.2:9050 ,socks5://own:pw@10.0.0.3:1081"),
            ("PROXY_USERNAME", "shared"),
            ("PROXY_PASSWORD", "pw"),
        ])
        .unwrap();

        let endpoints = c.proxy_endpoints().unwrap();
        assert_eq!(endpoints.len(), 3);
        assert_eq!(endpoints[0].port, 1080);
        assert_eq!(endpoints[0].credentials.as_ref().unwrap().username, "shared");
        assert_eq!(endpoints[1].port, 9050);
        assert_eq!(endpoints[2].credentials.as_ref().unwrap().username, "own");
    }

    #[test]
    fn bad_number_is_reported_with_key() {
        let err = config(&[("SCRAPER_RETRIES", "lots")]).unwrap_err();
        assert!(err.to_string().contains("SCRAPER_RETRIES"));
    }

    #[test]
    fn fractional_backoff_is_accepted() {
        let c = config(&[("PROXY_BACKOFF_SECONDS", "0.5"), ("PROXY_CONNECT_CHECK", "false")]).unwrap();
        assert_eq!(c.scout_config().retry_backoff, Duration::from_millis(500));
        assert!(c.scout_config().connect_check.is_none());
    }

    #[test]
    fn seed_cookies_flow_into_session_config() {
        let c = config(&[("INSTAGRAM_SESSIONID", "abc"), ("INSTAGRAM_CSRFTOKEN", "tok")]).unwrap();
        let s = c.session_config();
        assert_eq!(s.seed_cookies.get("sessionid").map(String::as_str), Some("abc"));
        assert_eq!(s.seed_cookies.len(), 2);
    }
}
