// Authenticated browsing session: cookies persisted across restarts, acquired
// by logging in when credentials are configured, anonymous otherwise.
//
// Only one login runs at a time. Callers arriving while it is in flight queue
// on the acquisition lock and pick up its settled result instead of logging in
// again. A failed login is remembered for `login_retry_after` so bad
// credentials are not retried on every request.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, ScoutError};
use crate::fetcher::ProfileFetcher;
use crate::persist::write_atomic;
use crate::proxy_pool::ProxyPool;

/// Cookies worth keeping from a login.
pub const SESSION_COOKIES: [&str; 3] = ["sessionid", "csrftoken", "ds_user_id"];

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub cookies: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub invalidated: bool,
}

impl Session {
    pub fn new(cookies: BTreeMap<String, String>, created_at: DateTime<Utc>) -> Self {
        Self {
            cookies,
            created_at,
            expires_at: None,
            invalidated: false,
        }
    }

    /// Sentinel for unauthenticated browsing.
    pub fn anonymous() -> Self {
        Self::new(BTreeMap::new(), Utc::now())
    }

    pub fn is_authenticated(&self) -> bool {
        self.cookies.get("sessionid").is_some_and(|v| !v.is_empty())
    }

    /// Authenticated, not invalidated, not expired.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.is_authenticated() && !self.invalidated && self.expires_at.map_or(true, |e| now < e)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub credentials: Option<Credentials>,
    /// Where the session survives restarts. `None` keeps it in memory only.
    pub cookie_file: Option<PathBuf>,
    /// Cookies supplied directly by configuration, used as a non-expiring session.
    pub seed_cookies: BTreeMap<String, String>,
    pub session_ttl: Duration,
    pub login_retry_after: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            credentials: None,
            cookie_file: None,
            seed_cookies: BTreeMap::new(),
            session_ttl: Duration::from_secs(7 * 24 * 3600),
            login_retry_after: Duration::from_secs(300),
        }
    }
}

#[derive(Default)]
struct AcquireState {
    last_failure: Option<(Instant, String)>,
}

pub struct SessionManager {
    config: SessionConfig,
    fetcher: Arc<dyn ProfileFetcher>,
    proxies: Arc<ProxyPool>,
    current: RwLock<Option<Arc<Session>>>,
    acquiring: tokio::sync::Mutex<AcquireState>,
}

impl SessionManager {
    /// Build the manager, restoring a persisted session if one is present.
    /// Seed cookies are layered over the restored session, or used on their own.
    pub async fn load(
        config: SessionConfig,
        fetcher: Arc<dyn ProfileFetcher>,
        proxies: Arc<ProxyPool>,
    ) -> Self {
        let now = Utc::now();
        let persisted = match &config.cookie_file {
            Some(path) => read_session_file(path).await,
            None => None,
        };

        let current = match persisted {
            Some(mut s) if s.is_usable(now) => {
                info!(created_at = %s.created_at, "Restored persisted session");
                // Configured cookies override the persisted ones.
                let overridden = config
                    .seed_cookies
                    .iter()
                    .filter(|(k, v)| s.cookies.get(*k) != Some(*v))
                    .count();
                if overridden > 0 {
                    info!(cookies = overridden, "Applied session cookies from configuration");
                }
                s.cookies.extend(config.seed_cookies.clone());
                Some(s)
            }
            Some(_) => {
                info!("Persisted session expired or invalidated");
                None
            }
            None => None,
        }
        .or_else(|| {
            let seed = Session::new(config.seed_cookies.clone(), now);
            seed.is_authenticated().then(|| {
                info!("Using session cookies from configuration");
                seed
            })
        });

        if current.is_none() && config.credentials.is_none() {
            info!("No credentials configured; browsing anonymously");
        }

        Self {
            config,
            fetcher,
            proxies,
            current: RwLock::new(current.map(Arc::new)),
            acquiring: tokio::sync::Mutex::new(AcquireState::default()),
        }
    }

    /// Current session, logging in first if needed. Returns the anonymous
    /// sentinel when no credentials are configured.
    pub async fn get_session(&self) -> Result<Arc<Session>> {
        if let Some(session) = self.settled() {
            return Ok(session);
        }
        let Some(credentials) = self.config.credentials.clone() else {
            return Ok(Arc::new(Session::anonymous()));
        };

        let mut state = self.acquiring.lock().await;

        // Another caller may have finished a login while we waited.
        if let Some(session) = self.settled() {
            return Ok(session);
        }
        if let Some((at, reason)) = &state.last_failure {
            if at.elapsed() < self.config.login_retry_after {
                debug!("Recent login failure, not retrying yet");
                return Err(ScoutError::SessionAcquisition(reason.clone()));
            }
        }

        let proxy = self
            .proxies
            .route()
            .map_err(|e| ScoutError::SessionAcquisition(e.to_string()))?;

        info!(user = %credentials.username, proxy = ?proxy.as_deref().map(|p| p.to_string()), "Logging in");
        let started = Instant::now();
        let result = self.fetcher.login(&credentials, proxy.as_deref()).await;

        if let Some(p) = &proxy {
            let network_failure = result.as_ref().err().is_some_and(|e| e.is_network());
            self.proxies.report_outcome(p, !network_failure);
        }

        let mut session = match result {
            Ok(session) if session.is_authenticated() => session,
            Ok(_) => {
                let reason = "login returned no session cookie".to_string();
                warn!(%reason, "Login failed");
                state.last_failure = Some((Instant::now(), reason.clone()));
                return Err(ScoutError::SessionAcquisition(reason));
            }
            Err(e) => {
                warn!(error = %e, "Login failed");
                state.last_failure = Some((Instant::now(), e.to_string()));
                return Err(ScoutError::SessionAcquisition(e.to_string()));
            }
        };

        session.cookies.retain(|k, _| SESSION_COOKIES.contains(&k.as_str()));
        if session.expires_at.is_none() {
            let ttl = TimeDelta::from_std(self.config.session_ttl).unwrap_or(TimeDelta::MAX);
            session.expires_at = session.created_at.checked_add_signed(ttl);
        }
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "Login completed");

        self.persist(&session).await;
        let session = Arc::new(session);
        self.set_current(Some(session.clone()));
        state.last_failure = None;
        Ok(session)
    }

    /// Drop `session` after the upstream rejected it. No-op if it was already replaced.
    pub async fn invalidate(&self, session: &Session) {
        if !session.is_authenticated() {
            return;
        }
        let is_current = self
            .settled()
            .is_some_and(|current| current.cookies == session.cookies);
        if !is_current {
            return;
        }

        warn!(created_at = %session.created_at, "Session rejected upstream, invalidating");
        self.set_current(None);

        let mut rejected = session.clone();
        rejected.invalidated = true;
        self.persist(&rejected).await;
    }

    fn settled(&self) -> Option<Arc<Session>> {
        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
        current.as_ref().filter(|s| s.is_usable(Utc::now())).cloned()
    }

    fn set_current(&self, session: Option<Arc<Session>>) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = session;
    }

    async fn persist(&self, session: &Session) {
        let Some(path) = &self.config.cookie_file else {
            return;
        };
        let bytes = match serde_json::to_vec_pretty(session) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "Failed to serialize session");
                return;
            }
        };
        match write_atomic(path, &bytes).await {
            Ok(()) => info!(path = %path.display(), "Persisted session cookies"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to persist session"),
        }
    }
}

/// Read a session file. Also accepts a flat `{"sessionid": ...}` cookie map.
async fn read_session_file(path: &Path) -> Option<Session> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read session file");
            return None;
        }
    };

    if let Ok(session) = serde_json::from_slice::<Session>(&bytes) {
        return Some(session);
    }
    match serde_json::from_slice::<BTreeMap<String, String>>(&bytes) {
        Ok(mut cookies) => {
            cookies.retain(|k, v| SESSION_COOKIES.contains(&k.as_str()) && !v.is_empty());
            Some(Session::new(cookies, Utc::now()))
        }
        Err(_) => {
            warn!(path = %path.display(), "Corrupted session file, ignoring");
            None
        }
    }
}
