// Test mocks for the lookup pipeline.
//
// One mock per trait boundary:
// - MockFetcher (ProfileFetcher): scripted per-account responses, per-proxy
//   failures, recorded calls, scripted logins
// - MockImageDownloader (ImageDownloader): queued responses, recorded proxies
// - MemoryCacheStore (CacheStore): in-memory map with a switchable failure mode

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::account::Account;
use crate::cache::CacheStore;
use crate::error::{Result, ScoutError};
use crate::fetcher::{FetchError, ProfileFetcher};
use crate::images::ImageDownloader;
use crate::proxy_pool::ProxyEndpoint;
use crate::session::{Credentials, Session};
use crate::types::{CacheEntry, RawProfile, Snapshot};

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// One recorded `fetch_snapshot` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    pub account: String,
    /// `host:port`, or `None` for a direct connection.
    pub proxy: Option<String>,
    pub authenticated: bool,
}

/// Scripted profile fetcher. Resolution order for a call:
/// failing proxy host, queued one-shot response, anonymous override,
/// registered profile, then 404.
/// Builder pattern: `.on_profile()`, `.on_attempt()`, `.on_anonymous()`,
/// `.fail_through()`, `.on_login()`.
#[derive(Default)]
pub struct MockFetcher {
    profiles: HashMap<String, RawProfile>,
    anonymous: HashMap<String, RawProfile>,
    failing_hosts: HashMap<String, FetchError>,
    queued: Mutex<HashMap<String, VecDeque<std::result::Result<RawProfile, FetchError>>>>,
    logins: Mutex<VecDeque<std::result::Result<Session, FetchError>>>,
    delay: Option<Duration>,
    login_delay: Option<Duration>,
    calls: Mutex<Vec<FetchCall>>,
    login_calls: AtomicUsize,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returned for every fetch of `account` unless something more specific applies.
    pub fn on_profile(mut self, account: &str, raw: RawProfile) -> Self {
        self.profiles.insert(account.to_string(), raw);
        self
    }

    /// Queue a one-shot result for the next fetch of `account`.
    pub fn on_attempt(
        mut self,
        account: &str,
        result: std::result::Result<RawProfile, FetchError>,
    ) -> Self {
        self.queued
            .get_mut()
            .unwrap()
            .entry(account.to_string())
            .or_default()
            .push_back(result);
        self
    }

    /// What an unauthenticated fetch of `account` sees.
    pub fn on_anonymous(mut self, account: &str, raw: RawProfile) -> Self {
        self.anonymous.insert(account.to_string(), raw);
        self
    }

    /// Every fetch routed through `host` fails with `err`.
    pub fn fail_through(mut self, host: &str, err: FetchError) -> Self {
        self.failing_hosts.insert(host.to_string(), err);
        self
    }

    /// Queue the result of the next login.
    pub fn on_login(self, result: std::result::Result<Session, FetchError>) -> Self {
        self.logins.lock().unwrap().push_back(result);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_login_delay(mut self, delay: Duration) -> Self {
        self.login_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    fn resolve(
        &self,
        account: &str,
        proxy: Option<&ProxyEndpoint>,
        session: &Session,
    ) -> std::result::Result<RawProfile, FetchError> {
        if let Some(err) = proxy.and_then(|p| self.failing_hosts.get(&p.host)) {
            return Err(err.clone());
        }
        if let Some(result) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(account)
            .and_then(VecDeque::pop_front)
        {
            return result;
        }
        if !session.is_authenticated() {
            if let Some(raw) = self.anonymous.get(account) {
                return Ok(raw.clone());
            }
        }
        self.profiles
            .get(account)
            .cloned()
            .ok_or_else(|| FetchError::Status {
                status: 404,
                message: format!("MockFetcher: no profile registered for {account}"),
            })
    }
}

#[async_trait]
impl ProfileFetcher for MockFetcher {
    async fn fetch_snapshot(
        &self,
        account: &Account,
        proxy: Option<&ProxyEndpoint>,
        session: &Session,
    ) -> std::result::Result<RawProfile, FetchError> {
        self.calls.lock().unwrap().push(FetchCall {
            account: account.to_string(),
            proxy: proxy.map(|p| p.to_string()),
            authenticated: session.is_authenticated(),
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.resolve(account.as_str(), proxy, session)
    }

    async fn login(
        &self,
        _credentials: &Credentials,
        _proxy: Option<&ProxyEndpoint>,
    ) -> std::result::Result<Session, FetchError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.login_delay {
            tokio::time::sleep(delay).await;
        }
        self.logins
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(FetchError::Other("MockFetcher: no login scripted".into())))
    }
}

// ---------------------------------------------------------------------------
// MockImageDownloader
// ---------------------------------------------------------------------------

/// Returns queued responses in order, then a small fixed body.
#[derive(Default)]
pub struct MockImageDownloader {
    responses: Mutex<VecDeque<std::result::Result<Vec<u8>, FetchError>>>,
    proxies: Mutex<Vec<Option<String>>>,
    delay: Option<Duration>,
}

impl MockImageDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn respond(&self, result: std::result::Result<Vec<u8>, FetchError>) {
        self.responses.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.proxies.lock().unwrap().len()
    }

    pub fn proxies_used(&self) -> Vec<Option<String>> {
        self.proxies.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageDownloader for MockImageDownloader {
    async fn download(
        &self,
        _url: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> std::result::Result<Vec<u8>, FetchError> {
        self.proxies.lock().unwrap().push(proxy.map(|p| p.to_string()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(b"\xff\xd8\xff\xe0mock-jpeg".to_vec()))
    }
}

// ---------------------------------------------------------------------------
// MemoryCacheStore
// ---------------------------------------------------------------------------

/// In-memory CacheStore. `set_failing(true)` makes every call return
/// `CacheUnavailable`.
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<Account, CacheEntry>>,
    failing: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entry with an explicit `stored_at`, e.g. to make it stale.
    pub fn insert(&self, snapshot: Snapshot, stored_at: DateTime<Utc>) {
        self.entries.lock().unwrap().insert(
            snapshot.account.clone(),
            CacheEntry {
                snapshot,
                stored_at,
            },
        );
    }

    pub fn entry(&self, account: &str) -> Option<CacheEntry> {
        let account = Account::parse(account).ok()?;
        self.entries.lock().unwrap().get(&account).cloned()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ScoutError::CacheUnavailable("MemoryCacheStore: failing".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, account: &Account) -> Result<Option<CacheEntry>> {
        self.check()?;
        Ok(self.entries.lock().unwrap().get(account).cloned())
    }

    async fn put(&self, account: &Account, snapshot: Snapshot) -> Result<()> {
        self.check()?;
        let mut entries = self.entries.lock().unwrap();
        if entries.get(account).is_some_and(|e| e.snapshot == snapshot) {
            return Ok(());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        entries.insert(
            account.clone(),
            CacheEntry {
                snapshot,
                stored_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn attach_image_path(
        &self,
        account: &Account,
        fetched_at: DateTime<Utc>,
        path: String,
    ) -> Result<bool> {
        self.check()?;
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(account) {
            Some(entry) if entry.snapshot.fetched_at == fetched_at => {
                self.writes.fetch_add(1, Ordering::SeqCst);
                entry.snapshot = entry.snapshot.with_local_path(Some(path));
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
