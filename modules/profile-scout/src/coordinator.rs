// Request coordination: cache-vs-fetch, per-account single-flight, and the
// retry loop across proxies.
//
// Each upstream fetch runs in its own spawned task and is published as a
// shared future. Callers only await that future, so a caller giving up never
// cancels the fetch; the result still lands in the cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use rand::Rng;
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

use crate::account::Account;
use crate::cache::CacheStore;
use crate::error::{Result, ScoutError};
use crate::fetcher::{classify, AttemptOutcome, ProfileFetcher};
use crate::images::ImageArchiver;
use crate::proxy_pool::{ProxyEndpoint, ProxyPool, ProxyStatus};
use crate::session::{Session, SessionManager};
use crate::types::{CacheEntry, Profile, RawProfile, Snapshot};

#[derive(Debug, Clone)]
pub struct ScoutConfig {
    /// Upstream attempts per lookup, each on a freshly selected proxy.
    pub max_retries: u32,
    pub cache_ttl: Duration,
    /// Base delay between attempts; grows linearly with the attempt number.
    pub retry_backoff: Duration,
    /// How long one caller waits on an in-flight fetch.
    pub wait_timeout: Duration,
    /// TCP-probe a proxy before spending an attempt on it. `None` skips the probe.
    pub connect_check: Option<Duration>,
}

impl Default for ScoutConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            cache_ttl: Duration::from_secs(3600),
            retry_backoff: Duration::from_secs(2),
            wait_timeout: Duration::from_secs(90),
            connect_check: Some(Duration::from_secs(5)),
        }
    }
}

/// Long-lived collaborators, constructed once at startup.
#[derive(Clone, TypedBuilder)]
pub struct ScoutDeps {
    pub fetcher: Arc<dyn ProfileFetcher>,
    pub proxies: Arc<ProxyPool>,
    pub sessions: Arc<SessionManager>,
    pub cache: Arc<dyn CacheStore>,
    pub images: Arc<ImageArchiver>,
    #[builder(default)]
    pub config: ScoutConfig,
}

/// One iteration of the retry loop.
struct FetchAttempt<'a> {
    account: &'a Account,
    proxy: Option<Arc<ProxyEndpoint>>,
    session: Arc<Session>,
    number: u32,
}

type SharedResult = Shared<BoxFuture<'static, Result<Profile>>>;

struct Flight {
    id: u64,
    result: SharedResult,
}

struct Inner {
    deps: ScoutDeps,
    in_flight: Mutex<HashMap<Account, Flight>>,
    next_flight: AtomicU64,
}

#[derive(Clone)]
pub struct RequestCoordinator {
    inner: Arc<Inner>,
}

impl RequestCoordinator {
    pub fn new(deps: ScoutDeps) -> Self {
        Self {
            inner: Arc::new(Inner {
                deps,
                in_flight: Mutex::new(HashMap::new()),
                next_flight: AtomicU64::new(0),
            }),
        }
    }

    pub fn proxy_status(&self) -> Vec<ProxyStatus> {
        self.inner.deps.proxies.status()
    }

    /// Look up `raw_account`, serving from cache while fresh unless
    /// `force_refresh` is set.
    pub async fn get_profile(&self, raw_account: &str, force_refresh: bool) -> Result<Profile> {
        let account = Account::parse(raw_account)?;

        if !force_refresh {
            if let Some(entry) = self.inner.read_cache(&account).await {
                if entry.is_fresh(Utc::now(), self.inner.deps.config.cache_ttl) {
                    debug!(%account, "Serving fresh cache entry");
                    return Ok(Profile::cached(entry.snapshot));
                }
            }
        }

        let flight = self.join_or_start(&account, force_refresh);
        match tokio::time::timeout(self.inner.deps.config.wait_timeout, flight).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%account, "Stopped waiting on in-flight fetch; it continues in the background");
                Err(ScoutError::WaitTimedOut(account.to_string()))
            }
        }
    }

    /// Number of accounts with a fetch currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.flights().len()
    }

    fn join_or_start(&self, account: &Account, force_refresh: bool) -> SharedResult {
        let mut flights = self.inner.flights();
        if let Some(flight) = flights.get(account) {
            debug!(%account, "Joining in-flight fetch");
            return flight.result.clone();
        }

        let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.clone();
        let owned = account.clone();
        let task = tokio::spawn(async move {
            let _done = FlightGuard {
                inner: inner.clone(),
                account: owned.clone(),
                id,
            };
            inner.run(owned, force_refresh).await
        });

        let result = async move {
            task.await
                .unwrap_or_else(|e| Err(ScoutError::Internal(format!("fetch task failed: {e}"))))
        }
        .boxed()
        .shared();

        flights.insert(
            account.clone(),
            Flight {
                id,
                result: result.clone(),
            },
        );
        result
    }
}

/// Clears the in-flight slot when the fetch task ends, however it ends.
struct FlightGuard {
    inner: Arc<Inner>,
    account: Account,
    id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut flights = self.inner.flights();
        if flights.get(&self.account).is_some_and(|f| f.id == self.id) {
            flights.remove(&self.account);
        }
    }
}

impl Inner {
    fn flights(&self) -> MutexGuard<'_, HashMap<Account, Flight>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cache read where a storage failure counts as a miss.
    async fn read_cache(&self, account: &Account) -> Option<CacheEntry> {
        match self.deps.cache.get(account).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(%account, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    async fn run(self: Arc<Self>, account: Account, force_refresh: bool) -> Result<Profile> {
        let cached = self.read_cache(&account).await;
        let ttl = self.deps.config.cache_ttl;

        // A flight that finished just before this one started may have filled the cache.
        if !force_refresh {
            if let Some(entry) = &cached {
                if entry.is_fresh(Utc::now(), ttl) {
                    return Ok(Profile::cached(entry.snapshot.clone()));
                }
            }
        }

        match self.fetch_with_retries(&account).await {
            Ok(raw) => Ok(self.commit(account, raw).await),
            Err(err @ ScoutError::PermanentFetch(_)) => Err(err),
            Err(err) => match cached {
                Some(entry) => {
                    warn!(%account, error = %err, stored_at = %entry.stored_at, "Fetch failed, serving cached entry");
                    if entry.is_fresh(Utc::now(), ttl) {
                        Ok(Profile::cached(entry.snapshot))
                    } else {
                        Ok(Profile::stale(entry.snapshot))
                    }
                }
                None => Err(err),
            },
        }
    }

    async fn fetch_with_retries(&self, account: &Account) -> Result<RawProfile> {
        let max = self.deps.config.max_retries.max(1);
        let mut last_error = ScoutError::TransientFetch("no attempt made".into());

        for number in 1..=max {
            let session = match self.deps.sessions.get_session().await {
                Ok(session) => session,
                Err(e) => {
                    warn!(%account, error = %e, "No authenticated session, fetching anonymously");
                    Arc::new(Session::anonymous())
                }
            };
            let attempt = FetchAttempt {
                account,
                proxy: self.deps.proxies.route()?,
                session,
                number,
            };

            match self.attempt(&attempt).await {
                AttemptOutcome::Success(raw) => return Ok(raw),
                AttemptOutcome::Fatal(reason) => {
                    warn!(%account, attempt = number, %reason, "Permanent failure, not retrying");
                    return Err(ScoutError::PermanentFetch(reason));
                }
                AttemptOutcome::SessionRejected(reason) => {
                    warn!(%account, attempt = number, %reason, "Session rejected upstream");
                    self.deps.sessions.invalidate(&attempt.session).await;
                    last_error = ScoutError::TransientFetch(reason);
                }
                AttemptOutcome::Retryable(reason) => {
                    warn!(%account, attempt = number, max, %reason, "Attempt failed");
                    last_error = ScoutError::TransientFetch(reason);
                }
            }

            if number < max {
                self.backoff(number).await;
            }
        }

        Err(last_error)
    }

    /// Run one attempt and report the proxy's part in the outcome.
    async fn attempt(&self, attempt: &FetchAttempt<'_>) -> AttemptOutcome {
        let proxy = attempt.proxy.as_deref();
        let proxy_label = proxy.map(|p| p.to_string()).unwrap_or_else(|| "direct".into());

        if let (Some(p), Some(timeout)) = (proxy, self.deps.config.connect_check) {
            if !p.is_reachable(timeout).await {
                self.deps.proxies.report_outcome(p, false);
                return AttemptOutcome::Retryable(format!("proxy {p} unreachable"));
            }
        }

        debug!(
            account = %attempt.account,
            attempt = attempt.number,
            proxy = %proxy_label,
            authenticated = attempt.session.is_authenticated(),
            "Fetching profile"
        );

        let result = self
            .deps
            .fetcher
            .fetch_snapshot(attempt.account, proxy, &attempt.session)
            .await;
        let outcome = classify(result, attempt.session.is_authenticated());

        if let Some(p) = proxy {
            // A definitive answer, or a rejected session, means the proxy did its job.
            let ok = !matches!(outcome, AttemptOutcome::Retryable(_));
            self.deps.proxies.report_outcome(p, ok);
        }
        outcome
    }

    async fn backoff(&self, attempt: u32) {
        let base = self.deps.config.retry_backoff;
        if base.is_zero() {
            return;
        }
        let jitter = Duration::from_millis(rand::rng().random_range(0..=250));
        tokio::time::sleep(base * attempt + jitter).await;
    }

    /// Write the new snapshot through the cache and schedule its image.
    async fn commit(self: &Arc<Self>, account: Account, raw: RawProfile) -> Profile {
        let fetched_at = Utc::now();
        let snapshot = Snapshot::from_raw(account.clone(), raw, fetched_at);

        if let Err(e) = self.deps.cache.put(&account, snapshot.clone()).await {
            warn!(%account, error = %e, "Cache write failed, returning fetched data anyway");
        }

        let Some(remote) = snapshot.profile_image_remote_url.clone() else {
            info!(%account, followers = ?snapshot.follower_count, "Fetched profile without image");
            return Profile::fresh(snapshot);
        };

        let planned = self.deps.images.local_path(&account, &remote, fetched_at);
        info!(%account, followers = ?snapshot.follower_count, "Fetched profile");

        let inner = self.clone();
        let owner = account.clone();
        tokio::spawn(async move {
            inner.archive_image(owner, remote, fetched_at).await;
        });

        Profile::fresh(snapshot.with_local_path(Some(planned.display().to_string())))
    }

    async fn archive_image(&self, account: Account, remote: String, fetched_at: DateTime<Utc>) {
        let path = match self.deps.images.archive(&account, &remote, fetched_at).await {
            Ok(path) => path,
            Err(e) => {
                warn!(%account, error = %e, "Image archival failed; snapshot keeps no local path");
                return;
            }
        };

        let path = path.display().to_string();
        match self.deps.cache.attach_image_path(&account, fetched_at, path).await {
            Ok(true) => {}
            Ok(false) => debug!(%account, "Snapshot superseded before image archival finished"),
            Err(e) => warn!(%account, error = %e, "Failed to record archived image path"),
        }
    }
}
