pub mod account;
pub mod browser;
pub mod cache;
pub mod coordinator;
pub mod error;
pub mod extract;
pub mod fetcher;
pub mod images;
mod persist;
pub mod proxy_pool;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod types;

pub use account::Account;
pub use browser::BrowserlessFetcher;
pub use cache::{CacheStore, FileCacheStore};
pub use coordinator::{RequestCoordinator, ScoutConfig, ScoutDeps};
pub use error::{Result, ScoutError};
pub use fetcher::{AttemptOutcome, FetchError, ProfileFetcher};
pub use images::{HttpImageDownloader, ImageArchiver, ImageDownloader};
pub use proxy_pool::{HealthState, ProxyCredentials, ProxyEndpoint, ProxyPool, ProxyPoolConfig};
pub use session::{Credentials, Session, SessionConfig, SessionManager};
pub use types::{CacheEntry, Profile, RawProfile, Snapshot};
