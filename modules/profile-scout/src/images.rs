// Profile image archival. Best-effort: a failure here never fails a lookup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::error::{Result, ScoutError};
use crate::fetcher::FetchError;
use crate::persist::write_atomic;
use crate::proxy_pool::{ProxyEndpoint, ProxyPool};

const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "webp", "gif", "heic"];

#[async_trait]
pub trait ImageDownloader: Send + Sync {
    async fn download(
        &self,
        url: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> std::result::Result<Vec<u8>, FetchError>;
}

/// Plain HTTP downloader. Proxied requests carry the endpoint's SOCKS credentials.
pub struct HttpImageDownloader {
    direct: reqwest::Client,
    timeout: Duration,
}

impl HttpImageDownloader {
    pub fn new(timeout: Duration) -> std::result::Result<Self, reqwest::Error> {
        Ok(Self {
            direct: reqwest::Client::builder().timeout(timeout).build()?,
            timeout,
        })
    }

    fn client_for(
        &self,
        proxy: Option<&ProxyEndpoint>,
    ) -> std::result::Result<reqwest::Client, FetchError> {
        let Some(proxy) = proxy else {
            return Ok(self.direct.clone());
        };
        let proxy = reqwest::Proxy::all(proxy.client_url())
            .map_err(|e| FetchError::Other(e.to_string()))?;
        reqwest::Client::builder()
            .timeout(self.timeout)
            .proxy(proxy)
            .build()
            .map_err(|e| FetchError::Other(e.to_string()))
    }
}

#[async_trait]
impl ImageDownloader for HttpImageDownloader {
    async fn download(
        &self,
        url: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> std::result::Result<Vec<u8>, FetchError> {
        let client = self.client_for(proxy)?;
        let resp = client.get(url).send().await.map_err(map_reqwest_error)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                message: format!("image download from {url}"),
            });
        }

        let bytes = resp.bytes().await.map_err(map_reqwest_error)?;
        if bytes.is_empty() {
            return Err(FetchError::Incomplete("empty image body".into()));
        }
        Ok(bytes.to_vec())
    }
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout(err.to_string())
    } else if err.is_connect() {
        FetchError::Connect(err.to_string())
    } else {
        FetchError::Other(err.to_string())
    }
}

pub struct ImageArchiver {
    dir: PathBuf,
    downloader: Arc<dyn ImageDownloader>,
    proxies: Arc<ProxyPool>,
    attempts: u32,
}

impl ImageArchiver {
    pub fn new(
        dir: impl Into<PathBuf>,
        downloader: Arc<dyn ImageDownloader>,
        proxies: Arc<ProxyPool>,
        attempts: u32,
    ) -> Self {
        Self {
            dir: dir.into(),
            downloader,
            proxies,
            attempts: attempts.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deterministic destination: `<dir>/<account>_<YYYYmmddHHMMSS><ext>`.
    pub fn local_path(
        &self,
        account: &Account,
        remote_url: &str,
        fetched_at: DateTime<Utc>,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d%H%M%S");
        self.dir
            .join(format!("{account}_{stamp}.{}", extension_of(remote_url)))
    }

    /// Download `remote_url` through the proxy pool and store it at
    /// [`local_path`](Self::local_path), overwriting any earlier copy.
    pub async fn archive(
        &self,
        account: &Account,
        remote_url: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<PathBuf> {
        let path = self.local_path(account, remote_url, fetched_at);
        let mut last_error = String::new();

        for attempt in 1..=self.attempts {
            let proxy = self.proxies.route()?;
            let result = self.downloader.download(remote_url, proxy.as_deref()).await;

            if let Some(p) = &proxy {
                let network_failure = result.as_ref().err().is_some_and(FetchError::is_network);
                self.proxies.report_outcome(p, !network_failure);
            }

            match result {
                Ok(bytes) => {
                    write_atomic(&path, &bytes).await?;
                    info!(%account, path = %path.display(), bytes = bytes.len(), "Archived profile image");
                    return Ok(path);
                }
                Err(FetchError::Status { status, message })
                    if (400..500).contains(&status) && status != 429 =>
                {
                    return Err(ScoutError::PermanentFetch(format!("{status}: {message}")));
                }
                Err(e) => {
                    debug!(%account, attempt, error = %e, "Image download failed");
                    last_error = e.to_string();
                }
            }
        }

        warn!(%account, attempts = self.attempts, error = %last_error, "Giving up on profile image");
        Err(ScoutError::TransientFetch(last_error))
    }
}

fn extension_of(remote_url: &str) -> String {
    url::Url::parse(remote_url)
        .ok()
        .and_then(|u| {
            let path = u.path().to_string();
            let (_, ext) = path.rsplit_once('.')?;
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
        })
        .unwrap_or_else(|| "jpg".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy_pool::ProxyPoolConfig;
    use crate::testing::MockImageDownloader;
    use chrono::TimeZone;

    fn archiver(
        dir: &Path,
        downloader: Arc<MockImageDownloader>,
        proxies: Vec<ProxyEndpoint>,
    ) -> ImageArchiver {
        let pool = Arc::new(ProxyPool::new(proxies, ProxyPoolConfig::default()));
        ImageArchiver::new(dir, downloader, pool, 2)
    }

    fn fetched_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
    }

    #[test]
    fn path_is_derived_from_account_and_timestamp() {
        let a = archiver(Path::new("/data/images"), Arc::new(MockImageDownloader::new()), vec![]);
        let account = Account::parse("pewdiepie").unwrap();

        let path = a.local_path(&account, "https://scontent.example/v/t51/p.jpg?stp=dst-jpg", fetched_at());
        assert_eq!(path, PathBuf::from("/data/images/pewdiepie_20240309140507.jpg"));

        let png = a.local_path(&account, "https://scontent.example/p.PNG", fetched_at());
        assert_eq!(png, PathBuf::from("/data/images/pewdiepie_20240309140507.png"));

        let none = a.local_path(&account, "https://scontent.example/picture", fetched_at());
        assert_eq!(none.extension().unwrap(), "jpg");
    }

    #[tokio::test]
    async fn archive_writes_bytes_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Arc::new(MockImageDownloader::new());
        downloader.respond(Ok(b"first".to_vec()));
        downloader.respond(Ok(b"second".to_vec()));
        let a = archiver(dir.path(), downloader.clone(), vec![]);
        let account = Account::parse("nasa").unwrap();

        let p1 = a.archive(&account, "https://x.example/p.jpg", fetched_at()).await.unwrap();
        let p2 = a.archive(&account, "https://x.example/p.jpg", fetched_at()).await.unwrap();
        assert_eq!(p1, p2);
        assert_eq!(tokio::fs::read(&p2).await.unwrap(), b"second");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn timeout_is_retried_on_next_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Arc::new(MockImageDownloader::new());
        downloader.respond(Err(FetchError::Timeout("slow".into())));
        downloader.respond(Ok(b"img".to_vec()));
        let a = archiver(
            dir.path(),
            downloader.clone(),
            vec![ProxyEndpoint::new("p1", 1080), ProxyEndpoint::new("p2", 1080)],
        );

        let path = a
            .archive(&Account::parse("nasa").unwrap(), "https://x.example/p.jpg", fetched_at())
            .await
            .unwrap();
        assert!(path.exists());
        let used = downloader.proxies_used();
        assert_eq!(used.len(), 2);
        assert_ne!(used[0], used[1]);
    }

    #[tokio::test]
    async fn missing_image_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Arc::new(MockImageDownloader::new());
        downloader.respond(Err(FetchError::Status {
            status: 404,
            message: "gone".into(),
        }));
        let a = archiver(dir.path(), downloader.clone(), vec![]);

        let err = a
            .archive(&Account::parse("nasa").unwrap(), "https://x.example/p.jpg", fetched_at())
            .await
            .unwrap_err();
        assert!(matches!(err, ScoutError::PermanentFetch(_)));
        assert_eq!(downloader.calls(), 1);
    }
}
