use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use browserless_client::BrowserlessClient;
use profile_scout::{
    BrowserlessFetcher, FileCacheStore, HttpImageDownloader, ImageArchiver, ProfileFetcher,
    ProxyPool, RequestCoordinator, ScoutDeps, SessionManager,
};

mod config;
mod routes;

use config::AppConfig;
use routes::AppState;

/// Headroom over the page timeout for the Browserless round trip itself.
const BROWSERLESS_OVERHEAD: Duration = Duration::from_secs(15);

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("profile_scout=info".parse()?)
        .add_directive("profile_scout_api=info".parse()?);

    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let config = AppConfig::from_env()?;

    let proxies = Arc::new(ProxyPool::new(config.proxy_endpoints()?, config.pool_config()));
    if proxies.is_empty() {
        info!("No proxies configured; connecting directly");
    }

    let browser = BrowserlessClient::with_timeout(
        &config.browserless_url,
        config.browserless_token.as_deref(),
        config.scraper_timeout + BROWSERLESS_OVERHEAD,
    )?;
    let fetcher: Arc<dyn ProfileFetcher> = Arc::new(BrowserlessFetcher::new(
        browser,
        config.instagram_app_id.clone(),
        config.scraper_timeout,
    ));

    let sessions =
        Arc::new(SessionManager::load(config.session_config(), fetcher.clone(), proxies.clone()).await);

    let downloader = Arc::new(HttpImageDownloader::new(config.scraper_timeout)?);
    let images = Arc::new(ImageArchiver::new(
        &config.images_dir,
        downloader,
        proxies.clone(),
        config.scraper_retries,
    ));

    let deps = ScoutDeps::builder()
        .fetcher(fetcher)
        .proxies(proxies)
        .sessions(sessions)
        .cache(Arc::new(FileCacheStore::new(&config.cache_dir)))
        .images(images)
        .config(config.scout_config())
        .build();

    let state = Arc::new(AppState {
        coordinator: RequestCoordinator::new(deps),
        auth_header: config.api_auth_header.clone(),
        auth_key: config.api_auth_key.clone(),
    });

    let app = routes::router(state)
        // Logging layer: method + path + status + latency
        .layer(
            tower_http::trace::TraceLayer::new_for_http().make_span_with(
                |request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                },
            ),
        );

    let addr = format!("{}:{}", config.api_host, config.api_port);
    info!("Profile scout API starting on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
