use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use profile_scout::{RequestCoordinator, ScoutError};

pub struct AppState {
    pub coordinator: RequestCoordinator,
    pub auth_header: String,
    /// `None` disables the key check.
    pub auth_key: Option<String>,
}

#[derive(Deserialize)]
pub struct ProfileQuery {
    #[serde(default)]
    refresh: bool,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/instagram/{username}", get(get_profile))
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let proxies: Vec<_> = state
        .coordinator
        .proxy_status()
        .into_iter()
        .map(|s| {
            json!({
                "proxy": s.endpoint.to_string(),
                "state": s.state.as_str(),
                "consecutiveFailures": s.consecutive_failures,
            })
        })
        .collect();

    Json(json!({
        "status": "ok",
        "inFlight": state.coordinator.in_flight(),
        "proxies": proxies,
    }))
}

async fn get_profile(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
    Query(query): Query<ProfileQuery>,
    headers: HeaderMap,
) -> Response {
    if let Some(expected) = &state.auth_key {
        let provided = headers
            .get(state.auth_header.as_str())
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            return error_response(StatusCode::UNAUTHORIZED, "Invalid or missing API key");
        }
    }

    match state.coordinator.get_profile(&username, query.refresh).await {
        Ok(profile) => {
            info!(
                username = %profile.account,
                cached = profile.is_cached,
                stale = profile.is_stale,
                "Profile served"
            );
            Json(json!({ "data": profile })).into_response()
        }
        Err(e) => {
            warn!(%username, error = %e, "Profile lookup failed");
            let status =
                StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            error_response(status, &detail(&e))
        }
    }
}

fn detail(err: &ScoutError) -> String {
    match err {
        ScoutError::PermanentFetch(_) => "Profile not found or not accessible".to_string(),
        ScoutError::NoAvailableProxy => "No proxy available, try again later".to_string(),
        ScoutError::WaitTimedOut(_) => {
            "Lookup still in progress, retry shortly for the cached result".to_string()
        }
        other => other.to_string(),
    }
}

fn error_response(status: StatusCode, detail: &str) -> Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::Request;
    use profile_scout::testing::{MemoryCacheStore, MockFetcher, MockImageDownloader};
    use profile_scout::{
        ImageArchiver, ProxyPool, ProxyPoolConfig, RawProfile, ScoutConfig, ScoutDeps,
        SessionConfig, SessionManager,
    };
    use tower::ServiceExt;

    async fn app(fetcher: MockFetcher, auth_key: Option<&str>) -> (Router, tempfile::TempDir) {
        let fetcher = Arc::new(fetcher);
        let proxies = Arc::new(ProxyPool::new(Vec::new(), ProxyPoolConfig::default()));
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(
            SessionManager::load(SessionConfig::default(), fetcher.clone(), proxies.clone()).await,
        );
        let images = Arc::new(ImageArchiver::new(
            dir.path(),
            Arc::new(MockImageDownloader::new()),
            proxies.clone(),
            1,
        ));
        let deps = ScoutDeps::builder()
            .fetcher(fetcher)
            .proxies(proxies)
            .sessions(sessions)
            .cache(Arc::new(MemoryCacheStore::new()))
            .images(images)
            .config(ScoutConfig {
                retry_backoff: std::time::Duration::ZERO,
                connect_check: None,
                ..Default::default()
            })
            .build();

        let state = Arc::new(AppState {
            coordinator: RequestCoordinator::new(deps),
            auth_header: "X-API-Key".to_string(),
            auth_key: auth_key.map(String::from),
        });
        (router(state), dir)
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn nasa() -> MockFetcher {
        MockFetcher::new().on_profile(
            "nasa",
            RawProfile {
                followers: Some(97_000_000),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn profile_is_wrapped_in_data_envelope() {
        let (app, _dir) = app(nasa(), None).await;

        let resp = app
            .oneshot(Request::get("/instagram/NASA").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["username"], "nasa");
        assert_eq!(body["data"]["followers"], 97_000_000);
        assert_eq!(body["data"]["isCached"], false);
    }

    #[tokio::test]
    async fn missing_api_key_is_rejected() {
        let (app, _dir) = app(nasa(), Some("sekret")).await;

        let resp = app
            .oneshot(Request::get("/instagram/nasa").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(body_json(resp).await["detail"].is_string());
    }

    #[tokio::test]
    async fn valid_api_key_is_accepted() {
        let (app, _dir) = app(nasa(), Some("sekret")).await;

        let resp = app
            .oneshot(
                Request::get("/instagram/nasa?refresh=true")
                    .header("X-API-Key", "sekret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_profile_is_404() {
        let (app, _dir) = app(MockFetcher::new(), None).await;

        let resp = app
            .oneshot(Request::get("/instagram/ghost").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_handle_is_400() {
        let (app, _dir) = app(MockFetcher::new(), None).await;

        let resp = app
            .oneshot(Request::get("/instagram/bad%20name").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (app, _dir) = app(MockFetcher::new(), Some("sekret")).await;

        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }
}
