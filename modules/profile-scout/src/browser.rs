// ProfileFetcher backed by a Browserless instance.
//
// A snapshot tries the `web_profile_info` JSON endpoint first and falls back
// to rendering the profile page. Login drives the real login form through a
// puppeteer script and keeps only the session cookies.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use browserless_client::{BrowserlessClient, BrowserlessError, ContentRequest, ContentResponse};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::extract;
use crate::fetcher::{FetchError, ProfileFetcher};
use crate::proxy_pool::ProxyEndpoint;
use crate::session::{Credentials, Session, SESSION_COOKIES};
use crate::types::RawProfile;

const BASE_URL: &str = "https://www.instagram.com";
const COOKIE_DOMAIN: &str = ".instagram.com";

pub const DEFAULT_APP_ID: &str = "936619743392459";

const LOGIN_SCRIPT: &str = r#"
module.exports = async ({ page, context }) => {
  await page.goto('https://www.instagram.com/accounts/login/', { waitUntil: 'networkidle2', timeout: context.timeout });
  await page.waitForSelector('input[name="username"]', { timeout: context.timeout });
  await page.type('input[name="username"]', context.username, { delay: 40 });
  await page.type('input[name="password"]', context.password, { delay: 40 });
  await Promise.all([
    page.click('button[type="submit"]'),
    page.waitForNavigation({ waitUntil: 'networkidle2', timeout: context.timeout }).catch(() => null),
  ]);
  const cookies = await page.cookies();
  return {
    data: { url: page.url(), cookies: cookies.map((c) => ({ name: c.name, value: c.value })) },
    type: 'application/json',
  };
};
"#;

#[derive(Serialize)]
struct LoginContext<'a> {
    username: &'a str,
    password: &'a str,
    timeout: u64,
}

#[derive(Deserialize)]
struct LoginResult {
    url: String,
    cookies: Vec<LoginCookie>,
}

#[derive(Deserialize)]
struct LoginCookie {
    name: String,
    value: String,
}

pub struct BrowserlessFetcher {
    client: BrowserlessClient,
    app_id: String,
    page_timeout: Duration,
}

impl BrowserlessFetcher {
    pub fn new(
        client: BrowserlessClient,
        app_id: impl Into<String>,
        page_timeout: Duration,
    ) -> Self {
        Self {
            client,
            app_id: app_id.into(),
            page_timeout,
        }
    }

    fn request(
        &self,
        url: String,
        account: &Account,
        session: &Session,
        proxy: Option<&ProxyEndpoint>,
    ) -> ContentRequest {
        let mut req = ContentRequest::new(url)
            .header("X-IG-App-ID", &self.app_id)
            .header("Accept-Language", "en-US,en;q=0.9")
            .header("Referer", &format!("{BASE_URL}/{account}/"))
            .timeout(self.page_timeout)
            .proxy_server(proxy.map(ProxyEndpoint::browser_server));

        if let Some(csrf) = session.cookie("csrftoken") {
            req = req.header("X-CSRFToken", csrf);
        }
        for (name, value) in &session.cookies {
            req = req.cookie(name, value, COOKIE_DOMAIN);
        }
        req
    }

    async fn from_api(
        &self,
        account: &Account,
        proxy: Option<&ProxyEndpoint>,
        session: &Session,
    ) -> Result<Option<RawProfile>, FetchError> {
        let url = format!("{BASE_URL}/api/v1/users/web_profile_info/?username={account}");
        let req = self
            .request(url, account, session, proxy)
            .header("Accept", "application/json")
            .header("X-Requested-With", "XMLHttpRequest");

        let resp = self.client.content(&req).await.map_err(map_browserless_error)?;
        check_status(&resp)?;
        Ok(extract::from_api_payload(&resp.html))
    }

    async fn from_page(
        &self,
        account: &Account,
        proxy: Option<&ProxyEndpoint>,
        session: &Session,
    ) -> Result<RawProfile, FetchError> {
        let req = self.request(format!("{BASE_URL}/{account}/"), account, session, proxy);
        let resp = self.client.content(&req).await.map_err(map_browserless_error)?;
        check_status(&resp)?;

        if let Some(raw) = extract::from_profile_html(&resp.html) {
            return Ok(raw);
        }
        if is_login_wall(&resp.html) {
            return Err(FetchError::Challenge("profile page redirected to login".into()));
        }
        Err(FetchError::Incomplete(format!(
            "no profile data in {} bytes of HTML",
            resp.html.len()
        )))
    }
}

#[async_trait]
impl ProfileFetcher for BrowserlessFetcher {
    async fn fetch_snapshot(
        &self,
        account: &Account,
        proxy: Option<&ProxyEndpoint>,
        session: &Session,
    ) -> Result<RawProfile, FetchError> {
        match self.from_api(account, proxy, session).await {
            Ok(Some(raw)) => {
                debug!(%account, "Profile read from web_profile_info");
                return Ok(raw);
            }
            Ok(None) => debug!(%account, "web_profile_info carried no user, rendering page"),
            // The network path is broken; the page load would fail the same way.
            Err(e) if e.is_network() => return Err(e),
            Err(e @ FetchError::Status { status: 404, .. }) => return Err(e),
            Err(e) => debug!(%account, error = %e, "web_profile_info failed, rendering page"),
        }

        self.from_page(account, proxy, session).await
    }

    async fn login(
        &self,
        credentials: &Credentials,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<Session, FetchError> {
        let context = LoginContext {
            username: &credentials.username,
            password: &credentials.password,
            timeout: self.page_timeout.as_millis() as u64,
        };
        let server = proxy.map(ProxyEndpoint::browser_server);

        let result: LoginResult = self
            .client
            .function(LOGIN_SCRIPT, &context, server.as_deref())
            .await
            .map_err(map_browserless_error)?;

        if result.url.contains("/challenge") || result.url.contains("two_factor") {
            return Err(FetchError::Challenge(format!("login stopped at {}", result.url)));
        }

        let cookies: BTreeMap<String, String> = result
            .cookies
            .into_iter()
            .filter(|c| SESSION_COOKIES.contains(&c.name.as_str()) && !c.value.is_empty())
            .map(|c| (c.name, c.value))
            .collect();

        if !cookies.contains_key("sessionid") {
            warn!(url = %result.url, "Login finished without a sessionid cookie");
            return Err(FetchError::Status {
                status: 401,
                message: "login rejected".into(),
            });
        }

        info!(user = %credentials.username, "Browser login succeeded");
        Ok(Session::new(cookies, Utc::now()))
    }
}

fn check_status(resp: &ContentResponse) -> Result<(), FetchError> {
    match resp.status {
        Some(status) if status >= 400 => Err(FetchError::Status {
            status,
            message: "upstream error page".into(),
        }),
        _ => Ok(()),
    }
}

fn is_login_wall(html: &str) -> bool {
    html.contains("/accounts/login")
        || html.contains("/challenge/")
        || html.contains("checkpoint_required")
}

/// Chrome network errors surface through the Browserless error body.
fn map_browserless_error(err: BrowserlessError) -> FetchError {
    match err {
        BrowserlessError::Timeout(m) => FetchError::Timeout(m),
        BrowserlessError::Connect(m) => {
            FetchError::Other(format!("browser service unreachable: {m}"))
        }
        BrowserlessError::Network(m) => FetchError::Other(m),
        BrowserlessError::Parse(m) => FetchError::Incomplete(m),
        BrowserlessError::Api { status, message } => {
            if message.contains("ERR_PROXY_CONNECTION_FAILED")
                || message.contains("ERR_SOCKS_CONNECTION_FAILED")
                || message.contains("ERR_CONNECTION_REFUSED")
                || message.contains("ERR_TUNNEL_CONNECTION_FAILED")
            {
                FetchError::Connect(message)
            } else if message.contains("ERR_TIMED_OUT") || message.contains("TimeoutError") {
                FetchError::Timeout(message)
            } else if status == 429 {
                FetchError::Status { status, message }
            } else {
                FetchError::Other(format!("browserless {status}: {message}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_failures_from_chrome_are_connect_errors() {
        let err = map_browserless_error(BrowserlessError::Api {
            status: 500,
            message: "net::ERR_SOCKS_CONNECTION_FAILED at https://www.instagram.com/".into(),
        });
        assert!(matches!(err, FetchError::Connect(_)));
        assert!(err.is_network());
    }

    #[test]
    fn navigation_timeout_is_timeout() {
        let err = map_browserless_error(BrowserlessError::Api {
            status: 500,
            message: "TimeoutError: Navigation timeout of 20000 ms exceeded".into(),
        });
        assert!(matches!(err, FetchError::Timeout(_)));
    }

    #[test]
    fn browser_service_down_does_not_blame_the_proxy() {
        let err = map_browserless_error(BrowserlessError::Connect("refused".into()));
        assert!(!err.is_network());
    }

    #[test]
    fn upstream_status_is_surfaced() {
        let resp = ContentResponse {
            status: Some(404),
            html: String::new(),
        };
        assert!(matches!(
            check_status(&resp),
            Err(FetchError::Status { status: 404, .. })
        ));
        let ok = ContentResponse {
            status: None,
            html: String::new(),
        };
        assert!(check_status(&ok).is_ok());
    }

    #[test]
    fn login_redirect_is_detected() {
        assert!(is_login_wall(r#"<a href="/accounts/login/?next=/nasa/">Log in</a>"#));
        assert!(!is_login_wall("<html><body>profile</body></html>"));
    }
}
