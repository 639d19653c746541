pub mod error;

pub use error::{BrowserlessError, Result};

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Header Browserless uses to report the status code of the rendered page.
const RESPONSE_CODE_HEADER: &str = "x-response-code";

pub struct BrowserlessClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

/// A cookie injected into the page before navigation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GotoOptions {
    pub wait_until: String,
    pub timeout: u64,
}

impl Default for GotoOptions {
    fn default() -> Self {
        Self {
            wait_until: "networkidle2".to_string(),
            timeout: 30_000,
        }
    }
}

/// Body for the `/content` endpoint. The proxy is not part of the body:
/// Browserless takes Chrome launch flags through the `launch` query parameter.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRequest {
    pub url: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cookies: Vec<Cookie>,
    #[serde(
        rename = "setExtraHTTPHeaders",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub extra_headers: BTreeMap<String, String>,
    pub goto_options: GotoOptions,
    #[serde(skip)]
    pub proxy_server: Option<String>,
}

impl ContentRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            cookies: Vec::new(),
            extra_headers: BTreeMap::new(),
            goto_options: GotoOptions::default(),
            proxy_server: None,
        }
    }

    pub fn cookie(mut self, name: &str, value: &str, domain: &str) -> Self {
        self.cookies.push(Cookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: domain.to_string(),
        });
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.extra_headers
            .insert(name.to_string(), value.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.goto_options.timeout = timeout.as_millis() as u64;
        self
    }

    /// Route the browser through a proxy, e.g. `socks5://host:1080`.
    pub fn proxy_server(mut self, proxy: Option<String>) -> Self {
        self.proxy_server = proxy;
        self
    }
}

/// Rendered page plus the status code the target site answered with.
#[derive(Debug, Clone)]
pub struct ContentResponse {
    pub status: Option<u16>,
    pub html: String,
}

#[derive(Serialize)]
struct FunctionBody<'a, C: Serialize> {
    code: &'a str,
    context: &'a C,
}

impl BrowserlessClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self> {
        Self::with_timeout(base_url, token, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: &str, token: Option<&str>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
        })
    }

    /// Fetch fully-rendered HTML content for a URL via Browserless /content endpoint.
    pub async fn content(&self, request: &ContentRequest) -> Result<ContentResponse> {
        let endpoint = format!("{}/content", self.base_url);
        let query = self.query(request.proxy_server.as_deref())?;

        tracing::debug!(url = %request.url, proxied = request.proxy_server.is_some(), "browserless: content");

        let resp = self
            .client
            .post(&endpoint)
            .query(&query)
            .json(request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BrowserlessError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let upstream_status = resp
            .headers()
            .get(RESPONSE_CODE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u16>().ok());

        Ok(ContentResponse {
            status: upstream_status,
            html: resp.text().await?,
        })
    }

    /// Run a puppeteer script via the /function endpoint and decode its JSON result.
    /// The script receives `context` as its second argument.
    pub async fn function<C, T>(
        &self,
        code: &str,
        context: &C,
        proxy_server: Option<&str>,
    ) -> Result<T>
    where
        C: Serialize,
        T: DeserializeOwned,
    {
        let endpoint = format!("{}/function", self.base_url);
        let query = self.query(proxy_server)?;

        let resp = self
            .client
            .post(&endpoint)
            .query(&query)
            .json(&FunctionBody { code, context })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BrowserlessError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body = resp.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    fn query(&self, proxy_server: Option<&str>) -> Result<Vec<(&'static str, String)>> {
        let mut query = Vec::new();
        if let Some(ref token) = self.token {
            query.push(("token", token.clone()));
        }
        if let Some(proxy) = proxy_server {
            query.push(("launch", launch_param(proxy)?));
        }
        Ok(query)
    }
}

/// Chrome launch flags that route all traffic through `proxy`.
fn launch_param(proxy: &str) -> Result<String> {
    let launch = serde_json::json!({
        "args": [format!("--proxy-server={proxy}")],
    });
    Ok(serde_json::to_string(&launch)?)
}
