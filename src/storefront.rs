//! HTTP client for the target storefront.
//!
//! Login is a two-step form flow (CSRF cookie, then hidden login token).
//! Purchases are form posts sent through the login's cookie jar, so any
//! cookie the site rotates mid-session is carried by the next call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::cookie::Jar;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, ClientBuilder};
use scraper::{Html, Selector};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::error::{EngineError, Result};
use crate::purchase::messages::Outcome;
use crate::purchase::session::Session;
use crate::purchase::traits::{
    CookieJar, Credentials, LoginTimings, RemoteResponse, ResponseClassifier, Storefront,
};
use crate::purchase::types::ItemRef;

const CSRF_COOKIE: &str = "ceo_csrf_cookie";
const LOGIN_TOKEN_INPUT: &str = "loginToken";

// ─────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct StorefrontConfig {
    pub base_url: Url,
    pub login: String,
    pub password: SecretString,
    /// Code submitted with every purchase form.
    pub buyer_code: SecretString,
    pub connect_timeout: Duration,
    /// Whole-request timeout for the login round-trips.
    pub login_timeout: Duration,
    pub login_path: String,
    pub purchase_path: String,
}

impl StorefrontConfig {
    pub fn new(base_url: &str, login: &str, password: &str) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: normalize_base(base_url)?,
            login: login.to_string(),
            password: SecretString::from(password.to_string()),
            buyer_code: SecretString::from(password.to_string()),
            connect_timeout: Duration::from_millis(500),
            login_timeout: Duration::from_secs(2),
            login_path: "login".into(),
            purchase_path: "achat/action".into(),
        })
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let base = std::env::var("BASE_URL").context("BASE_URL is not set")?;
        let login = std::env::var("LOGIN").context("LOGIN is not set")?;
        let password = std::env::var("PASSWORD").context("PASSWORD is not set")?;
        let mut c = Self::new(&base, &login, &password)?;
        if let Ok(v) = std::env::var("BUYER_CODE") { c.buyer_code = SecretString::from(v); }
        if let Ok(v) = std::env::var("HTTP_CONNECT_TIMEOUT_MS") { if let Ok(n) = v.parse() { c.connect_timeout = Duration::from_millis(n); } }
        if let Ok(v) = std::env::var("LOGIN_TIMEOUT_MS") { if let Ok(n) = v.parse() { c.login_timeout = Duration::from_millis(n); } }
        Ok(c)
    }
}

/// `Url::join` drops the last path segment unless the base ends with '/'.
fn normalize_base(raw: &str) -> anyhow::Result<Url> {
    let mut url = Url::parse(raw.trim()).with_context(|| format!("invalid base url: {}", raw))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn browser_headers() -> HeaderMap {
    let mut h = HeaderMap::new();
    h.insert(
        header::USER_AGENT,
        HeaderValue::from_static("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36"),
    );
    h.insert(header::ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml"));
    h.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static("fr-FR,fr;q=0.9"));
    h.insert("X-Requested-With", HeaderValue::from_static("XMLHttpRequest"));
    h
}

fn base_builder(cfg: &StorefrontConfig) -> ClientBuilder {
    Client::builder()
        .default_headers(browser_headers())
        .connect_timeout(cfg.connect_timeout)
        .pool_max_idle_per_host(20)
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(30))
}

// ─────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────

pub struct HttpStorefront {
    cfg: StorefrontConfig,
    /// Pooled client bound to the current session's jar.
    session_client: Mutex<Option<(CookieJar, Client)>>,
}

impl HttpStorefront {
    pub fn new(cfg: StorefrontConfig) -> Self {
        Self {
            cfg,
            session_client: Mutex::new(None),
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.cfg
            .base_url
            .join(path)
            .map_err(|e| EngineError::Connectivity(format!("bad endpoint {}: {}", path, e)))
    }

    /// Client that reads and writes `jar`. Rebuilt only when the session changes.
    fn client_for(&self, jar: &CookieJar) -> Result<Client> {
        let mut cached = self.session_client.lock();
        if let Some((held, client)) = cached.as_ref() {
            if Arc::ptr_eq(held, jar) {
                return Ok(client.clone());
            }
        }
        let client = base_builder(&self.cfg)
            .cookie_provider(Arc::clone(jar))
            .build()?;
        *cached = Some((Arc::clone(jar), client.clone()));
        Ok(client)
    }
}

#[async_trait]
impl Storefront for HttpStorefront {
    async fn login(&self) -> Result<Credentials> {
        // Fresh jar per login so a refresh never inherits a dead session.
        let jar: CookieJar = Arc::new(Jar::default());
        let client = base_builder(&self.cfg)
            .cookie_provider(Arc::clone(&jar))
            .timeout(self.cfg.login_timeout)
            .build()?;
        let login_url = self.endpoint(&self.cfg.login_path)?;

        let started = Instant::now();
        let page = client.get(login_url.clone()).send().await?;
        let csrf = page
            .cookies()
            .find(|c| c.name() == CSRF_COOKIE)
            .map(|c| c.value().to_string());
        let html = page.text().await?;

        let csrf = csrf.ok_or_else(|| EngineError::Authentication("CSRF cookie missing".into()))?;
        let login_token = extract_input_value(&html, LOGIN_TOKEN_INPUT)
            .ok_or_else(|| EngineError::Authentication("login token not found".into()))?;
        let preparation = started.elapsed();
        debug!(preparation_ms = preparation.as_millis() as u64, "login page parsed, posting credentials");

        let posted = Instant::now();
        let form = [
            ("ceo_csrf_token", csrf.as_str()),
            ("loginToken", login_token.as_str()),
            ("login_string", self.cfg.login.as_str()),
            ("login_pass", self.cfg.password.expose_secret()),
        ];
        let resp = client.post(login_url).form(&form).send().await?;
        let landed = resp.url().clone();
        let body = resp.text().await?;
        let authentication = posted.elapsed();

        if body.to_lowercase().contains("error") || landed.path().contains(self.cfg.login_path.as_str()) {
            return Err(EngineError::Authentication("credentials rejected".into()));
        }

        // Warm the purchase pool now rather than at fire time.
        self.client_for(&jar)?;
        info!("🔐 Logged in as {}", self.cfg.login);

        Ok(Credentials {
            csrf_token: csrf,
            cookies: jar,
            timings: LoginTimings { preparation, authentication },
        })
    }

    async fn purchase(&self, session: &Session, item: &ItemRef) -> Result<RemoteResponse> {
        let url = self.endpoint(&self.cfg.purchase_path)?;
        let creds = session.credentials();
        let client = self.client_for(&creds.cookies)?;
        let form = [
            ("ceo_csrf_token", creds.csrf_token.as_str()),
            ("lot", item.as_str()),
            ("code", self.cfg.buyer_code.expose_secret()),
        ];

        let resp = client.post(url).form(&form).send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        Ok(RemoteResponse { status, body })
    }
}

// ─────────────────────────────────────────────────────────
// Parsing helpers
// ─────────────────────────────────────────────────────────

/// Value of the `<input name="{name}" value="...">` element, if present.
pub fn extract_input_value(html: &str, name: &str) -> Option<String> {
    let selector = Selector::parse(&format!(r#"input[name="{}"]"#, name)).ok()?;
    let doc = Html::parse_document(html);
    doc.select(&selector)
        .find_map(|el| el.value().attr("value"))
        .map(str::to_string)
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(120) {
        Some((cut, _)) => format!("{}…", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

// ─────────────────────────────────────────────────────────
// Classifier
// ─────────────────────────────────────────────────────────

/// Default mapping of storefront answers onto outcome tags.
///
/// 2xx is a success only when the body says so (a JSON `success` flag wins
/// over a plain substring match); any other 2xx is the site refusing the
/// purchase. Throttling and 5xx are transient.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorefrontClassifier;

impl ResponseClassifier for StorefrontClassifier {
    fn classify(&self, response: &RemoteResponse) -> Outcome {
        match response.status {
            200..=299 => {
                let flagged = serde_json::from_str::<Value>(&response.body)
                    .ok()
                    .and_then(|v| v.get("success").and_then(Value::as_bool));
                let ok = flagged
                    .unwrap_or_else(|| response.body.to_lowercase().contains("success"));
                if ok {
                    Outcome::Success
                } else {
                    Outcome::PermanentFailure(snippet(&response.body))
                }
            }
            408 | 425 | 429 | 500..=599 => {
                Outcome::TransientFailure(format!("HTTP {}", response.status))
            }
            s => Outcome::PermanentFailure(format!("HTTP {}: {}", s, snippet(&response.body))),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────
