use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::cookie::{CookieStore, Jar};
use url::Url;

use super::messages::Outcome;
use super::session::Session;
use super::types::ItemRef;
use crate::error::Result;

/// Cookie store shared by every call made under one login.
pub type CookieJar = Arc<Jar>;

/// How long each phase of a login took.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoginTimings {
    /// Fetching the login page and scraping its tokens.
    pub preparation: Duration,
    /// Posting the credentials and landing on the account page.
    pub authentication: Duration,
}

/// Credential context produced by a successful login.
#[derive(Clone)]
pub struct Credentials {
    /// Anti-forgery token that must accompany every form post.
    pub csrf_token: String,
    /// Authenticated jar. Purchases read from it and write `Set-Cookie` back.
    pub cookies: CookieJar,
    pub timings: LoginTimings,
}

impl Credentials {
    /// Credentials with an empty jar and no recorded timings.
    pub fn new(csrf_token: impl Into<String>) -> Self {
        Self {
            csrf_token: csrf_token.into(),
            cookies: Arc::new(Jar::default()),
            timings: LoginTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: LoginTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Serialized `Cookie` header the jar would send to `url`.
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        self.cookies
            .cookies(url)
            .and_then(|h| h.to_str().ok().map(str::to_string))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("csrf_token", &"[redacted]")
            .field("cookies", &"[redacted]")
            .field("timings", &self.timings)
            .finish()
    }
}

/// Raw storefront answer to a purchase post, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: String,
}

/// Transport seam towards the target site.
///
/// `login` returns `Authentication` when credentials are refused and
/// `Connectivity` on transport failure; `purchase` returns `Connectivity`
/// on transport failure and otherwise hands back whatever the site said.
#[async_trait]
pub trait Storefront: Send + Sync {
    async fn login(&self) -> Result<Credentials>;
    async fn purchase(&self, session: &Session, item: &ItemRef) -> Result<RemoteResponse>;
}

pub trait ResponseClassifier: Send + Sync {
    fn classify(&self, response: &RemoteResponse) -> Outcome;
}
