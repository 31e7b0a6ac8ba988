// Transport configuration and connection-pool ownership.
//
// Every call either borrows the caller's shared `HttpSession` (never closed
// here) or opens a one-shot `reqwest::Client` that lives exactly as long as
// the call. `PoolLease` makes that ownership explicit and releases the
// one-shot pool on drop, whichever way the call ends.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::trace;
use url::Url;

use crate::error::Error;

pub const DEFAULT_BASE_URL: &str = "https://api.simplisafe.com/v1/";

/// Total-time budget for pools opened by the client itself.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_6) \
    AppleWebKit/605.1.15 (KHTML, like Gecko) Version/13.1.2 Safari/605.1.15";

pub(crate) const CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Endpoint and header settings shared by every request.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL all endpoint paths are joined onto. Always ends with `/`.
    pub base_url: Url,
    /// Timeout applied to ad-hoc pools. A shared session keeps its own policy.
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.parse().expect("valid default URL"),
            timeout: DEFAULT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }
}

impl ClientConfig {
    /// Point the client at a different API root (e.g. a mock server).
    #[must_use]
    pub fn with_base_url(mut self, url: Url) -> Self {
        self.base_url = with_trailing_slash(url);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// `{base_url}{endpoint}`, e.g. `https://api.simplisafe.com/v1/api/token`.
    pub(crate) fn endpoint_url(&self, endpoint: &str) -> Result<Url, Error> {
        Ok(self.base_url.join(endpoint.trim_start_matches('/'))?)
    }

    /// Value for the explicit `Host` header.
    pub(crate) fn host_header(&self) -> String {
        let host = self.base_url.host_str().unwrap_or_default();
        match self.base_url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        }
    }

    /// Build a one-shot HTTP client honoring the configured timeout.
    pub(crate) fn build_client(&self) -> Result<reqwest::Client, Error> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(&self.user_agent)
            .build()
            .map_err(Error::Transport)
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

// ── Shared session ──────────────────────────────────────────────────

/// A caller-owned connection pool shared across API objects.
///
/// Clones share the same close signal. Once closed, the API client falls
/// back to ad-hoc pools rather than failing.
#[derive(Debug, Clone)]
pub struct HttpSession {
    client: reqwest::Client,
    closed: CancellationToken,
}

impl HttpSession {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            closed: CancellationToken::new(),
        }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

// ── Per-call lease ──────────────────────────────────────────────────

/// The pool a single call runs on: borrowed from the caller, or owned.
pub(crate) enum PoolLease<'a> {
    Borrowed(&'a reqwest::Client),
    Owned {
        client: reqwest::Client,
        open: &'a AtomicUsize,
    },
}

impl<'a> PoolLease<'a> {
    /// Borrow `shared` if it is still open, otherwise open a one-shot pool.
    ///
    /// `open` counts owned pools that have not been released yet.
    pub(crate) fn acquire(
        shared: Option<&'a HttpSession>,
        config: &ClientConfig,
        open: &'a AtomicUsize,
    ) -> Result<Self, Error> {
        if let Some(session) = shared.filter(|s| !s.is_closed()) {
            return Ok(Self::Borrowed(session.client()));
        }
        let client = config.build_client()?;
        open.fetch_add(1, Ordering::SeqCst);
        trace!("opened ad-hoc HTTP pool");
        Ok(Self::Owned { client, open })
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        match self {
            Self::Borrowed(client) => client,
            Self::Owned { client, .. } => client,
        }
    }
}

impl Drop for PoolLease<'_> {
    fn drop(&mut self) {
        if let Self::Owned { open, .. } = self {
            open.fetch_sub(1, Ordering::SeqCst);
            trace!("released ad-hoc HTTP pool");
        }
    }
}
