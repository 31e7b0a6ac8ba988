// SimpliSafe API client
//
// Owns the session (identity + credential state) and funnels every HTTP
// call through one dispatcher that injects headers, picks the connection
// pool, decodes the body, and classifies failures. Authentication and token
// refresh live here as well because both re-enter the dispatcher.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HOST, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use crate::auth::{
    AUTH_CHECK_ENDPOINT, AuthCheckResponse, ClientIdentity, CredentialState, MFA_CHALLENGE_ENDPOINT,
    MfaChallengeResponse, TOKEN_ENDPOINT, TokenResponse, parse_response,
};
use crate::error::Error;
use crate::system::SystemRegistry;
use crate::transport::{self, ClientConfig, HttpSession, PoolLease};
use crate::websocket::{EventChannel, Websocket};

// ── Options ─────────────────────────────────────────────────────────

/// Everything needed to build an API object besides the credentials.
pub struct LoginOptions {
    pub client_id: Option<String>,
    pub session: Option<HttpSession>,
    pub config: ClientConfig,
    pub event_channel: Arc<dyn EventChannel>,
    pub systems: SystemRegistry,
}

impl Default for LoginOptions {
    fn default() -> Self {
        Self {
            client_id: None,
            session: None,
            config: ClientConfig::default(),
            event_channel: Arc::new(Websocket::new()),
            systems: SystemRegistry::default(),
        }
    }
}

impl LoginOptions {
    /// Reuse a client id, e.g. the one named by a pending MFA approval.
    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Run every call on a caller-owned pool instead of ad-hoc ones.
    #[must_use]
    pub fn with_session(mut self, session: HttpSession) -> Self {
        self.session = Some(session);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_event_channel(mut self, channel: Arc<dyn EventChannel>) -> Self {
        self.event_channel = channel;
        self
    }

    #[must_use]
    pub fn with_systems(mut self, systems: SystemRegistry) -> Self {
        self.systems = systems;
        self
    }
}

/// Query string and JSON body for a single request.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    query: Vec<(String, String)>,
    json: Option<Value>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn json(mut self, body: Value) -> Self {
        self.json = Some(body);
        self
    }
}

// ── Failure classification ──────────────────────────────────────────

/// Whether a call is part of a token refresh.
///
/// Calls made while refreshing skip the pre-flight check, and a 401 among
/// them means the refresh itself was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallContext {
    Standard,
    Refresh,
}

#[derive(Debug, PartialEq, Eq)]
enum Failure {
    /// Not a failure: the MFA flow reads this body as data.
    MfaRequired,
    NoRemoteManagement,
    Unauthorized,
    Forbidden,
    Other,
}

/// Classify a non-2xx response, in priority order.
fn classify(status: StatusCode, body: &Value) -> Failure {
    if body.get("error").and_then(Value::as_str) == Some("mfa_required") {
        return Failure::MfaRequired;
    }
    if body.get("type").and_then(Value::as_str) == Some("NoRemoteManagement") {
        return Failure::NoRemoteManagement;
    }
    match status {
        StatusCode::UNAUTHORIZED => Failure::Unauthorized,
        StatusCode::FORBIDDEN => Failure::Forbidden,
        _ => Failure::Other,
    }
}

/// Decode a body as JSON, degrading to `{"error": <text>}`.
fn decode_body(text: String) -> Value {
    serde_json::from_str(&text).unwrap_or_else(|_| json!({ "error": text }))
}

fn describe_failure(status: StatusCode, body: &Value) -> String {
    let detail = body
        .get("error")
        .and_then(Value::as_str)
        .map_or_else(|| body.to_string(), str::to_owned);
    format!("HTTP {status}: {}", detail.chars().take(200).collect::<String>())
}

// ── Client ──────────────────────────────────────────────────────────

/// An authenticated connection to one SimpliSafe account.
///
/// Build one with [`login_via_credentials`](Self::login_via_credentials) or
/// [`login_via_token`](Self::login_via_token). Cloning is cheap and clones
/// share the same credentials.
#[derive(Clone)]
pub struct SimpliSafe {
    inner: Arc<Inner>,
}

struct Inner {
    identity: ClientIdentity,
    config: ClientConfig,
    session: Option<HttpSession>,
    email: Option<String>,
    credentials: RwLock<CredentialState>,
    user_id: RwLock<Option<u64>>,
    /// Set while a refresh grant is in flight.
    refreshing: AtomicBool,
    /// Serializes refreshes across concurrent callers.
    refresh_lock: Mutex<()>,
    /// Ad-hoc pools opened and not yet released.
    open_pools: AtomicUsize,
    event_channel: Arc<dyn EventChannel>,
    systems: SystemRegistry,
}

impl SimpliSafe {
    /// Build an unauthenticated API object.
    ///
    /// Most callers want one of the login entry points instead; this exists
    /// for driving [`authenticate`](Self::authenticate) with a custom payload.
    pub fn new(options: LoginOptions) -> Self {
        Self::build(options, None)
    }

    fn build(options: LoginOptions, email: Option<String>) -> Self {
        let identity = ClientIdentity::new(options.client_id.as_deref());
        Self {
            inner: Arc::new(Inner {
                identity,
                config: options.config,
                session: options.session,
                email,
                credentials: RwLock::new(CredentialState::default()),
                user_id: RwLock::new(None),
                refreshing: AtomicBool::new(false),
                refresh_lock: Mutex::new(()),
                open_pools: AtomicUsize::new(0),
                event_channel: options.event_channel,
                systems: options.systems,
            }),
        }
    }

    /// Log in with an email address and password.
    ///
    /// Accounts with MFA enabled fail with [`Error::PendingAuthorization`]
    /// until the emailed link is approved; retry with the same client id.
    pub async fn login_via_credentials(
        email: &str,
        password: &SecretString,
        options: LoginOptions,
    ) -> Result<Self, Error> {
        let api = Self::build(options, Some(email.to_owned()));
        let payload = api.inner.identity.password_payload(email, password);
        api.authenticate(&payload).await?;
        Ok(api)
    }

    /// Log in with a refresh token saved from an earlier session.
    pub async fn login_via_token(
        refresh_token: &SecretString,
        options: LoginOptions,
    ) -> Result<Self, Error> {
        let api = Self::new(options);
        api.refresh_access_token(refresh_token).await?;
        Ok(api)
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn identity(&self) -> &ClientIdentity {
        &self.inner.identity
    }

    pub fn client_id(&self) -> &str {
        self.inner.identity.client_id()
    }

    pub fn client_id_string(&self) -> &str {
        self.inner.identity.client_id_string()
    }

    pub fn device_id(&self) -> &str {
        self.inner.identity.device_id()
    }

    pub fn email(&self) -> Option<&str> {
        self.inner.email.as_deref()
    }

    pub fn user_id(&self) -> Option<u64> {
        *self.inner.user_id.read().expect("user id lock poisoned")
    }

    pub fn access_token(&self) -> Option<SecretString> {
        self.read_credentials().access_token.clone()
    }

    /// The current refresh token. Persisting it is up to the caller.
    pub fn refresh_token(&self) -> Option<SecretString> {
        self.read_credentials().refresh_token.clone()
    }

    pub fn access_token_expires_at(&self) -> Option<DateTime<Utc>> {
        self.read_credentials().expires_at
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.refreshing.load(Ordering::SeqCst)
    }

    /// Number of ad-hoc pools currently open (zero between calls).
    pub fn open_pools(&self) -> usize {
        self.inner.open_pools.load(Ordering::SeqCst)
    }

    pub fn event_channel(&self) -> &Arc<dyn EventChannel> {
        &self.inner.event_channel
    }

    pub(crate) fn systems(&self) -> &SystemRegistry {
        &self.inner.systems
    }

    fn read_credentials(&self) -> RwLockReadGuard<'_, CredentialState> {
        self.inner.credentials.read().expect("credential lock poisoned")
    }

    fn write_credentials(&self) -> RwLockWriteGuard<'_, CredentialState> {
        self.inner.credentials.write().expect("credential lock poisoned")
    }

    fn needs_refresh(&self) -> bool {
        self.read_credentials().needs_refresh(Utc::now())
    }

    // ── Authentication ───────────────────────────────────────────────

    /// Exchange `payload` at the token endpoint and adopt the result.
    ///
    /// On success the tokens, expiry and user id are stored and the event
    /// channel is initialized with the new access token.
    pub async fn authenticate(&self, payload: &Value) -> Result<(), Error> {
        self.authenticate_in(payload, CallContext::Standard).await
    }

    /// Mint a new access token from `refresh_token`.
    pub async fn refresh_access_token(&self, refresh_token: &SecretString) -> Result<(), Error> {
        let _guard = self.inner.refresh_lock.lock().await;
        self.refresh_locked(refresh_token).await
    }

    /// Refresh while the caller holds `refresh_lock`.
    fn refresh_locked<'a>(
        &'a self,
        refresh_token: &'a SecretString,
    ) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            self.inner.refreshing.store(true, Ordering::SeqCst);
            let payload = self.inner.identity.refresh_payload(refresh_token);
            let result = self.authenticate_in(&payload, CallContext::Refresh).await;
            self.inner.refreshing.store(false, Ordering::SeqCst);
            result
        }
        .boxed()
    }

    async fn authenticate_in(&self, payload: &Value, context: CallContext) -> Result<(), Error> {
        let grant_type = payload
            .get("grant_type")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        debug!(grant_type, "authenticating");

        let options = RequestOptions::new().json(payload.clone());
        let token_resp = self
            .dispatch(Method::POST, TOKEN_ENDPOINT, &options, context)
            .await?;

        if let Some(mfa_token) = token_resp.get("mfa_token").and_then(Value::as_str) {
            self.request_mfa_approval(mfa_token, context).await?;
            return Err(Error::PendingAuthorization {
                client_id: self.client_id().to_owned(),
            });
        }

        let tokens: TokenResponse = parse_response(TOKEN_ENDPOINT, &token_resp)?;
        let access_token = self.write_credentials().store(tokens, Utc::now())?;

        let auth_check = self
            .dispatch(Method::GET, AUTH_CHECK_ENDPOINT, &RequestOptions::new(), context)
            .await?;
        let AuthCheckResponse { user_id } = parse_response(AUTH_CHECK_ENDPOINT, &auth_check)?;
        *self.inner.user_id.write().expect("user id lock poisoned") = Some(user_id);
        debug!(user_id, "authenticated");

        self.inner
            .event_channel
            .initialize(&access_token, user_id)
            .await
    }

    /// Trigger the out-of-band approval email.
    ///
    /// The second token exchange never yields tokens before the link is
    /// approved, so its outcome is only logged.
    async fn request_mfa_approval(&self, mfa_token: &str, context: CallContext) -> Result<(), Error> {
        let identity = &self.inner.identity;
        info!("MFA required; requesting out-of-band challenge");

        let options = RequestOptions::new().json(identity.mfa_challenge_payload(mfa_token));
        let challenge = self
            .dispatch(Method::POST, MFA_CHALLENGE_ENDPOINT, &options, context)
            .await?;
        let MfaChallengeResponse { oob_code } =
            parse_response(MFA_CHALLENGE_ENDPOINT, &challenge)?;

        let options = RequestOptions::new().json(identity.mfa_oob_payload(mfa_token, &oob_code));
        if let Err(err) = self
            .dispatch(Method::POST, TOKEN_ENDPOINT, &options, context)
            .await
        {
            debug!(error = %err, "out-of-band token exchange failed");
        }
        Ok(())
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    /// Make an API request and return the decoded JSON body.
    ///
    /// An expired access token is refreshed first. A 401 is retried once
    /// after forcing a refresh; any other failure is returned as-is.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<Value, Error> {
        self.dispatch(method, endpoint, &options, CallContext::Standard)
            .await
    }

    async fn dispatch(
        &self,
        method: Method,
        endpoint: &str,
        options: &RequestOptions,
        context: CallContext,
    ) -> Result<Value, Error> {
        let mut retried = false;
        loop {
            self.ensure_fresh_token(context).await?;

            let (status, body) = self.send(&method, endpoint, options).await?;
            if status.is_success() {
                return Ok(body);
            }

            match classify(status, &body) {
                Failure::MfaRequired => return Ok(body),
                Failure::NoRemoteManagement => {
                    return Err(Error::EndpointUnavailable {
                        endpoint: endpoint.to_owned(),
                    });
                }
                Failure::Unauthorized => {
                    if context == CallContext::Refresh || retried {
                        return Err(Error::invalid_credentials(
                            "Repeated 401s despite refreshing access token",
                        ));
                    }
                    if self.read_credentials().refresh_token.is_none() {
                        return Err(Error::invalid_credentials("Invalid username/password"));
                    }
                    info!(endpoint, "401 detected; attempting refresh token");
                    self.write_credentials().expire(Utc::now());
                    retried = true;
                }
                Failure::Forbidden => {
                    return Err(Error::invalid_credentials("Invalid username/password"));
                }
                Failure::Other => {
                    return Err(Error::request(endpoint, describe_failure(status, &body)));
                }
            }
        }
    }

    /// Refresh before sending if the access token has expired.
    async fn ensure_fresh_token(&self, context: CallContext) -> Result<(), Error> {
        if context == CallContext::Refresh || !self.needs_refresh() {
            return Ok(());
        }

        let _guard = self.inner.refresh_lock.lock().await;
        if !self.needs_refresh() {
            trace!("access token already refreshed by a concurrent call");
            return Ok(());
        }

        debug!(
            expires_at = ?self.access_token_expires_at(),
            "need to refresh access token"
        );
        let refresh_token = self.refresh_token().ok_or_else(|| {
            Error::invalid_credentials("access token expired and no refresh token is available")
        })?;
        self.refresh_locked(&refresh_token).await
    }

    /// Issue one HTTP call and decode its body, without classifying it.
    async fn send(
        &self,
        method: &Method,
        endpoint: &str,
        options: &RequestOptions,
    ) -> Result<(StatusCode, Value), Error> {
        let url = self.inner.config.endpoint_url(endpoint)?;
        let headers = self.headers(endpoint)?;
        let pool = PoolLease::acquire(
            self.inner.session.as_ref(),
            &self.inner.config,
            &self.inner.open_pools,
        )?;

        let mut builder = pool.client().request(method.clone(), url).headers(headers);
        if !options.query.is_empty() {
            builder = builder.query(&options.query);
        }
        if let Some(ref body) = options.json {
            builder = builder.json(body);
        }

        debug!("{method} /{endpoint}");
        let resp = builder
            .send()
            .await
            .map_err(|e| Error::request(endpoint, e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Error::request(endpoint, e.to_string()))?;

        let body = decode_body(text);
        trace!(endpoint, %status, %body, "data received");
        Ok((status, body))
    }

    fn headers(&self, endpoint: &str) -> Result<HeaderMap, Error> {
        let invalid = |e: reqwest::header::InvalidHeaderValue| Error::request(endpoint, e.to_string());
        let mut headers = HeaderMap::new();

        if let Some(token) = self.access_token() {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .map_err(invalid)?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(transport::CONTENT_TYPE));
        headers.insert(
            HOST,
            HeaderValue::from_str(&self.inner.config.host_header()).map_err(invalid)?,
        );
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.inner.config.user_agent).map_err(invalid)?,
        );
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mfa_marker_wins_over_status() {
        let body = json!({ "error": "mfa_required", "mfa_token": "m" });
        assert_eq!(classify(StatusCode::FORBIDDEN, &body), Failure::MfaRequired);
        assert_eq!(classify(StatusCode::UNAUTHORIZED, &body), Failure::MfaRequired);
    }

    #[test]
    fn no_remote_management_is_unavailable() {
        let body = json!({ "type": "NoRemoteManagement" });
        assert_eq!(
            classify(StatusCode::FORBIDDEN, &body),
            Failure::NoRemoteManagement
        );
    }

    #[test]
    fn status_codes_classify() {
        let body = json!({});
        assert_eq!(classify(StatusCode::UNAUTHORIZED, &body), Failure::Unauthorized);
        assert_eq!(classify(StatusCode::FORBIDDEN, &body), Failure::Forbidden);
        assert_eq!(
            classify(StatusCode::INTERNAL_SERVER_ERROR, &body),
            Failure::Other
        );
    }

    #[test]
    fn undecodable_body_becomes_error_text() {
        assert_eq!(
            decode_body("<html>Bad Gateway</html>".into()),
            json!({ "error": "<html>Bad Gateway</html>" })
        );
        assert_eq!(decode_body(r#"{"userId": 7}"#.into()), json!({ "userId": 7 }));
    }

    #[test]
    fn new_client_is_unauthenticated() {
        let api = SimpliSafe::new(LoginOptions::default().with_client_id("abc123456"));
        assert_eq!(api.client_id(), "abc123456");
        assert_eq!(api.client_id_string(), "abc123456.WebApp.simplisafe.com");
        assert!(api.access_token().is_none());
        assert!(api.access_token_expires_at().is_none());
        assert!(!api.needs_refresh());
        assert!(!api.is_refreshing());
        assert_eq!(api.open_pools(), 0);
    }

    #[test]
    fn headers_omit_authorization_without_token() {
        let api = SimpliSafe::new(LoginOptions::default());
        let headers = api.headers("api/token").unwrap();
        assert!(headers.get(AUTHORIZATION).is_none());
        assert_eq!(headers[HOST], "api.simplisafe.com");
        assert_eq!(headers[CONTENT_TYPE], "application/json; charset=utf-8");
        assert_eq!(headers[USER_AGENT], transport::DEFAULT_USER_AGENT);
    }
}
