//! Client identity, token bookkeeping, and grant payloads.
//!
//! The identity is fixed when the API object is built; the credential
//! state is replaced wholesale on every (re)authentication.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, TimeDelta, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::Error;

pub(crate) const TOKEN_ENDPOINT: &str = "api/token";
pub(crate) const MFA_CHALLENGE_ENDPOINT: &str = "api/mfa/challenge";
pub(crate) const AUTH_CHECK_ENDPOINT: &str = "api/authCheck";

/// Grant type for the second token exchange of the out-of-band MFA flow.
pub const MFA_OOB_GRANT_TYPE: &str = "http://simplisafe.com/oauth/grant-type/mfa-oob";

/// Application version reported with password logins.
pub const APP_VERSION: &str = "1.62.0";

/// Seconds shaved off the server-declared token lifetime so the token is
/// refreshed before the server starts rejecting it.
pub const EXPIRY_MARGIN_SECS: i64 = 60;

const SCOPE: &str = "offline_access";

/// Derive the 10-character device id (`xxxxx-yyyyy`) from a client id.
///
/// Deterministic: the first ten characters of the base64 encoding of the
/// client id, split into two groups of five.
pub fn generate_device_id(client_id: &str) -> String {
    let encoded = STANDARD.encode(client_id.as_bytes());
    let seed: String = encoded.chars().take(10).collect();
    let (head, tail) = seed.split_at(seed.len().min(5));
    format!("{head}-{tail}")
}

// ── Identity ────────────────────────────────────────────────────────

/// Who this API object claims to be when talking to the token endpoint.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    client_id: String,
    client_id_string: String,
    device_id: String,
}

impl ClientIdentity {
    /// Use `client_id` if given and non-empty, otherwise generate a UUID.
    pub fn new(client_id: Option<&str>) -> Self {
        let client_id = client_id
            .filter(|id| !id.is_empty())
            .map_or_else(|| Uuid::new_v4().to_string(), str::to_owned);
        let client_id_string = format!("{client_id}.WebApp.simplisafe.com");
        let device_id = generate_device_id(&client_id);
        Self {
            client_id,
            client_id_string,
            device_id,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// `{client_id}.WebApp.simplisafe.com`
    pub fn client_id_string(&self) -> &str {
        &self.client_id_string
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn device_descriptor(&self) -> String {
        format!(
            r#"WebApp; useragent="Safari 13.1 (SS-ID: {0}) / macOS 10.15.6"; uuid="{1}"; id="{0}""#,
            self.device_id, self.client_id
        )
    }

    pub(crate) fn password_payload(&self, email: &str, password: &SecretString) -> Value {
        json!({
            "grant_type": "password",
            "username": email,
            "password": password.expose_secret(),
            "client_id": self.client_id_string,
            "device_id": self.device_descriptor(),
            "app_version": APP_VERSION,
            "scope": SCOPE,
        })
    }

    /// The refresh grant carries the raw client id, not the formatted string.
    pub(crate) fn refresh_payload(&self, refresh_token: &SecretString) -> Value {
        json!({
            "grant_type": "refresh_token",
            "client_id": self.client_id,
            "refresh_token": refresh_token.expose_secret(),
        })
    }

    pub(crate) fn mfa_challenge_payload(&self, mfa_token: &str) -> Value {
        json!({
            "challenge_type": "oob",
            "client_id": self.client_id_string,
            "mfa_token": mfa_token,
        })
    }

    pub(crate) fn mfa_oob_payload(&self, mfa_token: &str, oob_code: &str) -> Value {
        json!({
            "client_id": self.client_id_string,
            "grant_type": MFA_OOB_GRANT_TYPE,
            "mfa_token": mfa_token,
            "oob_code": oob_code,
            "scope": SCOPE,
        })
    }
}

// ── Credential state ────────────────────────────────────────────────

/// Access token, its expiry, and the refresh token.
///
/// `access_token` and `expires_at` are always set together.
#[derive(Debug, Default)]
pub(crate) struct CredentialState {
    pub(crate) access_token: Option<SecretString>,
    pub(crate) expires_at: Option<DateTime<Utc>>,
    pub(crate) refresh_token: Option<SecretString>,
}

impl CredentialState {
    /// Replace all three credentials and return the new access token.
    ///
    /// A lifetime that cannot be represented as an instant is rejected and
    /// leaves the state untouched.
    pub(crate) fn store(
        &mut self,
        tokens: TokenResponse,
        issued_at: DateTime<Utc>,
    ) -> Result<SecretString, Error> {
        let lifetime = tokens.expires_in.saturating_sub(EXPIRY_MARGIN_SECS);
        let expires_at = TimeDelta::try_seconds(lifetime)
            .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
            .ok_or_else(|| Error::Deserialization {
                message: format!(
                    "unexpected response from /{TOKEN_ENDPOINT}: expires_in out of range"
                ),
                body: tokens.expires_in.to_string(),
            })?;

        let access_token = SecretString::from(tokens.access_token);
        self.access_token = Some(access_token.clone());
        self.expires_at = Some(expires_at);
        self.refresh_token = Some(tokens.refresh_token.into());
        Ok(access_token)
    }

    pub(crate) fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    /// Force the next pre-flight check to refresh.
    pub(crate) fn expire(&mut self, now: DateTime<Utc>) {
        self.expires_at = Some(now);
    }
}

// ── Response shapes ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    access_token: String,
    #[serde(deserialize_with = "seconds")]
    expires_in: i64,
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AuthCheckResponse {
    #[serde(rename = "userId")]
    pub(crate) user_id: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MfaChallengeResponse {
    pub(crate) oob_code: String,
}

/// `expires_in` arrives as a number, occasionally as a numeric string.
fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(secs) => Ok(secs),
        Raw::Text(text) => text.trim().parse().map_err(de::Error::custom),
    }
}

/// Deserialize a decoded body, treating missing fields as a protocol error.
pub(crate) fn parse_response<T: DeserializeOwned>(endpoint: &str, body: &Value) -> Result<T, Error> {
    T::deserialize(body).map_err(|e| Error::Deserialization {
        message: format!("unexpected response from /{endpoint}: {e}"),
        body: body.to_string(),
    })
}
