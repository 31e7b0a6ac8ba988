use thiserror::Error;

/// Top-level error type for the `simplisafe-api` crate.
///
/// Every failure the request dispatcher and the credential manager can
/// produce is classified into one of these variants. Nothing is swallowed
/// except the two tolerated non-errors: an undecodable body (surfaced as
/// `{"error": <text>}`) and the `mfa_required` marker (returned as data).
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// An MFA approval link was sent; retry later with the same client id.
    #[error(
        "Check your email for an MFA link, then use {client_id} as the client_id parameter in future API calls"
    )]
    PendingAuthorization { client_id: String },

    /// Bad password, unusable refresh token, or repeated 401s after a refresh.
    #[error("Invalid credentials: {message}")]
    InvalidCredentials { message: String },

    /// An account-level call was made before any successful login.
    #[error("Not authenticated: no user id is known yet")]
    NotAuthenticated,

    // ── Request ─────────────────────────────────────────────────────
    /// The endpoint exists but the account's plan does not include it.
    #[error("Endpoint unavailable in plan: {endpoint}")]
    EndpointUnavailable { endpoint: String },

    /// Any other non-2xx response or transport failure.
    #[error("There was an error while requesting /{endpoint}: {message}")]
    Request { endpoint: String, message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// Building an HTTP client failed.
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // ── Data ────────────────────────────────────────────────────────
    /// A response was missing fields the protocol guarantees.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    // ── Collaborators ───────────────────────────────────────────────
    /// The realtime event channel rejected its credentials.
    #[error("Event channel error: {0}")]
    EventChannel(String),
}

impl Error {
    /// Returns `true` if the caller must supply new credentials.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::InvalidCredentials { .. })
    }

    /// Returns `true` if login is waiting on an out-of-band MFA approval.
    pub fn is_pending_authorization(&self) -> bool {
        matches!(self, Self::PendingAuthorization { .. })
    }

    /// Returns `true` if the feature is not part of the account's plan.
    pub fn is_endpoint_unavailable(&self) -> bool {
        matches!(self, Self::EndpointUnavailable { .. })
    }

    pub(crate) fn request(endpoint: &str, message: impl Into<String>) -> Self {
        Self::Request {
            endpoint: endpoint.to_owned(),
            message: message.into(),
        }
    }

    pub(crate) fn invalid_credentials(message: impl Into<String>) -> Self {
        Self::InvalidCredentials {
            message: message.into(),
        }
    }
}
