//! Shared configuration for SimpliSafe tools.
//!
//! TOML profiles, credential resolution (env + keyring + plaintext), and
//! translation to `simplisafe_api::LoginOptions`. Refresh tokens are only
//! ever read here; storing a rotated one is the caller's decision.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use simplisafe_api::{ClientConfig, LoginOptions, SimpliSafe};

const KEYRING_SERVICE: &str = "simplisafe";
const ENV_EMAIL: &str = "SIMPLISAFE_EMAIL";
const ENV_PASSWORD: &str = "SIMPLISAFE_PASSWORD";
const ENV_REFRESH_TOKEN: &str = "SIMPLISAFE_REFRESH_TOKEN";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no profile named '{0}'")]
    UnknownProfile(String),

    #[error("invalid base_url: {0}")]
    InvalidBaseUrl(String),

    /// Neither a refresh token nor an email/password pair resolved.
    #[error("no credentials configured for profile '{profile}'")]
    NoCredentials { profile: String },

    #[error("could not read config: {0}")]
    Load(Box<figment::Error>),

    #[error("could not write config: {0}")]
    Write(#[from] toml::ser::Error),

    #[error("config file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Login itself failed; see [`simplisafe_api::Error`].
    #[error(transparent)]
    Api(#[from] simplisafe_api::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named. Falls back to `default`.
    pub default_profile: Option<String>,

    /// Global defaults.
    #[serde(default)]
    pub defaults: Defaults,

    /// Named account profiles.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    /// Seconds allowed for calls made on ad-hoc connection pools.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
        }
    }
}

fn default_timeout() -> u64 {
    10
}

/// A named SimpliSafe account.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct Profile {
    /// Account email for password logins.
    pub email: Option<String>,

    /// Plaintext password. Prefer the keyring or an env var. Read but
    /// never written back by `save_config`.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Environment variable name containing the password.
    pub password_env: Option<String>,

    /// Client id to reuse across logins. Must stay stable while an MFA
    /// approval is pending.
    pub client_id: Option<String>,

    /// Override the API root (testing, proxies).
    pub base_url: Option<String>,

    /// Override timeout.
    pub timeout: Option<u64>,
}

impl Config {
    /// Look up `name`, falling back to the default profile.
    pub fn profile(&self, name: Option<&str>) -> Result<(String, &Profile), ConfigError> {
        let name = name
            .or(self.default_profile.as_deref())
            .unwrap_or("default")
            .to_owned();
        let profile = self
            .profiles
            .get(&name)
            .ok_or_else(|| ConfigError::UnknownProfile(name.clone()))?;
        Ok((name, profile))
    }

    /// Record the client id a login used, creating the profile if needed.
    pub fn remember_client_id(&mut self, profile: &str, client_id: &str) {
        self.profiles
            .entry(profile.to_owned())
            .or_default()
            .client_id = Some(client_id.to_owned());
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "simplisafe", "simplisafe").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("simplisafe");
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the default file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load Config from `path` + `SIMPLISAFE_`-prefixed environment variables.
///
/// Nested keys use a double underscore:
/// `SIMPLISAFE_PROFILES__HOME__EMAIL=me@example.com`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("SIMPLISAFE_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if the file doesn't exist.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Credential resolution ───────────────────────────────────────────

/// What a profile will log in with.
#[derive(Debug, Clone)]
pub enum LoginCredentials {
    Password { email: String, password: SecretString },
    RefreshToken(SecretString),
}

fn keyring_secret(profile_name: &str, kind: &str) -> Option<SecretString> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, &format!("{profile_name}/{kind}")).ok()?;
    entry.get_password().ok().map(SecretString::from)
}

/// Resolve a password: named env var → `SIMPLISAFE_PASSWORD` → keyring → plaintext.
pub fn resolve_password(profile: &Profile, profile_name: &str) -> Result<SecretString, ConfigError> {
    if let Some(ref env_name) = profile.password_env {
        if let Ok(val) = std::env::var(env_name) {
            debug!(profile = profile_name, "password from {env_name}");
            return Ok(SecretString::from(val));
        }
    }

    if let Ok(val) = std::env::var(ENV_PASSWORD) {
        debug!(profile = profile_name, "password from {ENV_PASSWORD}");
        return Ok(SecretString::from(val));
    }

    if let Some(secret) = keyring_secret(profile_name, "password") {
        debug!(profile = profile_name, "password from keyring");
        return Ok(secret);
    }

    if let Some(ref pw) = profile.password {
        return Ok(SecretString::from(pw.clone()));
    }

    Err(ConfigError::NoCredentials {
        profile: profile_name.into(),
    })
}

/// Resolve a saved refresh token: `SIMPLISAFE_REFRESH_TOKEN` → keyring.
pub fn resolve_refresh_token(profile_name: &str) -> Option<SecretString> {
    if let Ok(val) = std::env::var(ENV_REFRESH_TOKEN) {
        debug!(profile = profile_name, "refresh token from {ENV_REFRESH_TOKEN}");
        return Some(SecretString::from(val));
    }
    keyring_secret(profile_name, "refresh-token")
}

/// Prefer a saved refresh token; otherwise email + password.
pub fn resolve_credentials(
    profile: &Profile,
    profile_name: &str,
) -> Result<LoginCredentials, ConfigError> {
    if let Some(token) = resolve_refresh_token(profile_name) {
        return Ok(LoginCredentials::RefreshToken(token));
    }

    let email = profile
        .email
        .clone()
        .or_else(|| std::env::var(ENV_EMAIL).ok())
        .ok_or_else(|| ConfigError::NoCredentials {
            profile: profile_name.into(),
        })?;
    let password = resolve_password(profile, profile_name)?;
    Ok(LoginCredentials::Password { email, password })
}

// ── Translation ─────────────────────────────────────────────────────

/// Build a `ClientConfig` from a profile, applying global defaults.
pub fn profile_to_client_config(
    profile: &Profile,
    defaults: &Defaults,
) -> Result<ClientConfig, ConfigError> {
    let timeout = Duration::from_secs(profile.timeout.unwrap_or(defaults.timeout));
    let mut config = ClientConfig::default().with_timeout(timeout);

    if let Some(ref raw) = profile.base_url {
        let url: url::Url = raw
            .parse()
            .map_err(|_| ConfigError::InvalidBaseUrl(raw.clone()))?;
        config = config.with_base_url(url);
    }

    Ok(config)
}

/// Build `LoginOptions` (client id + transport) from a profile.
pub fn profile_to_login_options(
    profile: &Profile,
    defaults: &Defaults,
) -> Result<LoginOptions, ConfigError> {
    let mut options =
        LoginOptions::default().with_config(profile_to_client_config(profile, defaults)?);
    if let Some(ref client_id) = profile.client_id {
        options = options.with_client_id(client_id.clone());
    }
    Ok(options)
}

/// Log in with whatever credentials the profile resolves to.
pub async fn login(config: &Config, profile_name: Option<&str>) -> Result<SimpliSafe, ConfigError> {
    let (name, profile) = config.profile(profile_name)?;
    let options = profile_to_login_options(profile, &config.defaults)?;

    let api = match resolve_credentials(profile, &name)? {
        LoginCredentials::RefreshToken(token) => {
            debug!(profile = %name, "logging in with refresh token");
            SimpliSafe::login_via_token(&token, options).await?
        }
        LoginCredentials::Password { email, password } => {
            debug!(profile = %name, "logging in with password");
            SimpliSafe::login_via_credentials(&email, &password, options).await?
        }
    };
    Ok(api)
}

#[cfg(test)]
mod tests {
    use figment::Jail;
    use pretty_assertions::assert_eq;
    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn loads_profiles_from_toml() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                    default_profile = "home"

                    [defaults]
                    timeout = 20

                    [profiles.home]
                    email = "me@example.com"
                    client_id = "abc-123"
                "#,
            )?;

            let config = load_config_from(Path::new("config.toml")).unwrap();
            let (name, profile) = config.profile(None).unwrap();
            assert_eq!(name, "home");
            assert_eq!(profile.email.as_deref(), Some("me@example.com"));
            assert_eq!(profile.client_id.as_deref(), Some("abc-123"));
            assert_eq!(config.defaults.timeout, 20);
            Ok(())
        });
    }

    #[test]
    fn env_overrides_nested_keys() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", "[profiles.home]\nemail = \"file@example.com\"\n")?;
            jail.set_env("SIMPLISAFE_PROFILES__HOME__EMAIL", "env@example.com");

            let config = load_config_from(Path::new("config.toml")).unwrap();
            let (_, profile) = config.profile(Some("home")).unwrap();
            assert_eq!(profile.email.as_deref(), Some("env@example.com"));
            Ok(())
        });
    }

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|_| {
            let config = load_config_from(Path::new("absent.toml")).unwrap();
            assert_eq!(config.default_profile, None);
            assert_eq!(config.defaults.timeout, 10);
            assert!(matches!(
                config.profile(None),
                Err(ConfigError::UnknownProfile(ref name)) if name == "default"
            ));
            Ok(())
        });
    }

    #[test]
    fn password_env_takes_precedence() {
        Jail::expect_with(|jail| {
            jail.set_env("MY_SS_PASSWORD", "from-named-env");
            jail.set_env(ENV_PASSWORD, "from-default-env");
            let profile = Profile {
                password_env: Some("MY_SS_PASSWORD".into()),
                password: Some("plaintext".into()),
                ..Profile::default()
            };

            let password = resolve_password(&profile, "home").unwrap();
            assert_eq!(password.expose_secret(), "from-named-env");
            Ok(())
        });
    }

    #[test]
    fn refresh_token_is_preferred() {
        Jail::expect_with(|jail| {
            jail.set_env(ENV_REFRESH_TOKEN, "saved-refresh");
            let profile = Profile {
                email: Some("me@example.com".into()),
                ..Profile::default()
            };

            match resolve_credentials(&profile, "home").unwrap() {
                LoginCredentials::RefreshToken(token) => {
                    assert_eq!(token.expose_secret(), "saved-refresh");
                }
                other => panic!("expected refresh token, got {other:?}"),
            }
            Ok(())
        });
    }

    #[test]
    fn password_credentials_from_env() {
        Jail::expect_with(|jail| {
            jail.set_env(ENV_EMAIL, "env@example.com");
            jail.set_env(ENV_PASSWORD, "hunter2");

            match resolve_credentials(&Profile::default(), "home").unwrap() {
                LoginCredentials::Password { email, password } => {
                    assert_eq!(email, "env@example.com");
                    assert_eq!(password.expose_secret(), "hunter2");
                }
                other => panic!("expected password credentials, got {other:?}"),
            }
            Ok(())
        });
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let profile = Profile {
            base_url: Some("not a url".into()),
            ..Profile::default()
        };
        let err = profile_to_client_config(&profile, &Defaults::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBaseUrl(ref url) if url == "not a url"));
    }

    #[test]
    fn profile_overrides_transport() {
        let profile = Profile {
            base_url: Some("http://127.0.0.1:9000/v1".into()),
            timeout: Some(3),
            ..Profile::default()
        };
        let config = profile_to_client_config(&profile, &Defaults::default()).unwrap();
        assert_eq!(config.base_url.as_str(), "http://127.0.0.1:9000/v1/");
        assert_eq!(config.timeout, Duration::from_secs(3));
    }

    #[test]
    fn remembered_client_id_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.remember_client_id("default", "client-xyz");
        if let Some(profile) = config.profiles.get_mut("default") {
            profile.email = Some("me@example.com".into());
            profile.password = Some("hunter2".into());
        }
        save_config_to(&config, &path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("me@example.com"));
        assert!(!written.contains("hunter2"));
        assert!(!written.contains("password ="));
        let reloaded: Config = toml::from_str(&written).unwrap();
        let (_, profile) = reloaded.profile(None).unwrap();
        assert_eq!(profile.client_id.as_deref(), Some("client-xyz"));
    }
}
