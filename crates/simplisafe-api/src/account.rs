// Account data endpoints
//
// Subscription listing and the systems built from it. Both are thin layers
// over the request dispatcher.

use std::collections::HashMap;

use reqwest::Method;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, warn};

use crate::auth::parse_response;
use crate::client::{RequestOptions, SimpliSafe};
use crate::error::Error;
use crate::system::System;

/// `GET users/{user_id}/subscriptions` response.
#[derive(Debug, Clone, Deserialize)]
pub struct Subscriptions {
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
}

/// One active subscription and the location it covers.
#[derive(Debug, Clone, Deserialize)]
pub struct Subscription {
    #[serde(deserialize_with = "string_or_number")]
    pub sid: String,
    #[serde(default)]
    pub location: Value,
}

impl Subscription {
    /// `location.system.version`, if present and numeric.
    pub fn version(&self) -> Option<u64> {
        self.location
            .pointer("/system/version")
            .and_then(Value::as_u64)
    }

    /// `location.sid`, normalized to a string.
    pub fn location_id(&self) -> Option<String> {
        self.location.get("sid").map(id_string)
    }
}

/// Ids show up as both strings and numbers depending on the endpoint.
pub(crate) fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Value::deserialize(deserializer).map(|v| id_string(&v))
}

impl SimpliSafe {
    /// Fetch the account's active subscriptions.
    pub async fn subscription_data(&self) -> Result<Subscriptions, Error> {
        let user_id = self.user_id().ok_or(Error::NotAuthenticated)?;
        let endpoint = format!("users/{user_id}/subscriptions");

        let body = self
            .request(
                Method::GET,
                &endpoint,
                RequestOptions::new().query("activeOnly", "true"),
            )
            .await?;
        debug!(user_id, "fetched subscription data");

        parse_response(&endpoint, &body)
    }

    /// Build a system object for every subscription with a known version.
    ///
    /// Keys are subscription ids. Locations without a version, or with one
    /// the registry does not recognize, are skipped with a warning.
    pub async fn get_systems(&self) -> Result<HashMap<String, Box<dyn System>>, Error> {
        let data = self.subscription_data().await?;

        let mut systems: HashMap<String, Box<dyn System>> = HashMap::new();
        for subscription in data.subscriptions {
            let location_id = subscription.location_id().unwrap_or_default();

            let Some(version) = subscription.version() else {
                warn!(location = %location_id, "skipping location with missing system data");
                continue;
            };
            let Some(constructor) = self.systems().get(version) else {
                warn!(location = %location_id, version, "skipping location with unsupported system version");
                continue;
            };

            let mut system = constructor(self.clone(), subscription.location);
            system.update(false).await?;
            systems.insert(subscription.sid, system);
        }

        Ok(systems)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn subscription_ids_accept_numbers() {
        let data: Subscriptions = serde_json::from_value(json!({
            "subscriptions": [
                { "sid": 123, "location": { "sid": 456, "system": { "version": 3 } } },
                { "sid": "789", "location": { "sid": "789", "system": {} } },
            ]
        }))
        .unwrap();

        assert_eq!(data.subscriptions[0].sid, "123");
        assert_eq!(data.subscriptions[0].location_id().as_deref(), Some("456"));
        assert_eq!(data.subscriptions[0].version(), Some(3));
        assert_eq!(data.subscriptions[1].sid, "789");
        assert_eq!(data.subscriptions[1].version(), None);
    }

    #[tokio::test]
    async fn subscription_data_requires_login() {
        let api = SimpliSafe::new(crate::client::LoginOptions::default());
        let err = api.subscription_data().await.unwrap_err();
        assert!(matches!(err, Error::NotAuthenticated));
    }
}
