// Per-location system objects
//
// Locations report a `system.version` discriminant; the registry maps each
// version to a constructor. The built-in constructors only keep the raw
// location payload current. Richer device models plug in through
// `SystemRegistry::register`.

use std::collections::HashMap;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use crate::account::id_string;
use crate::client::SimpliSafe;
use crate::error::Error;

/// A system installed at one location.
pub trait System: Send + Sync {
    /// The location id (`location.sid`).
    fn system_id(&self) -> &str;

    /// Hardware/software generation this object was built for.
    fn version(&self) -> u64;

    /// Refresh this system's data. `include_system` also re-reads the
    /// location-level payload from the account's subscriptions.
    fn update(&mut self, include_system: bool) -> BoxFuture<'_, Result<(), Error>>;
}

/// Builds a system from the API handle and its location payload.
pub type SystemConstructor = fn(SimpliSafe, Value) -> Box<dyn System>;

/// Version discriminant → constructor.
#[derive(Debug, Clone)]
pub struct SystemRegistry {
    constructors: HashMap<u64, SystemConstructor>,
}

impl Default for SystemRegistry {
    fn default() -> Self {
        Self::empty()
            .register(2, LocationSystem::v2)
            .register(3, LocationSystem::v3)
    }
}

impl SystemRegistry {
    /// A registry that recognizes no versions.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Add or replace the constructor for `version`.
    #[must_use]
    pub fn register(mut self, version: u64, constructor: SystemConstructor) -> Self {
        self.constructors.insert(version, constructor);
        self
    }

    pub fn get(&self, version: u64) -> Option<SystemConstructor> {
        self.constructors.get(&version).copied()
    }

    pub fn supports(&self, version: u64) -> bool {
        self.constructors.contains_key(&version)
    }
}

// ── Built-in systems ────────────────────────────────────────────────

/// A system backed by the raw location payload.
pub struct LocationSystem {
    api: SimpliSafe,
    system_id: String,
    version: u64,
    location: Value,
}

impl LocationSystem {
    pub fn new(api: SimpliSafe, version: u64, location: Value) -> Self {
        let system_id = location.get("sid").map(id_string).unwrap_or_default();
        Self {
            api,
            system_id,
            version,
            location,
        }
    }

    fn v2(api: SimpliSafe, location: Value) -> Box<dyn System> {
        Box::new(Self::new(api, 2, location))
    }

    fn v3(api: SimpliSafe, location: Value) -> Box<dyn System> {
        Box::new(Self::new(api, 3, location))
    }

    pub fn location(&self) -> &Value {
        &self.location
    }

    pub fn address(&self) -> Option<&str> {
        self.location.get("street1").and_then(Value::as_str)
    }

    pub fn serial(&self) -> Option<&str> {
        self.location
            .pointer("/system/serial")
            .and_then(Value::as_str)
    }

    pub fn alarm_state(&self) -> Option<&str> {
        self.location
            .pointer("/system/alarmState")
            .and_then(Value::as_str)
    }
}

impl System for LocationSystem {
    fn system_id(&self) -> &str {
        &self.system_id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn update(&mut self, include_system: bool) -> BoxFuture<'_, Result<(), Error>> {
        async move {
            if !include_system {
                return Ok(());
            }
            let data = self.api.subscription_data().await?;
            if let Some(subscription) = data
                .subscriptions
                .into_iter()
                .find(|s| s.location_id().as_deref() == Some(self.system_id.as_str()))
            {
                debug!(system_id = %self.system_id, "refreshed location data");
                self.location = subscription.location;
            }
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::client::LoginOptions;

    fn custom(api: SimpliSafe, location: Value) -> Box<dyn System> {
        Box::new(LocationSystem::new(api, 9, location))
    }

    #[test]
    fn default_registry_knows_v2_and_v3() {
        let registry = SystemRegistry::default();
        assert!(registry.supports(2));
        assert!(registry.supports(3));
        assert!(!registry.supports(1));
        assert!(SystemRegistry::empty().get(3).is_none());
    }

    #[test]
    fn registered_constructor_is_used() {
        let registry = SystemRegistry::empty().register(9, custom);
        let api = SimpliSafe::new(LoginOptions::default());
        let ctor = registry.get(9).unwrap();
        let system = ctor(api, json!({ "sid": 42, "system": { "version": 9 } }));
        assert_eq!(system.system_id(), "42");
        assert_eq!(system.version(), 9);
    }

    #[test]
    fn location_accessors_read_payload() {
        let api = SimpliSafe::new(LoginOptions::default());
        let system = LocationSystem::new(
            api,
            3,
            json!({
                "sid": "123",
                "street1": "1 Main St",
                "system": { "version": 3, "serial": "ABC", "alarmState": "OFF" }
            }),
        );
        assert_eq!(system.address(), Some("1 Main St"));
        assert_eq!(system.serial(), Some("ABC"));
        assert_eq!(system.alarm_state(), Some("OFF"));
    }

    #[tokio::test]
    async fn update_without_system_makes_no_calls() {
        let api = SimpliSafe::new(LoginOptions::default());
        let mut system = LocationSystem::new(api, 3, json!({ "sid": "1" }));
        system.update(false).await.unwrap();
        assert_eq!(system.location()["sid"], "1");
    }
}
