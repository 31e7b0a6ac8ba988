//! Realtime event channel seam.
//!
//! Authentication hands every fresh access token to an [`EventChannel`].
//! The push protocol itself lives elsewhere; the default [`Websocket`]
//! only holds the credentials a connection would be opened with.

use std::sync::RwLock;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use secrecy::SecretString;
use tracing::debug;

use crate::error::Error;

/// Receives the credentials produced by each successful authentication.
pub trait EventChannel: Send + Sync {
    /// Called once per authentication with the new token and user id.
    fn initialize<'a>(
        &'a self,
        access_token: &'a SecretString,
        user_id: u64,
    ) -> BoxFuture<'a, Result<(), Error>>;
}

/// Default event channel: remembers the most recent credentials.
#[derive(Debug, Default)]
pub struct Websocket {
    credentials: RwLock<Option<(SecretString, u64)>>,
}

impl Websocket {
    pub fn new() -> Self {
        Self::default()
    }

    /// User id of the last initialization, if any.
    pub fn user_id(&self) -> Option<u64> {
        self.credentials
            .read()
            .expect("websocket lock poisoned")
            .as_ref()
            .map(|(_, user_id)| *user_id)
    }

    /// Access token of the last initialization, if any.
    pub fn access_token(&self) -> Option<SecretString> {
        self.credentials
            .read()
            .expect("websocket lock poisoned")
            .as_ref()
            .map(|(token, _)| token.clone())
    }
}

impl EventChannel for Websocket {
    fn initialize<'a>(
        &'a self,
        access_token: &'a SecretString,
        user_id: u64,
    ) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            debug!(user_id, "initializing event channel");
            *self.credentials.write().expect("websocket lock poisoned") =
                Some((access_token.clone(), user_id));
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    #[tokio::test]
    async fn initialize_replaces_credentials() {
        let ws = Websocket::new();
        assert_eq!(ws.user_id(), None);

        ws.initialize(&"first".to_owned().into(), 1).await.unwrap();
        ws.initialize(&"second".to_owned().into(), 2).await.unwrap();

        assert_eq!(ws.user_id(), Some(2));
        assert_eq!(ws.access_token().unwrap().expose_secret(), "second");
    }
}
