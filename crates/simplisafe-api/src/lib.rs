// simplisafe-api: Async Rust client for the SimpliSafe cloud API

pub mod account;
pub mod auth;
pub mod client;
pub mod error;
pub mod system;
pub mod transport;
pub mod websocket;

pub use account::{Subscription, Subscriptions};
pub use auth::{ClientIdentity, generate_device_id};
pub use client::{LoginOptions, RequestOptions, SimpliSafe};
pub use error::Error;
pub use reqwest::Method;
pub use system::{LocationSystem, System, SystemConstructor, SystemRegistry};
pub use transport::{ClientConfig, HttpSession};
pub use websocket::{EventChannel, Websocket};
