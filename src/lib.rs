#![deny(unsafe_code)]

//! Alias-keyed broker connection configuration for MQTT clients.
//!
//! Client processes name the broker they want ("alias") and get back a fully
//! resolved [`BrokerConfiguration`]: network coordinates, session and
//! reliability parameters, optional certificate material. Values are merged
//! from a layered configuration source (alias-specific key over generic key
//! over built-in default), optionally overwritten by a remote service
//! catalog (soft-failing), and cached per alias for the life of the
//! registry. Resolved configurations derive ready-to-use
//! [`ConnectOptions`](options::ConnectOptions) — including a rustls client
//! context when certificate security is enabled — for whatever MQTT client
//! library does the actual connecting.
//!
//! ```rust,no_run
//! use mqttconf::{BrokerRegistry, Settings};
//!
//! #[tokio::main]
//! async fn main() -> mqttconf::Result<()> {
//!     let registry = BrokerRegistry::new(Settings::load()?);
//!
//!     let cfg = registry.resolve("default").await?;
//!     let opts = cfg.connect_options()?;
//!     println!("connecting to {}", opts.server_uri);
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod catalog;
pub mod error;
pub mod options;
pub mod registry;
pub mod settings;
pub mod tls;

pub use broker::{BrokerConfiguration, BrokerSecurityConfiguration, MqttVersion};
pub use catalog::{CatalogLookup, HttpCatalog, Outcome, ServiceDescriptor};
pub use error::{ConfigError, Result};
pub use options::{ConnectOptions, Credentials, LastWill, Persistence, ReconnectPolicy};
pub use registry::BrokerRegistry;
pub use settings::Settings;
pub use tls::{secure_transport, SecureTransport};
