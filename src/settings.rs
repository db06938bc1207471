use std::ops::Deref;
use std::sync::Arc;

use config::{Config, Environment, File};

use crate::error::Result;

/// Recognized configuration keys. Every broker key can be used bare or
/// suffixed with `_<alias>`; the suffixed form wins.
pub mod keys {
    pub const HOSTNAME: &str = "mqtt_hostname";
    pub const PORT: &str = "mqtt_port";
    pub const SECURE_PORT: &str = "mqtt_secure_port";
    pub const FILE_PERSISTENCE: &str = "mqtt_file_persistence";
    pub const PUB_QOS: &str = "mqtt_pub_qos";
    pub const SUB_QOS: &str = "mqtt_sub_qos";
    pub const RETAIN_POLICY: &str = "mqtt_retain_policy";
    pub const RECONNECT_TRIES: &str = "mqtt_reconnect_tries";
    pub const RECONNECT_WAIT: &str = "mqtt_reconnect_wait";
    pub const CONNECT_TIMEOUT: &str = "mqtt_connect_timeout";
    pub const KEEP_ALIVE: &str = "mqtt_keep_alive";
    pub const MAX_INFLIGHT: &str = "mqtt_max_inflight";
    pub const VERSION: &str = "mqtt_version";
    pub const AUTOMATIC_RECONNECT: &str = "mqtt_automatic_reconnect";
    pub const CLEAN_SESSION: &str = "mqtt_clean_session";
    pub const AUTO_BLACKLISTING: &str = "mqtt_auto_blacklisting";
    pub const USER: &str = "mqtt_user";
    pub const PASSWORD: &str = "mqtt_password";
    pub const CERT_SECURITY: &str = "mqtt_certificate_security";
    pub const CA_PATH: &str = "mqtt_ca_path";
    pub const CA_PASSWORD: &str = "mqtt_ca_password";
    pub const CERT_PATH: &str = "mqtt_certificate_path";
    pub const CERT_PASSWORD: &str = "mqtt_certificate_password";
    pub const KEY_PATH: &str = "mqtt_key_path";
    pub const KEY_PASSWORD: &str = "mqtt_key_password";

    /// List of aliases preloaded by a bulk resolution.
    pub const BROKER_ALIASES: &str = "mqtt_broker_aliases";
    /// Alias queried once when a catalog lookup misses.
    pub const DEFAULT_BROKER: &str = "mqtt_default_broker";

    pub const CATALOG_ENDPOINT: &str = "service_catalog_endpoint";
    pub const CATALOG_TIMEOUT: &str = "service_catalog_timeout";
}

/// Layered configuration source. Later sources override earlier ones;
/// whether a key exists at all is a separate question from which layer
/// defines it, so [`Settings::contains_key`] reports "defined anywhere".
#[derive(Clone)]
pub struct Settings(Arc<Config>);

impl Deref for Settings {
    type Target = Config;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    /// Loads the default source stack: system-wide file, working-directory
    /// file, then `MQTTCONF_`-prefixed environment variables.
    pub fn load() -> Result<Self> {
        Self::load_with(None)
    }

    /// Same as [`Settings::load`], with an extra file source layered on top.
    pub fn load_with(cfg_name: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/mqttconf/mqttconf").required(false))
            .add_source(File::with_name("mqttconf").required(false))
            .add_source(Environment::with_prefix("mqttconf"));

        if let Some(cfg) = cfg_name {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }

        Ok(Self(Arc::new(builder.build()?)))
    }

    /// True if the key is defined in any layer.
    #[inline]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.get::<config::Value>(key).is_ok()
    }

    #[inline]
    pub fn get_string(&self, key: &str) -> Result<String> {
        Ok(self.0.get_string(key)?)
    }

    #[inline]
    pub fn get_int(&self, key: &str) -> Result<i64> {
        Ok(self.0.get_int(key)?)
    }

    #[inline]
    pub fn get_bool(&self, key: &str) -> Result<bool> {
        Ok(self.0.get_bool(key)?)
    }

    pub fn get_list(&self, key: &str) -> Result<Vec<String>> {
        self.0
            .get_array(key)?
            .into_iter()
            .map(|v| v.into_string().map_err(Into::into))
            .collect()
    }
}

impl From<Config> for Settings {
    fn from(cfg: Config) -> Self {
        Self(Arc::new(cfg))
    }
}
