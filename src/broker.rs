use std::fmt;
use std::str::FromStr;

use once_cell::sync::OnceCell;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{ConfigError, Result};
use crate::options::ConnectOptions;

/// MQTT protocol revision requested for the connection. `Default` asks the
/// connection layer to try 3.1.1 first and degrade to 3.1 on failure; this
/// crate only carries the selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MqttVersion {
    #[default]
    Default,
    V3,
    V3_1,
    V3_1_1,
}

impl MqttVersion {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            MqttVersion::Default => "DEFAULT",
            MqttVersion::V3 => "V3",
            MqttVersion::V3_1 => "V3_1",
            MqttVersion::V3_1_1 => "V3_1_1",
        }
    }
}

impl fmt::Display for MqttVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MqttVersion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DEFAULT" => Ok(MqttVersion::Default),
            "V3" => Ok(MqttVersion::V3),
            "V3_1" => Ok(MqttVersion::V3_1),
            "V3_1_1" => Ok(MqttVersion::V3_1_1),
            _ => Err(ConfigError::invalid(
                crate::settings::keys::VERSION,
                format!("unknown protocol version '{s}'"),
            )),
        }
    }
}

/// Certificate-based security material. Empty strings mean "unset"; the
/// secure transport is only built when all three paths are present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerSecurityConfiguration {
    pub ca_path: String,
    pub ca_password: String,
    pub client_certificate_path: String,
    pub client_certificate_password: String,
    pub key_path: String,
    pub key_password: String,
}

impl BrokerSecurityConfiguration {
    /// True when the CA, client certificate and key paths are all set.
    #[inline]
    pub fn is_complete(&self) -> bool {
        !self.ca_path.is_empty()
            && !self.client_certificate_path.is_empty()
            && !self.key_path.is_empty()
    }

    fn diagnostic_json(&self) -> Value {
        json!({
            "CApath": self.ca_path,
            "CAPassword": self.ca_password,
            "clientCertificatePath": self.client_certificate_path,
            "clientCertificatePassword": self.client_certificate_password,
            "keyPath": self.key_path,
            "keyPassword": self.key_password,
        })
    }
}

/// Resolved connection configuration for one named broker.
///
/// Instances are produced by [`crate::registry::BrokerRegistry`] and treated
/// as immutable afterwards; programmatic overrides go through the `with_*`
/// methods, which return a new value with an empty derived-options cell.
#[derive(Debug)]
pub struct BrokerConfiguration {
    /// Opaque unique token, usable as a client identifier.
    pub id: String,
    /// Human-readable resolution key.
    pub alias: String,
    /// The alias actually satisfied; differs from `alias` when this
    /// configuration turned out to be another name for an existing profile.
    pub real_profile: String,
    /// Hostname or IP of the broker.
    pub hostname: String,
    /// Plaintext port of the broker.
    pub port: u16,
    /// TLS port of the broker.
    pub secure_port: u16,
    /// Whether in-flight state is persisted to disk rather than memory.
    pub file_persistence: bool,
    /// Discard own messages.
    pub auto_blacklisting: bool,
    /// Default subscription quality of service, 0..=2.
    pub sub_qos: u8,
    /// Default publication quality of service, 0..=2.
    pub pub_qos: u8,
    /// Default retain policy.
    pub retain_policy: bool,
    /// Certificate-based security material, absent when security is off.
    pub sec: Option<BrokerSecurityConfiguration>,
    /// Keep-alive interval, milliseconds.
    pub keep_alive: u64,
    /// Connection timeout, milliseconds.
    pub time_out: u64,
    /// Number of reconnect attempts before giving up.
    pub no_tries: u32,
    /// Waiting time between reconnect attempts, milliseconds.
    pub reconnect_waiting_time: u64,
    /// Maximum messages waiting in the outbound window.
    pub max_in_flight_messages: u16,
    /// Requested protocol revision.
    pub version: MqttVersion,
    /// Whether reconnection is driven by the client library.
    pub automatic_reconnect: bool,
    /// Whether the broker must forget session state between connections.
    pub clean_session: bool,
    /// Last-testament payload left with the broker.
    pub will: Option<String>,
    /// Topic of the last testament.
    pub will_topic: Option<String>,
    /// Credentials for connecting to the broker.
    pub user: Option<String>,
    pub password: Option<String>,

    options: OnceCell<ConnectOptions>,
}

impl BrokerConfiguration {
    fn alias_default() -> String {
        "default".into()
    }
    fn hostname_default() -> String {
        "localhost".into()
    }
    fn port_default() -> u16 {
        1883
    }
    fn secure_port_default() -> u16 {
        8883
    }
    fn keep_alive_default() -> u64 {
        60_000
    }
    fn time_out_default() -> u64 {
        60_000
    }
    fn no_tries_default() -> u32 {
        10
    }
    fn reconnect_waiting_time_default() -> u64 {
        60_000
    }
    fn max_in_flight_default() -> u16 {
        10
    }

    #[inline]
    pub(crate) fn generate_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Ready-to-use connection parameters, computed at most once per
    /// instance. Construction failures (certificate material) surface as
    /// [`ConfigError::SecureTransport`] and are returned again on retry.
    pub fn connect_options(&self) -> Result<&ConnectOptions> {
        self.options.get_or_try_init(|| ConnectOptions::build(self))
    }

    /// Broker URL for the connection layer: the TLS port is used as soon as
    /// a security configuration is present.
    pub fn broker_url(&self) -> String {
        if self.sec.is_some() {
            format!("ssl://{}:{}", self.hostname, self.secure_port)
        } else {
            format!("tcp://{}:{}", self.hostname, self.port)
        }
    }

    pub fn with_hostname<H: Into<String>>(&self, hostname: H) -> Self {
        let mut cfg = self.clone();
        cfg.hostname = hostname.into();
        cfg
    }

    pub fn with_port(&self, port: u16) -> Self {
        let mut cfg = self.clone();
        cfg.port = port;
        cfg
    }

    pub fn with_credentials<U: Into<String>, P: Into<String>>(&self, user: U, password: P) -> Self {
        let mut cfg = self.clone();
        cfg.user = Some(user.into());
        cfg.password = Some(password.into());
        cfg
    }

    pub fn with_will<T: Into<String>, W: Into<String>>(&self, topic: T, message: W) -> Self {
        let mut cfg = self.clone();
        cfg.will_topic = Some(topic.into());
        cfg.will = Some(message.into());
        cfg
    }

    /// Legacy diagnostic form. Passwords are emitted in clear text; use
    /// [`BrokerConfiguration::redacted_json`] for anything that is logged.
    pub fn diagnostic_json(&self) -> Value {
        let mut v = json!({
            "hostname": self.hostname,
            "securePort": self.secure_port,
            "will": self.will,
            "willTopic": self.will_topic,
            "port": self.port,
            "filePersistence": self.file_persistence,
            "subQoS": self.sub_qos,
            "pubQoS": self.pub_qos,
            "retainPolicy": self.retain_policy,
            "keepAlive": self.keep_alive,
            "timeOut": self.time_out,
            "noTries": self.no_tries,
            "version": self.version.as_str(),
            "inFlightMessages": self.max_in_flight_messages,
            "reconnectWaitingTime": self.reconnect_waiting_time,
        });
        if let Some(sec) = &self.sec {
            v["brokerSecurityConfiguration"] = sec.diagnostic_json();
        }
        v
    }

    /// Diagnostic form with every password field masked.
    pub fn redacted_json(&self) -> Value {
        let mut v = self.diagnostic_json();
        if let Some(sec) = v.get_mut("brokerSecurityConfiguration").and_then(Value::as_object_mut) {
            for key in ["CAPassword", "clientCertificatePassword", "keyPassword"] {
                if sec.contains_key(key) {
                    sec[key] = Value::from("***");
                }
            }
        }
        v
    }
}

impl Default for BrokerConfiguration {
    fn default() -> Self {
        Self {
            id: Self::generate_id(),
            alias: Self::alias_default(),
            real_profile: Self::alias_default(),
            hostname: Self::hostname_default(),
            port: Self::port_default(),
            secure_port: Self::secure_port_default(),
            file_persistence: false,
            auto_blacklisting: false,
            sub_qos: 0,
            pub_qos: 0,
            retain_policy: false,
            sec: None,
            keep_alive: Self::keep_alive_default(),
            time_out: Self::time_out_default(),
            no_tries: Self::no_tries_default(),
            reconnect_waiting_time: Self::reconnect_waiting_time_default(),
            max_in_flight_messages: Self::max_in_flight_default(),
            version: MqttVersion::Default,
            automatic_reconnect: true,
            clean_session: false,
            will: None,
            will_topic: None,
            user: None,
            password: None,
            options: OnceCell::new(),
        }
    }
}

// The derived-options cell never travels with a copy; overrides and
// reference copies must recompute it.
impl Clone for BrokerConfiguration {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            alias: self.alias.clone(),
            real_profile: self.real_profile.clone(),
            hostname: self.hostname.clone(),
            port: self.port,
            secure_port: self.secure_port,
            file_persistence: self.file_persistence,
            auto_blacklisting: self.auto_blacklisting,
            sub_qos: self.sub_qos,
            pub_qos: self.pub_qos,
            retain_policy: self.retain_policy,
            sec: self.sec.clone(),
            keep_alive: self.keep_alive,
            time_out: self.time_out,
            no_tries: self.no_tries,
            reconnect_waiting_time: self.reconnect_waiting_time,
            max_in_flight_messages: self.max_in_flight_messages,
            version: self.version,
            automatic_reconnect: self.automatic_reconnect,
            clean_session: self.clean_session,
            will: self.will.clone(),
            will_topic: self.will_topic.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            options: OnceCell::new(),
        }
    }
}

// Identity fields (`id`, `alias`, `real_profile`) are excluded so that
// structurally identical configurations under different aliases compare
// equal.
impl PartialEq for BrokerConfiguration {
    fn eq(&self, other: &Self) -> bool {
        self.hostname == other.hostname
            && self.port == other.port
            && self.secure_port == other.secure_port
            && self.file_persistence == other.file_persistence
            && self.auto_blacklisting == other.auto_blacklisting
            && self.sub_qos == other.sub_qos
            && self.pub_qos == other.pub_qos
            && self.retain_policy == other.retain_policy
            && self.sec == other.sec
            && self.keep_alive == other.keep_alive
            && self.time_out == other.time_out
            && self.no_tries == other.no_tries
            && self.reconnect_waiting_time == other.reconnect_waiting_time
            && self.max_in_flight_messages == other.max_in_flight_messages
            && self.version == other.version
            && self.automatic_reconnect == other.automatic_reconnect
            && self.clean_session == other.clean_session
            && self.will == other.will
            && self.will_topic == other.will_topic
            && self.user == other.user
            && self.password == other.password
    }
}

impl Eq for BrokerConfiguration {}

impl fmt::Display for BrokerConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.redacted_json())
    }
}
