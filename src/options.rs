use std::path::PathBuf;
use std::time::Duration;

use crate::broker::{BrokerConfiguration, MqttVersion};
use crate::error::Result;
use crate::tls::{secure_transport, SecureTransport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Last-testament message registered with the broker on connect. Always
/// published at the highest quality of service and never retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub message: String,
    pub qos: u8,
    pub retain: bool,
}

/// Where the eventual client keeps in-flight state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Persistence {
    Memory,
    File(PathBuf),
}

/// Reconnect policy parameters. Driving the reconnection itself is the
/// connection layer's job; this crate only supplies the values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_tries: u32,
    pub wait: Duration,
}

/// Ready-to-use connection parameters derived from a resolved
/// configuration. Immutable and safe to share once built.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub server_uri: String,
    pub hostname: String,
    pub port: u16,
    pub secure_port: u16,
    /// Connection timeout. Resolved values are milliseconds but the
    /// transport layer counts whole seconds, so this is `time_out / 1000`.
    pub connect_timeout: Duration,
    /// Keep-alive interval, converted from milliseconds the same way.
    pub keep_alive: Duration,
    pub version: MqttVersion,
    pub automatic_reconnect: bool,
    pub clean_session: bool,
    pub credentials: Option<Credentials>,
    pub last_will: Option<LastWill>,
    pub reconnect: ReconnectPolicy,
    pub max_inflight: u16,
    pub persistence: Persistence,
    /// Present only when a complete certificate configuration was resolved.
    pub secure_transport: Option<SecureTransport>,
}

impl ConnectOptions {
    pub(crate) fn build(cfg: &BrokerConfiguration) -> Result<Self> {
        let credentials = cfg.user.as_ref().map(|user| Credentials {
            username: user.clone(),
            password: cfg.password.clone().unwrap_or_default(),
        });

        let last_will = match (&cfg.will, &cfg.will_topic) {
            (Some(message), Some(topic)) => Some(LastWill {
                topic: topic.clone(),
                message: message.clone(),
                qos: 2,
                retain: false,
            }),
            _ => None,
        };

        // A partial security configuration means "no security"; a complete
        // one that fails to build is a hard error, never a silent fallback
        // to plaintext.
        let secure = match &cfg.sec {
            Some(sec) if sec.is_complete() => Some(secure_transport(sec)?),
            _ => None,
        };

        let persistence = if cfg.file_persistence {
            Persistence::File(std::env::temp_dir())
        } else {
            Persistence::Memory
        };

        Ok(Self {
            server_uri: cfg.broker_url(),
            hostname: cfg.hostname.clone(),
            port: cfg.port,
            secure_port: cfg.secure_port,
            connect_timeout: Duration::from_secs(cfg.time_out / 1000),
            keep_alive: Duration::from_secs(cfg.keep_alive / 1000),
            version: cfg.version,
            automatic_reconnect: cfg.automatic_reconnect,
            clean_session: cfg.clean_session,
            credentials,
            last_will,
            reconnect: ReconnectPolicy {
                max_tries: cfg.no_tries,
                wait: Duration::from_millis(cfg.reconnect_waiting_time),
            },
            max_inflight: cfg.max_in_flight_messages,
            persistence,
            secure_transport: secure,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerSecurityConfiguration;

    #[test]
    fn milliseconds_become_whole_seconds() {
        let mut cfg = BrokerConfiguration::default();
        cfg.time_out = 60_000;
        cfg.keep_alive = 30_500;

        let opts = cfg.connect_options().unwrap();
        assert_eq!(opts.connect_timeout, Duration::from_secs(60));
        assert_eq!(opts.keep_alive, Duration::from_secs(30));
    }

    #[test]
    fn options_are_computed_once() {
        let cfg = BrokerConfiguration::default();
        let first = cfg.connect_options().unwrap() as *const ConnectOptions;
        let second = cfg.connect_options().unwrap() as *const ConnectOptions;
        assert_eq!(first, second);
    }

    #[test]
    fn partial_security_is_no_security() {
        let mut cfg = BrokerConfiguration::default();
        cfg.sec = Some(BrokerSecurityConfiguration {
            ca_path: "/certs/ca.pem".into(),
            ..Default::default()
        });

        // A complete configuration pointing at these paths would fail to
        // build; a partial one must not even try.
        let opts = cfg.connect_options().unwrap();
        assert!(opts.secure_transport.is_none());
    }

    #[test]
    fn complete_security_that_cannot_build_is_fatal() {
        let mut cfg = BrokerConfiguration::default();
        cfg.sec = Some(BrokerSecurityConfiguration {
            ca_path: "/nonexistent/ca.pem".into(),
            client_certificate_path: "/nonexistent/client.pem".into(),
            key_path: "/nonexistent/client.key".into(),
            ..Default::default()
        });
        assert!(cfg.connect_options().is_err());
    }

    #[test]
    fn will_is_qos_two_and_not_retained() {
        let cfg = BrokerConfiguration::default().with_will("clients/gone", "offline");
        let opts = cfg.connect_options().unwrap();
        let will = opts.last_will.as_ref().unwrap();
        assert_eq!(will.topic, "clients/gone");
        assert_eq!(will.qos, 2);
        assert!(!will.retain);
    }

    #[test]
    fn credentials_require_a_user() {
        let cfg = BrokerConfiguration::default();
        assert!(cfg.connect_options().unwrap().credentials.is_none());

        let cfg = BrokerConfiguration::default().with_credentials("client", "secret");
        let opts = cfg.connect_options().unwrap();
        let creds = opts.credentials.as_ref().unwrap();
        assert_eq!(creds.username, "client");
        assert_eq!(creds.password, "secret");
    }

    #[test]
    fn persistence_selector() {
        let cfg = BrokerConfiguration::default();
        assert_eq!(cfg.connect_options().unwrap().persistence, Persistence::Memory);

        let mut cfg = BrokerConfiguration::default();
        cfg.file_persistence = true;
        assert_eq!(
            cfg.connect_options().unwrap().persistence,
            Persistence::File(std::env::temp_dir())
        );
    }
}
