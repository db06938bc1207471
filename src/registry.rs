use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::broker::{BrokerConfiguration, BrokerSecurityConfiguration, MqttVersion};
use crate::catalog::{CatalogLookup, CatalogStep, Outcome};
use crate::error::{ConfigError, Result};
use crate::settings::{keys, Settings};

type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
type Slot = Arc<OnceCell<Arc<BrokerConfiguration>>>;

/// Concurrent alias-keyed registry of resolved broker configurations.
///
/// Resolution is single-flight per alias: concurrent first resolutions of
/// the same alias perform the work (and the remote-catalog lookup) once and
/// converge on one shared instance. Failed resolutions cache nothing.
///
/// The registry is an owned object; whoever composes the application
/// decides its scope and hands it to the components that resolve.
pub struct BrokerRegistry {
    settings: Settings,
    catalog: CatalogStep,
    entries: DashMap<String, Slot>,
    loaded: AtomicBool,
}

impl BrokerRegistry {
    /// Registry over the given settings; the catalog client is built from
    /// the `service_catalog_endpoint` key when present.
    pub fn new(settings: Settings) -> Self {
        let catalog = CatalogStep::from_settings(&settings);
        Self { settings, catalog, entries: DashMap::new(), loaded: AtomicBool::new(false) }
    }

    /// Registry with an explicit catalog client. The default-broker
    /// fallback alias is still read from the settings.
    pub fn with_catalog(settings: Settings, lookup: Arc<dyn CatalogLookup>) -> Self {
        let default_alias = if settings.contains_key(keys::DEFAULT_BROKER) {
            settings.get_string(keys::DEFAULT_BROKER).ok()
        } else {
            None
        };
        let catalog = CatalogStep::new(Some(lookup), default_alias);
        Self { settings, catalog, entries: DashMap::new(), loaded: AtomicBool::new(false) }
    }

    /// Resolves the configuration for `alias`, reading every field from the
    /// configuration source with alias-specific keys overriding generic
    /// keys overriding built-in defaults, then applying the catalog
    /// overwrite. The empty alias denotes the unqualified profile.
    pub async fn resolve(&self, alias: &str) -> Result<Arc<BrokerConfiguration>> {
        let slot = self.slot(alias);
        let cfg = slot
            .get_or_try_init(|| async {
                let cfg = self.load(alias).await?;
                log::debug!("resolved broker configuration '{}': {}", alias, cfg.redacted_json());
                Ok::<_, ConfigError>(Arc::new(cfg))
            })
            .await?;
        Ok(cfg.clone())
    }

    /// Resolves `alias` by copying every field from an already-resolved
    /// reference instead of reading the configuration source. The catalog
    /// overwrite still runs; when the result equals the reference, the
    /// reference's real profile is adopted.
    pub async fn resolve_like(&self, alias: &str, reference_alias: &str) -> Result<Arc<BrokerConfiguration>> {
        let reference = self
            .get(reference_alias)
            .ok_or_else(|| ConfigError::UnknownReference(reference_alias.to_string()))?;

        let slot = self.slot(alias);
        let cfg = slot
            .get_or_try_init(|| async {
                let mut cfg = reference.as_ref().clone();
                cfg.id = BrokerConfiguration::generate_id();
                cfg.alias = alias.to_string();
                cfg.real_profile = alias.to_string();

                let outcome = self.catalog.overwrite(&mut cfg).await;
                log::debug!("catalog overwrite for '{}': {:?}", alias, outcome);

                if cfg == *reference {
                    cfg.real_profile = reference.real_profile.clone();
                }
                Ok::<_, ConfigError>(Arc::new(cfg))
            })
            .await?;
        Ok(cfg.clone())
    }

    /// Resolves every alias listed under the broker-aliases key. The list
    /// is read once; later calls only snapshot the registry.
    pub async fn resolve_all(&self) -> Result<HashMap<String, Arc<BrokerConfiguration>>> {
        if !self.loaded.load(Ordering::Acquire) {
            if self.settings.contains_key(keys::BROKER_ALIASES) {
                for alias in self.settings.get_list(keys::BROKER_ALIASES)? {
                    self.resolve(&alias).await?;
                }
            }
            self.loaded.store(true, Ordering::Release);
        }
        Ok(self.snapshot())
    }

    /// Inserts a configuration without resolving, if the alias is absent.
    pub fn register(&self, alias: &str, configuration: BrokerConfiguration) {
        let slot = self.slot(alias);
        if slot.set(Arc::new(configuration)).is_err() {
            log::debug!("register discarded, alias '{}' already present", alias);
        }
    }

    /// True if a resolved configuration is cached under `alias`.
    pub fn contains(&self, alias: &str) -> bool {
        self.get(alias).is_some()
    }

    /// Removes and returns the configuration cached under `alias`.
    pub fn remove(&self, alias: &str) -> Option<Arc<BrokerConfiguration>> {
        self.entries.remove(alias).and_then(|(_, slot)| slot.get().cloned())
    }

    fn get(&self, alias: &str) -> Option<Arc<BrokerConfiguration>> {
        self.entries.get(alias).and_then(|slot| slot.value().get().cloned())
    }

    fn slot(&self, alias: &str) -> Slot {
        self.entries.entry(alias.to_string()).or_default().clone()
    }

    fn snapshot(&self) -> HashMap<String, Arc<BrokerConfiguration>> {
        self.entries
            .iter()
            .filter_map(|entry| entry.value().get().map(|cfg| (entry.key().clone(), cfg.clone())))
            .collect()
    }

    async fn load(&self, alias: &str) -> Result<BrokerConfiguration> {
        let sfx = if alias.is_empty() { String::new() } else { format!("_{alias}") };

        let mut cfg = BrokerConfiguration::default();
        cfg.alias = alias.to_string();
        cfg.real_profile = if alias.is_empty() { "default".into() } else { alias.to_string() };

        cfg.hostname = self.string(keys::HOSTNAME, &sfx, cfg.hostname)?;
        cfg.port = self.port(keys::PORT, &sfx, cfg.port)?;
        cfg.secure_port = self.port(keys::SECURE_PORT, &sfx, cfg.secure_port)?;
        cfg.file_persistence = self.boolean(keys::FILE_PERSISTENCE, &sfx, cfg.file_persistence)?;
        cfg.pub_qos = self.qos(keys::PUB_QOS, &sfx, cfg.pub_qos)?;
        cfg.sub_qos = self.qos(keys::SUB_QOS, &sfx, cfg.sub_qos)?;
        cfg.retain_policy = self.boolean(keys::RETAIN_POLICY, &sfx, cfg.retain_policy)?;
        let tries = self.unsigned(keys::RECONNECT_TRIES, &sfx, u64::from(cfg.no_tries))?;
        cfg.no_tries = u32::try_from(tries)
            .map_err(|_| ConfigError::invalid(keys::RECONNECT_TRIES, format!("out of range, got {tries}")))?;
        cfg.reconnect_waiting_time = self.unsigned(keys::RECONNECT_WAIT, &sfx, cfg.reconnect_waiting_time)?;
        cfg.time_out = self.unsigned(keys::CONNECT_TIMEOUT, &sfx, cfg.time_out)?;
        cfg.keep_alive = self.unsigned(keys::KEEP_ALIVE, &sfx, cfg.keep_alive)?;
        cfg.max_in_flight_messages = self.inflight(keys::MAX_INFLIGHT, &sfx, cfg.max_in_flight_messages)?;
        cfg.version = self.string(keys::VERSION, &sfx, cfg.version.to_string())?.parse::<MqttVersion>()?;
        cfg.automatic_reconnect = self.boolean(keys::AUTOMATIC_RECONNECT, &sfx, cfg.automatic_reconnect)?;
        cfg.clean_session = self.boolean(keys::CLEAN_SESSION, &sfx, cfg.clean_session)?;
        cfg.auto_blacklisting = self.boolean(keys::AUTO_BLACKLISTING, &sfx, cfg.auto_blacklisting)?;
        cfg.user = self.opt_string(keys::USER, &sfx)?;
        cfg.password = self.opt_string(keys::PASSWORD, &sfx)?;

        if self.boolean(keys::CERT_SECURITY, &sfx, cfg.sec.is_some())? {
            let sec = cfg.sec.take().unwrap_or_default();
            cfg.sec = Some(BrokerSecurityConfiguration {
                ca_path: self.string(keys::CA_PATH, &sfx, sec.ca_path)?,
                client_certificate_path: self.string(keys::CERT_PATH, &sfx, sec.client_certificate_path)?,
                key_path: self.string(keys::KEY_PATH, &sfx, sec.key_path)?,
                ca_password: self.string(keys::CA_PASSWORD, &sfx, sec.ca_password)?,
                client_certificate_password: self.string(keys::CERT_PASSWORD, &sfx, sec.client_certificate_password)?,
                key_password: self.string(keys::KEY_PASSWORD, &sfx, sec.key_password)?,
            });
        }

        let outcome = self.catalog.overwrite(&mut cfg).await;
        if outcome != Outcome::Applied {
            log::debug!("catalog overwrite for '{}': {:?}, using local values", alias, outcome);
        }

        Ok(cfg)
    }

    // Per-field precedence: `<key>_<alias>` defined anywhere, then the bare
    // key, then the built-in default.
    fn string(&self, key: &str, sfx: &str, default: String) -> Result<String> {
        let suffixed = format!("{key}{sfx}");
        if self.settings.contains_key(&suffixed) {
            return self.settings.get_string(&suffixed);
        }
        if self.settings.contains_key(key) {
            return self.settings.get_string(key);
        }
        Ok(default)
    }

    fn opt_string(&self, key: &str, sfx: &str) -> Result<Option<String>> {
        let suffixed = format!("{key}{sfx}");
        if self.settings.contains_key(&suffixed) {
            return self.settings.get_string(&suffixed).map(Some);
        }
        if self.settings.contains_key(key) {
            return self.settings.get_string(key).map(Some);
        }
        Ok(None)
    }

    fn int(&self, key: &str, sfx: &str, default: i64) -> Result<i64> {
        let suffixed = format!("{key}{sfx}");
        if self.settings.contains_key(&suffixed) {
            return self.settings.get_int(&suffixed);
        }
        if self.settings.contains_key(key) {
            return self.settings.get_int(key);
        }
        Ok(default)
    }

    fn boolean(&self, key: &str, sfx: &str, default: bool) -> Result<bool> {
        let suffixed = format!("{key}{sfx}");
        if self.settings.contains_key(&suffixed) {
            return self.settings.get_bool(&suffixed);
        }
        if self.settings.contains_key(key) {
            return self.settings.get_bool(key);
        }
        Ok(default)
    }

    fn unsigned(&self, key: &str, sfx: &str, default: u64) -> Result<u64> {
        let v = self.int(key, sfx, default as i64)?;
        u64::try_from(v).map_err(|_| ConfigError::invalid(key, format!("must not be negative, got {v}")))
    }

    fn port(&self, key: &str, sfx: &str, default: u16) -> Result<u16> {
        let v = self.int(key, sfx, i64::from(default))?;
        match u16::try_from(v) {
            Ok(p) if p > 0 => Ok(p),
            _ => Err(ConfigError::invalid(key, format!("must be in 1..=65535, got {v}"))),
        }
    }

    fn qos(&self, key: &str, sfx: &str, default: u8) -> Result<u8> {
        let v = self.int(key, sfx, i64::from(default))?;
        match v {
            0..=2 => Ok(v as u8),
            _ => Err(ConfigError::invalid(key, format!("quality of service must be 0, 1 or 2, got {v}"))),
        }
    }

    fn inflight(&self, key: &str, sfx: &str, default: u16) -> Result<u16> {
        let v = self.int(key, sfx, i64::from(default))?;
        u16::try_from(v).map_err(|_| ConfigError::invalid(key, format!("must fit a 16-bit window, got {v}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ServiceDescriptor, MQTT_API};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        let mut builder = config::Config::builder();
        for (k, v) in pairs {
            builder = builder.set_override(*k, *v).expect("override");
        }
        builder.build().expect("config build").into()
    }

    fn registry(pairs: &[(&str, &str)]) -> BrokerRegistry {
        BrokerRegistry::new(settings(pairs))
    }

    struct CountingCatalog {
        calls: AtomicUsize,
        uri: String,
    }

    #[async_trait]
    impl CatalogLookup for CountingCatalog {
        async fn lookup_by_alias(&self, _alias: &str) -> anyhow::Result<ServiceDescriptor> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut apis = HashMap::default();
            apis.insert(MQTT_API.to_string(), self.uri.clone());
            Ok(ServiceDescriptor { id: "svc".into(), description: String::new(), apis })
        }
    }

    struct FailingCatalog;

    #[async_trait]
    impl CatalogLookup for FailingCatalog {
        async fn lookup_by_alias(&self, alias: &str) -> anyhow::Result<ServiceDescriptor> {
            Err(anyhow::anyhow!("{} is not registered", alias))
        }
    }

    #[tokio::test]
    async fn precedence_alias_key_over_generic_over_default() {
        let reg = registry(&[
            // string: all three layers exercised across aliases
            (&format!("{}_test", keys::HOSTNAME), "test.example"),
            (keys::HOSTNAME, "generic.example"),
            // integer
            (&format!("{}_test", keys::KEEP_ALIVE), "10000"),
            (keys::KEEP_ALIVE, "30000"),
            // boolean
            (&format!("{}_test", keys::RETAIN_POLICY), "true"),
        ]);

        let test = reg.resolve("test").await.unwrap();
        assert_eq!(test.hostname, "test.example");
        assert_eq!(test.keep_alive, 10_000);
        assert!(test.retain_policy);

        let other = reg.resolve("other").await.unwrap();
        assert_eq!(other.hostname, "generic.example");
        assert_eq!(other.keep_alive, 30_000);
        assert!(!other.retain_policy);

        // no keys at all for this field: built-in default
        assert_eq!(other.time_out, 60_000);
    }

    #[tokio::test]
    async fn generic_port_with_alias_specific_secure_port() {
        let reg = registry(&[
            (keys::PORT, "1883"),
            (&format!("{}_test", keys::SECURE_PORT), "8884"),
        ]);

        let cfg = reg.resolve("test").await.unwrap();
        assert_eq!(cfg.port, 1883);
        assert_eq!(cfg.secure_port, 8884);
    }

    #[tokio::test]
    async fn resolve_is_idempotent_and_cached() {
        let reg = registry(&[]);
        let first = reg.resolve("default").await.unwrap();
        let second = reg.resolve("default").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(reg.contains("default"));
    }

    #[tokio::test]
    async fn empty_alias_is_the_unqualified_profile() {
        let reg = registry(&[(keys::HOSTNAME, "bare.example")]);
        let cfg = reg.resolve("").await.unwrap();
        assert_eq!(cfg.alias, "");
        assert_eq!(cfg.real_profile, "default");
        assert_eq!(cfg.hostname, "bare.example");
    }

    #[tokio::test]
    async fn invalid_values_fail_resolution() {
        let reg = registry(&[(keys::PUB_QOS, "7")]);
        assert!(matches!(reg.resolve("x").await, Err(ConfigError::InvalidValue { .. })));
        // nothing was cached, the alias can be resolved after a fix
        assert!(!reg.contains("x"));

        let reg = registry(&[(keys::PORT, "0")]);
        assert!(reg.resolve("x").await.is_err());

        let reg = registry(&[(keys::VERSION, "V6")]);
        assert!(reg.resolve("x").await.is_err());
    }

    #[tokio::test]
    async fn credentials_follow_precedence() {
        let reg = registry(&[
            (keys::USER, "generic-user"),
            (&format!("{}_test", keys::USER), "test-user"),
            (keys::PASSWORD, "pw"),
        ]);

        let test = reg.resolve("test").await.unwrap();
        assert_eq!(test.user.as_deref(), Some("test-user"));
        assert_eq!(test.password.as_deref(), Some("pw"));

        let anon = registry(&[]).resolve("test").await.unwrap();
        assert_eq!(anon.user, None);
    }

    #[tokio::test]
    async fn security_requires_the_flag() {
        let reg = registry(&[(keys::CA_PATH, "/certs/ca.pem")]);
        assert!(reg.resolve("x").await.unwrap().sec.is_none());

        let reg = registry(&[
            (keys::CERT_SECURITY, "true"),
            (keys::CA_PATH, "/certs/ca.pem"),
            (&format!("{}_edge", keys::KEY_PATH), "/certs/edge.key"),
        ]);
        let cfg = reg.resolve("edge").await.unwrap();
        let sec = cfg.sec.as_ref().unwrap();
        assert_eq!(sec.ca_path, "/certs/ca.pem");
        assert_eq!(sec.key_path, "/certs/edge.key");
        assert_eq!(sec.client_certificate_path, "");
    }

    #[tokio::test]
    async fn soft_catalog_failure_keeps_local_values() {
        let reg = BrokerRegistry::with_catalog(
            settings(&[(keys::HOSTNAME, "local.example")]),
            Arc::new(FailingCatalog),
        );
        let cfg = reg.resolve("x").await.unwrap();
        assert_eq!(cfg.hostname, "local.example");
    }

    #[tokio::test]
    async fn catalog_overwrite_applies_to_resolution() {
        let catalog = Arc::new(CountingCatalog { calls: AtomicUsize::new(0), uri: "tcp://cat.example:2883".into() });
        let reg = BrokerRegistry::with_catalog(settings(&[]), catalog.clone());

        let cfg = reg.resolve("x").await.unwrap();
        assert_eq!(cfg.hostname, "cat.example");
        assert_eq!(cfg.port, 2883);
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 1);

        // cached: no second lookup for the same alias
        reg.resolve("x").await.unwrap();
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_resolutions_are_single_flight() {
        let catalog = Arc::new(CountingCatalog { calls: AtomicUsize::new(0), uri: "tcp://cat.example:2883".into() });
        let reg = Arc::new(BrokerRegistry::with_catalog(settings(&[]), catalog.clone()));

        let a = tokio::spawn({
            let reg = reg.clone();
            async move { reg.resolve("shared").await.unwrap() }
        });
        let b = tokio::spawn({
            let reg = reg.clone();
            async move { reg.resolve("shared").await.unwrap() }
        });

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resolve_all_loads_listed_aliases_once() {
        let s: Settings = config::Config::builder()
            .set_override(keys::BROKER_ALIASES, vec!["north", "south"])
            .unwrap()
            .set_override(format!("{}_north", keys::PORT), "2001")
            .unwrap()
            .build()
            .unwrap()
            .into();
        let reg = BrokerRegistry::new(s);

        let all = reg.resolve_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["north"].port, 2001);

        // idempotent, and later snapshots include later resolutions
        reg.resolve("east").await.unwrap();
        let all = reg.resolve_all().await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn register_is_insert_if_absent() {
        let reg = registry(&[]);
        let mut cfg = BrokerConfiguration::default();
        cfg.hostname = "handmade.example".into();
        reg.register("manual", cfg);

        let resolved = reg.resolve("manual").await.unwrap();
        assert_eq!(resolved.hostname, "handmade.example");

        // a second register for the same alias is discarded
        let mut other = BrokerConfiguration::default();
        other.hostname = "other.example".into();
        reg.register("manual", other);
        assert_eq!(reg.resolve("manual").await.unwrap().hostname, "handmade.example");
    }

    #[tokio::test]
    async fn remove_evicts_the_alias() {
        let reg = registry(&[]);
        reg.resolve("gone").await.unwrap();
        assert!(reg.remove("gone").is_some());
        assert!(!reg.contains("gone"));
        assert!(reg.remove("gone").is_none());
    }

    #[tokio::test]
    async fn resolve_like_adopts_the_reference_profile() {
        let reg = registry(&[(keys::HOSTNAME, "shared.example")]);
        let reference = reg.resolve("primary").await.unwrap();

        let twin = reg.resolve_like("secondary", "primary").await.unwrap();
        assert_eq!(*twin, *reference);
        assert_eq!(twin.alias, "secondary");
        assert_eq!(twin.real_profile, "primary");
        assert_ne!(twin.id, reference.id);
    }

    #[tokio::test]
    async fn resolve_like_requires_a_known_reference() {
        let reg = registry(&[]);
        assert!(matches!(
            reg.resolve_like("a", "missing").await,
            Err(ConfigError::UnknownReference(_))
        ));
    }
}
