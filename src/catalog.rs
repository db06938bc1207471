use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::OnceCell;
use url::Url;

use crate::broker::BrokerConfiguration;
use crate::settings::{keys, Settings};

type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

/// API name under which brokers advertise their MQTT endpoint.
pub const MQTT_API: &str = "MQTT";

const INSECURE_SCHEMES: &[&str] = &["tcp", "mqtt"];
const SECURE_SCHEMES: &[&str] = &["tls", "ssl", "mqtts"];

fn catalog_timeout_default() -> Duration {
    Duration::from_secs(5)
}

/// Network-service descriptor returned by the catalog for one alias.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceDescriptor {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// API name to advertised endpoint URI.
    #[serde(default)]
    pub apis: HashMap<String, String>,
}

/// Alias-keyed lookup against a service catalog.
#[async_trait]
pub trait CatalogLookup: Send + Sync {
    async fn lookup_by_alias(&self, alias: &str) -> anyhow::Result<ServiceDescriptor>;

    /// Reachability probe, consulted once per process.
    async fn is_available(&self) -> bool {
        true
    }
}

/// REST catalog client: `GET <base>/<alias>` returning a JSON descriptor.
pub struct HttpCatalog {
    base: Url,
    client: reqwest::Client,
}

impl HttpCatalog {
    pub fn new(endpoint: &str, timeout: Duration) -> anyhow::Result<Self> {
        let mut base = Url::parse(endpoint)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base, client })
    }
}

#[async_trait]
impl CatalogLookup for HttpCatalog {
    async fn lookup_by_alias(&self, alias: &str) -> anyhow::Result<ServiceDescriptor> {
        let url = self.base.join(alias)?;
        log::debug!("catalog lookup, url: {}", url);
        let resp = self.client.get(url).send().await?.error_for_status()?;
        Ok(resp.json::<ServiceDescriptor>().await?)
    }

    async fn is_available(&self) -> bool {
        // Any HTTP response counts as reachable; only transport errors
        // (refused, DNS, timeout) mark the catalog down.
        self.client.get(self.base.clone()).send().await.is_ok()
    }
}

/// Result of one overwrite attempt. There is no error case: every failure
/// is soft and leaves the input configuration unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The descriptor was found and the endpoint applied.
    Applied,
    /// No catalog is configured, or the probe marked it down for the life
    /// of the process.
    Unavailable,
    /// Lookup miss, exhausted fallback, or an unusable descriptor.
    Skipped,
}

/// The catalog overwrite step of a resolution: looks the alias up, falls
/// back to the configured default broker at most once per process, and
/// rewrites hostname and the scheme-matching port.
pub(crate) struct CatalogStep {
    lookup: Option<Arc<dyn CatalogLookup>>,
    default_alias: Option<String>,
    available: OnceCell<bool>,
    fallback_used: AtomicBool,
}

impl CatalogStep {
    pub(crate) fn new(lookup: Option<Arc<dyn CatalogLookup>>, default_alias: Option<String>) -> Self {
        Self { lookup, default_alias, available: OnceCell::new(), fallback_used: AtomicBool::new(false) }
    }

    pub(crate) fn from_settings(settings: &Settings) -> Self {
        let timeout = settings
            .get_int(keys::CATALOG_TIMEOUT)
            .ok()
            .and_then(|ms| u64::try_from(ms).ok())
            .map(Duration::from_millis)
            .unwrap_or_else(catalog_timeout_default);

        let lookup: Option<Arc<dyn CatalogLookup>> = if settings.contains_key(keys::CATALOG_ENDPOINT) {
            match settings
                .get_string(keys::CATALOG_ENDPOINT)
                .map_err(anyhow::Error::new)
                .and_then(|endpoint| HttpCatalog::new(&endpoint, timeout))
            {
                Ok(catalog) => Some(Arc::new(catalog)),
                Err(e) => {
                    log::warn!("service catalog disabled, bad endpoint: {:?}", e);
                    None
                }
            }
        } else {
            None
        };

        let default_alias = if settings.contains_key(keys::DEFAULT_BROKER) {
            settings.get_string(keys::DEFAULT_BROKER).ok()
        } else {
            None
        };

        Self::new(lookup, default_alias)
    }

    pub(crate) async fn overwrite(&self, cfg: &mut BrokerConfiguration) -> Outcome {
        let Some(lookup) = self.lookup.as_ref() else {
            return Outcome::Unavailable;
        };
        let available = *self.available.get_or_init(|| lookup.is_available()).await;
        if !available {
            return Outcome::Unavailable;
        }

        let service = match lookup.lookup_by_alias(&cfg.alias).await {
            Ok(service) => service,
            Err(e) => {
                log::debug!("catalog miss for alias '{}': {:?}", cfg.alias, e);
                // One fallback query per process, consumed even when it
                // fails, so repeated misses stop hitting the catalog.
                if self.fallback_used.swap(true, Ordering::AcqRel) {
                    return Outcome::Skipped;
                }
                let Some(default_alias) = self.default_alias.as_ref() else {
                    return Outcome::Skipped;
                };
                match lookup.lookup_by_alias(default_alias).await {
                    Ok(service) => service,
                    Err(e) => {
                        log::debug!("catalog miss for default broker '{}': {:?}", default_alias, e);
                        return Outcome::Skipped;
                    }
                }
            }
        };

        apply(cfg, &service)
    }
}

fn apply(cfg: &mut BrokerConfiguration, service: &ServiceDescriptor) -> Outcome {
    let Some(raw) = service.apis.get(MQTT_API) else {
        log::debug!("catalog entry for '{}' advertises no {} api", cfg.alias, MQTT_API);
        return Outcome::Skipped;
    };
    let uri = match Url::parse(raw) {
        Ok(uri) => uri,
        Err(e) => {
            log::warn!("unparseable catalog endpoint '{}': {:?}", raw, e);
            return Outcome::Skipped;
        }
    };
    let Some(host) = uri.host_str() else {
        log::warn!("catalog endpoint '{}' has no host", raw);
        return Outcome::Skipped;
    };

    cfg.hostname = host.to_string();
    if let Some(port) = uri.port() {
        if INSECURE_SCHEMES.contains(&uri.scheme()) {
            cfg.port = port;
        } else if SECURE_SCHEMES.contains(&uri.scheme()) {
            cfg.secure_port = port;
        }
    }
    Outcome::Applied
}
