use thiserror::Error;

pub type Result<T, E = ConfigError> = std::result::Result<T, E>;

/// Failures raised while resolving a broker configuration or deriving its
/// connection parameters. Remote-catalog failures are deliberately absent:
/// that step is soft and reports through [`crate::catalog::Outcome`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Read or type-conversion error from the configuration backend.
    #[error("configuration source error: {0}")]
    Source(#[from] config::ConfigError),
    /// A value was read but violates a range or enumeration invariant.
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
    /// A reference-copy resolution named an alias that is not registered.
    #[error("unknown reference configuration '{0}'")]
    UnknownReference(String),
    /// Certificate, key or TLS-context construction failed. Security was
    /// requested explicitly, so this is never downgraded to an insecure
    /// connection.
    #[error("secure transport construction failed: {0}")]
    SecureTransport(anyhow::Error),
}

impl ConfigError {
    #[inline]
    pub(crate) fn invalid<K: Into<String>, R: Into<String>>(key: K, reason: R) -> Self {
        ConfigError::InvalidValue { key: key.into(), reason: reason.into() }
    }
}
