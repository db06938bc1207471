use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;
#[cfg(not(target_os = "windows"))]
use rustls::crypto::aws_lc_rs as provider;
#[cfg(target_os = "windows")]
use rustls::crypto::ring as provider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::broker::BrokerSecurityConfiguration;
use crate::error::{ConfigError, Result};

/// TLS client context for the secure broker port: the remote certificate is
/// validated against the configured CA and the client authenticates with its
/// own certificate and key.
#[derive(Clone)]
pub struct SecureTransport(Arc<ClientConfig>);

impl SecureTransport {
    #[inline]
    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.0.clone()
    }

    #[inline]
    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.0.clone())
    }
}

impl fmt::Debug for SecureTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureTransport(..)")
    }
}

/// Builds the secure transport from PEM material on disk. Requires TLS 1.2.
/// All input files are read eagerly; handles are released on every path.
///
/// PEM files are expected unencrypted; an encrypted private key is rejected
/// by the loader and surfaces here as a construction error.
pub fn secure_transport(sec: &BrokerSecurityConfiguration) -> Result<SecureTransport> {
    build(sec).map(|c| SecureTransport(Arc::new(c))).map_err(ConfigError::SecureTransport)
}

fn build(sec: &BrokerSecurityConfiguration) -> anyhow::Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_file_iter(&sec.ca_path).map_err(|e| anyhow!(e))? {
        roots.add(cert.map_err(|e| anyhow!(e))?).map_err(|e| anyhow!(e))?;
    }
    if roots.is_empty() {
        return Err(anyhow!("no CA certificates found in {}", sec.ca_path));
    }

    let cert_chain = CertificateDer::pem_file_iter(&sec.client_certificate_path)
        .map_err(|e| anyhow!(e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| anyhow!(e))?;
    let key = PrivateKeyDer::from_pem_file(&sec.key_path).map_err(|e| anyhow!(e))?;

    let provider = Arc::new(provider::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12])
        .map_err(|e| anyhow!(e))?
        .with_root_certificates(roots)
        .with_client_auth_cert(cert_chain, key)
        .map_err(|e| anyhow!(format!("bad certs/private key, {}", e)))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_are_construction_errors() {
        let sec = BrokerSecurityConfiguration {
            ca_path: "/nonexistent/ca.pem".into(),
            client_certificate_path: "/nonexistent/client.pem".into(),
            key_path: "/nonexistent/client.key".into(),
            ..Default::default()
        };
        match secure_transport(&sec) {
            Err(ConfigError::SecureTransport(_)) => {}
            other => panic!("expected a SecureTransport error, got {other:?}"),
        }
    }

    #[test]
    fn garbage_pem_is_rejected() {
        let dir = std::env::temp_dir();
        let ca = dir.join("mqttconf-test-not-a-cert.pem");
        std::fs::write(&ca, b"this is not pem material").unwrap();

        let sec = BrokerSecurityConfiguration {
            ca_path: ca.to_string_lossy().into_owned(),
            client_certificate_path: ca.to_string_lossy().into_owned(),
            key_path: ca.to_string_lossy().into_owned(),
            ..Default::default()
        };
        assert!(secure_transport(&sec).is_err());
        std::fs::remove_file(&ca).ok();
    }
}
