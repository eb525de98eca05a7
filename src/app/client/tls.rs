//! Accepted self-signed certificates and TLS failure detection
//!
//! Certificates the operator chose to trust are installed as extra root
//! certificates, so handshakes against them succeed. Any TLS failure that
//! still reaches the engine did not match the allow-list and is fatal.

use std::error::Error as StdError;
use std::path::{Path, PathBuf};

use reqwest::{Certificate, ClientBuilder};
use tracing::{debug, info};

use crate::errors::ConfigError;

/// PEM certificates trusted in addition to the system roots
#[derive(Debug, Default, Clone)]
pub struct CertificateAllowList {
    certificates: Vec<Certificate>,
    sources: Vec<PathBuf>,
}

impl CertificateAllowList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every PEM file in `paths`
    pub fn load(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut list = Self::new();
        for path in paths {
            list.add_pem_file(path)?;
        }
        Ok(list)
    }

    pub fn add_pem_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let pem = std::fs::read(path).map_err(|e| ConfigError::InvalidValue {
            field: "client.accepted_certificates".to_string(),
            value: path.display().to_string(),
            reason: e.to_string(),
        })?;
        self.add_pem(&pem, path)
    }

    pub fn add_pem(&mut self, pem: &[u8], source: &Path) -> Result<(), ConfigError> {
        let certificate = Certificate::from_pem(pem).map_err(|e| ConfigError::InvalidValue {
            field: "client.accepted_certificates".to_string(),
            value: source.display().to_string(),
            reason: e.to_string(),
        })?;
        debug!("Accepted certificate from {}", source.display());
        self.certificates.push(certificate);
        self.sources.push(source.to_path_buf());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    /// Install the accepted certificates on a client builder
    pub fn apply(&self, mut builder: ClientBuilder) -> ClientBuilder {
        for certificate in &self.certificates {
            builder = builder.add_root_certificate(certificate.clone());
        }
        if !self.is_empty() {
            info!("Trusting {} accepted certificate(s)", self.len());
        }
        builder
    }
}

/// True when the error chain points at a TLS or certificate problem
pub fn is_tls_error(error: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(err) = current {
        let text = err.to_string().to_ascii_lowercase();
        if ["certificate", "tls", "ssl", "handshake"]
            .iter()
            .any(|needle| text.contains(needle))
        {
            return true;
        }
        current = err.source();
    }
    false
}
