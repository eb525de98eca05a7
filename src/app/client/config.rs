//! HTTP client configuration and building logic
//!
//! This module handles the configuration and construction of the reqwest
//! client used for transfers.

use std::path::PathBuf;
use std::time::Duration;

use reqwest::{redirect, Client};
use serde::{Deserialize, Serialize};

use super::tls::CertificateAllowList;
use crate::constants::http;
use crate::errors::{AppError, Result};

/// Configuration for the transfer HTTP client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// TCP keep-alive settings
    pub tcp_keepalive: Option<Duration>,
    /// TCP nodelay (disable Nagle's algorithm)
    pub tcp_nodelay: bool,
    /// Connection pool idle timeout
    pub pool_idle_timeout: Option<Duration>,
    /// Connect timeout; there is no overall request timeout
    pub connect_timeout: Duration,
    /// User agent sent with every request
    pub user_agent: String,
    /// Redirect hops followed before the transfer fails
    pub max_redirects: usize,
    /// Self-signed certificates (PEM) accepted for TLS
    pub accepted_certificates: Vec<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tcp_keepalive: Some(http::TCP_KEEPALIVE),
            tcp_nodelay: true,
            pool_idle_timeout: Some(http::POOL_IDLE_TIMEOUT),
            connect_timeout: http::CONNECT_TIMEOUT,
            user_agent: http::USER_AGENT.to_string(),
            max_redirects: http::MAX_REDIRECTS,
            accepted_certificates: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Builds the HTTP client with the specified configuration
    ///
    /// Automatic redirects are disabled; the engine follows them itself.
    pub fn build_http_client(&self) -> Result<Client> {
        let allow_list = CertificateAllowList::load(&self.accepted_certificates)?;

        let mut client_builder = Client::builder()
            .redirect(redirect::Policy::none())
            .connect_timeout(self.connect_timeout)
            .user_agent(self.user_agent.as_str())
            .tcp_nodelay(self.tcp_nodelay);

        // Configure TCP keep-alive if specified
        if let Some(keepalive) = self.tcp_keepalive {
            client_builder = client_builder.tcp_keepalive(keepalive);
        }

        // Configure connection pool idle timeout
        if let Some(idle_timeout) = self.pool_idle_timeout {
            client_builder = client_builder.pool_idle_timeout(idle_timeout);
        }

        client_builder = allow_list.apply(client_builder);

        client_builder
            .build()
            .map_err(|e| AppError::generic(format!("Failed to build HTTP client: {}", e)))
    }
}
