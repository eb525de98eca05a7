//! HTTP side of the transfer engine
//!
//! The module is organized into specialized components:
//! - `config`: HTTP client configuration and building
//! - `request`: outgoing request headers, URL checks and response header parsing
//! - `http`: the streaming transport and its byte-rate throttle
//! - `redirect`: bounded redirect tracking with cycle detection
//! - `tls`: accepted self-signed certificates and TLS failure detection

pub mod config;
pub mod http;
pub mod redirect;
pub mod request;
pub mod tls;

pub use config::ClientConfig;
pub use http::{HttpTransport, ReqwestTransport};
pub use redirect::RedirectTracker;
pub use request::{content_disposition_filename, parse_download_url, TransferRequest};
pub use tls::CertificateAllowList;
