//! Streaming HTTP transport with byte-rate throttling
//!
//! Each connection runs as its own task: it sends one GET, reports the
//! response headers, streams the body chunk by chunk back to the manager
//! loop and ends with `Finished`, `Redirect` or `Failed`. Throttling is a
//! governor limiter measured in bytes; throttle changes arrive over a watch
//! channel and apply from the next chunk on.

use std::fmt;
use std::io::ErrorKind;
use std::num::NonZeroU32;

use futures::StreamExt;
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use reqwest::header::{CONTENT_DISPOSITION, LOCATION};
use reqwest::{Client, Response, StatusCode};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use super::config::ClientConfig;
use super::request::TransferRequest;
use super::tls::is_tls_error;
use crate::app::engine::{ConnectionSink, NetworkEvent};
use crate::errors::{AuthKind, NetworkErrorCode, Result, TransferError};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Capability to open HTTP exchanges
///
/// The returned task reports through the sink; aborting it closes the
/// connection.
pub trait HttpTransport: Send + Sync + fmt::Debug {
    fn open(&self, request: TransferRequest, sink: ConnectionSink) -> JoinHandle<()>;
}

/// Transport backed by a shared reqwest client
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Ok(Self::new(config.build_http_client()?))
    }
}

impl HttpTransport for ReqwestTransport {
    fn open(&self, request: TransferRequest, sink: ConnectionSink) -> JoinHandle<()> {
        let client = self.client.clone();
        tokio::spawn(run_connection(client, request, sink))
    }
}

async fn run_connection(client: Client, request: TransferRequest, sink: ConnectionSink) {
    let connection = sink.connection();
    let headers = match request.header_map() {
        Ok(headers) => headers,
        Err(e) => {
            sink.send(NetworkEvent::Failed(e)).await;
            return;
        }
    };

    let response = match client.get(request.url.clone()).headers(headers).send().await {
        Ok(response) => response,
        Err(e) => {
            warn!("Connection {} to {} failed: {}", connection, request.url, e);
            sink.send(NetworkEvent::Failed(classify_error(&e))).await;
            return;
        }
    };

    let status = response.status();
    debug!("Connection {} got HTTP {} from {}", connection, status, request.url);

    if status.is_redirection() {
        if let Some(target) = redirect_target(&request.url, &response) {
            sink.send(NetworkEvent::Redirect(target)).await;
            return;
        }
    }
    if let Some(error) = status_error(status) {
        sink.send(NetworkEvent::Failed(error)).await;
        return;
    }

    let content_disposition = response
        .headers()
        .get(CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let headers_event = NetworkEvent::Headers {
        status: status.as_u16(),
        content_length: response.content_length(),
        content_disposition,
        partial: status == StatusCode::PARTIAL_CONTENT,
    };
    if !sink.send(headers_event).await {
        return;
    }

    let mut throttle = Throttle::new(sink.throttle());
    let mut stream = response.bytes_stream();
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => {
                throttle.acquire(chunk.len()).await;
                if !sink.send(NetworkEvent::Data(chunk)).await {
                    return;
                }
            }
            Err(e) => {
                warn!("Connection {} body error: {}", connection, e);
                sink.send(NetworkEvent::Failed(classify_error(&e))).await;
                return;
            }
        }
    }

    sink.send(NetworkEvent::Finished).await;
}

/// Absolute redirect target, if the response carries a usable one
fn redirect_target(base: &Url, response: &Response) -> Option<Url> {
    let location = response.headers().get(LOCATION)?.to_str().ok()?;
    base.join(location).ok()
}

/// Error for a non-success final status
fn status_error(status: StatusCode) -> Option<TransferError> {
    let reason = status.canonical_reason().unwrap_or("").to_string();
    match status {
        StatusCode::UNAUTHORIZED => Some(TransferError::Auth {
            kind: AuthKind::Server,
            message: reason,
        }),
        StatusCode::PROXY_AUTHENTICATION_REQUIRED => Some(TransferError::Auth {
            kind: AuthKind::Proxy,
            message: reason,
        }),
        status if status.as_u16() >= 300 => Some(TransferError::Http {
            status: status.as_u16(),
            reason,
        }),
        _ => None,
    }
}

/// Map a reqwest failure onto the network error taxonomy
///
/// Typed causes decide first: the `std::io::Error` kind found in the source
/// chain, then reqwest's own predicates. Message text is only consulted for
/// TLS and name resolution failures, which reach us as opaque errors.
pub fn classify_error(error: &reqwest::Error) -> TransferError {
    let message = error_chain(error);
    let code = match io_error_code(error) {
        Some(code) => code,
        None if error.is_timeout() => NetworkErrorCode::Timeout,
        None if is_tls_error(error) => NetworkErrorCode::Tls,
        None if error.is_connect() => {
            let lower = message.to_ascii_lowercase();
            if lower.contains("dns") || lower.contains("resolve") || lower.contains("lookup") {
                NetworkErrorCode::HostNotFound
            } else {
                NetworkErrorCode::ConnectionRefused
            }
        }
        None if error.is_body() || error.is_decode() => NetworkErrorCode::RemoteClosed,
        None => NetworkErrorCode::Unknown,
    };
    TransferError::network(code, message)
}

/// Network code for the first I/O error in the chain with a telling kind
fn io_error_code(error: &(dyn std::error::Error + 'static)) -> Option<NetworkErrorCode> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(err) = current {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            match io.kind() {
                ErrorKind::ConnectionRefused => return Some(NetworkErrorCode::ConnectionRefused),
                ErrorKind::TimedOut => return Some(NetworkErrorCode::Timeout),
                ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::UnexpectedEof => return Some(NetworkErrorCode::RemoteClosed),
                _ => {}
            }
        }
        current = err.source();
    }
    None
}

fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = error.source();
    while let Some(err) = source {
        parts.push(err.to_string());
        source = err.source();
    }
    parts.join(": ")
}

/// Byte-rate limiter following a watch channel
struct Throttle {
    rx: watch::Receiver<u64>,
    rate: u64,
    limiter: Option<DirectLimiter>,
}

impl Throttle {
    fn new(rx: watch::Receiver<u64>) -> Self {
        let rate = *rx.borrow();
        Self {
            rx,
            rate,
            limiter: build_limiter(rate),
        }
    }

    /// Wait until `bytes` may pass
    async fn acquire(&mut self, bytes: usize) {
        if self.rx.has_changed().unwrap_or(false) {
            let rate = *self.rx.borrow_and_update();
            if rate != self.rate {
                debug!("Throttle changed from {} to {} B/s", self.rate, rate);
                self.rate = rate;
                self.limiter = build_limiter(rate);
            }
        }
        let Some(limiter) = &self.limiter else {
            return;
        };

        // A single request may not exceed the burst size
        let burst = self.rate.min(u32::MAX as u64);
        let mut remaining = bytes as u64;
        while remaining > 0 {
            let piece = remaining.min(burst);
            if let Some(n) = NonZeroU32::new(piece as u32) {
                if limiter.until_n_ready(n).await.is_err() {
                    return;
                }
            }
            remaining -= piece;
        }
    }
}

fn build_limiter(bytes_per_sec: u64) -> Option<DirectLimiter> {
    let rate = u32::try_from(bytes_per_sec).unwrap_or(u32::MAX);
    NonZeroU32::new(rate).map(|rate| RateLimiter::direct(Quota::per_second(rate)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use httpmock::prelude::*;
    use tokio::sync::mpsc;

    use super::*;
    use crate::app::engine::{Engine, EngineMessage};
    use crate::app::transfer::{Headers, TransferId};

    async fn collect_events(rx: &mut mpsc::Receiver<EngineMessage>) -> Vec<NetworkEvent> {
        let mut events = Vec::new();
        while let Some(message) = rx.recv().await {
            if let EngineMessage::Network { event, .. } = message {
                let last = matches!(
                    event,
                    NetworkEvent::Finished | NetworkEvent::Failed(_) | NetworkEvent::Redirect(_)
                );
                events.push(event);
                if last {
                    break;
                }
            }
        }
        events
    }

    fn engine() -> (Engine, mpsc::Receiver<EngineMessage>) {
        let transport = ReqwestTransport::from_config(&ClientConfig::default()).unwrap();
        Engine::new(Arc::new(transport))
    }

    fn body_of(events: &[NetworkEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|event| match event {
                NetworkEvent::Data(chunk) => Some(chunk.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[tokio::test]
    async fn test_fresh_get_has_identity_encoding_and_no_range() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/file.bin")
                    .header("accept-encoding", "identity")
                    .header("x-client", "yes")
                    .header_missing("range");
                then.status(200)
                    .header("content-disposition", "attachment; filename=\"named.bin\"")
                    .body("hello world");
            })
            .await;

        let (engine, mut rx) = engine();
        let mut headers = Headers::new();
        headers.insert("Range".to_string(), "bytes=5-".to_string());
        headers.insert("X-Client".to_string(), "yes".to_string());
        let url = Url::parse(&server.url("/file.bin")).unwrap();
        let _connection = engine.open(TransferId::new(), TransferRequest::new(url, headers), 0);

        let events = collect_events(&mut rx).await;
        mock.assert_async().await;

        match &events[0] {
            NetworkEvent::Headers {
                status,
                content_length,
                content_disposition,
                partial,
            } => {
                assert_eq!(*status, 200);
                assert_eq!(*content_length, Some(11));
                assert_eq!(
                    content_disposition.as_deref(),
                    Some("attachment; filename=\"named.bin\"")
                );
                assert!(!partial);
            }
            other => panic!("unexpected first event {:?}", other),
        }
        assert_eq!(body_of(&events), b"hello world");
        assert!(matches!(events.last(), Some(NetworkEvent::Finished)));
    }

    #[tokio::test]
    async fn test_resume_sends_range_header() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/file.bin").header("range", "bytes=6-");
                then.status(206).body("world");
            })
            .await;

        let (engine, mut rx) = engine();
        let url = Url::parse(&server.url("/file.bin")).unwrap();
        let request = TransferRequest::new(url, Headers::new()).with_range(6);
        let _connection = engine.open(TransferId::new(), request, 0);

        let events = collect_events(&mut rx).await;
        mock.assert_async().await;
        assert!(matches!(
            events[0],
            NetworkEvent::Headers { partial: true, .. }
        ));
        assert_eq!(body_of(&events), b"world");
    }

    #[tokio::test]
    async fn test_redirect_is_reported_not_followed() {
        let server = MockServer::start_async().await;
        let redirect = server
            .mock_async(|when, then| {
                when.method(GET).path("/old");
                then.status(302).header("location", "/new");
            })
            .await;

        let (engine, mut rx) = engine();
        let url = Url::parse(&server.url("/old")).unwrap();
        let _connection = engine.open(TransferId::new(), TransferRequest::new(url, Headers::new()), 0);

        let events = collect_events(&mut rx).await;
        redirect.assert_async().await;
        match &events[..] {
            [NetworkEvent::Redirect(target)] => assert_eq!(target.path(), "/new"),
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_status_errors_are_classified() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/missing");
                then.status(404);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/private");
                then.status(401);
            })
            .await;

        let (engine, mut rx) = engine();
        let missing = Url::parse(&server.url("/missing")).unwrap();
        let _a = engine.open(TransferId::new(), TransferRequest::new(missing, Headers::new()), 0);
        let events = collect_events(&mut rx).await;
        assert!(matches!(
            &events[..],
            [NetworkEvent::Failed(TransferError::Http { status: 404, .. })]
        ));

        let private = Url::parse(&server.url("/private")).unwrap();
        let _b = engine.open(TransferId::new(), TransferRequest::new(private, Headers::new()), 0);
        let events = collect_events(&mut rx).await;
        assert!(matches!(
            &events[..],
            [NetworkEvent::Failed(TransferError::Auth {
                kind: AuthKind::Server,
                ..
            })]
        ));
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        // Bind then drop a listener to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let (engine, mut rx) = engine();
        let url = Url::parse(&format!("http://127.0.0.1:{}/file", port)).unwrap();
        let _connection = engine.open(TransferId::new(), TransferRequest::new(url, Headers::new()), 0);

        let events = collect_events(&mut rx).await;
        assert!(matches!(
            &events[..],
            [NetworkEvent::Failed(TransferError::Network {
                code: NetworkErrorCode::ConnectionRefused,
                ..
            })]
        ));
    }

    #[derive(Debug)]
    struct Wrapped(std::io::Error);

    impl fmt::Display for Wrapped {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("error sending request")
        }
    }

    impl std::error::Error for Wrapped {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_io_kind_in_chain_decides_code() {
        let wrap = |kind| Wrapped(std::io::Error::new(kind, "opaque"));
        assert_eq!(
            io_error_code(&wrap(ErrorKind::ConnectionRefused)),
            Some(NetworkErrorCode::ConnectionRefused)
        );
        assert_eq!(
            io_error_code(&wrap(ErrorKind::TimedOut)),
            Some(NetworkErrorCode::Timeout)
        );
        assert_eq!(
            io_error_code(&wrap(ErrorKind::ConnectionReset)),
            Some(NetworkErrorCode::RemoteClosed)
        );
        // Message text never decides the kind
        let misleading = Wrapped(std::io::Error::new(ErrorKind::Other, "connection refused"));
        assert_eq!(io_error_code(&misleading), None);
    }

    #[tokio::test]
    async fn test_throttle_limits_rate() {
        let (_tx, rx) = watch::channel(1_000u64);
        let mut throttle = Throttle::new(rx);

        let started = Instant::now();
        // First burst is free, the second waits for half the bucket to refill
        throttle.acquire(1_000).await;
        throttle.acquire(500).await;
        assert!(started.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_throttle_zero_is_unlimited_and_follows_updates() {
        let (tx, rx) = watch::channel(0u64);
        let mut throttle = Throttle::new(rx);
        assert!(throttle.limiter.is_none());
        throttle.acquire(10_000_000).await;

        tx.send(2_048).unwrap();
        throttle.acquire(1).await;
        assert_eq!(throttle.rate, 2_048);
        assert!(throttle.limiter.is_some());
    }

    #[test]
    fn test_status_error_mapping() {
        assert!(status_error(StatusCode::OK).is_none());
        assert!(status_error(StatusCode::PARTIAL_CONTENT).is_none());
        assert!(matches!(
            status_error(StatusCode::PROXY_AUTHENTICATION_REQUIRED),
            Some(TransferError::Auth {
                kind: AuthKind::Proxy,
                ..
            })
        ));
        assert!(matches!(
            status_error(StatusCode::SERVICE_UNAVAILABLE),
            Some(TransferError::Http { status: 503, .. })
        ));
    }
}
