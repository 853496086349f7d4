//! Transport sessions shipping serialized pings to the collector.
//!
//! Two interchangeable modes sit behind the [`Transport`] trait:
//! - [`persistent::PersistentSession`]: one long-lived connection with a
//!   receive loop and fixed-backoff reconnects
//! - [`request::RequestSession`]: one independent request per ping
//!
//! Neither ever blocks the caller waiting for the collector.

pub mod persistent;
pub mod request;
pub mod tcp;

use crate::config::TransportMode;
use reqwest::Url;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

pub use persistent::{Connector, FrameSink, FrameSource, PersistentSession};
pub use request::{BlockingRequestClient, RequestSession};
pub use tcp::TcpConnector;

/// Boxed future used at the dyn-compatible transport seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A validated collector URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: Url,
}

impl Endpoint {
    /// Parse and check that the scheme fits the transport mode.
    pub fn parse(raw: &str, mode: TransportMode) -> Result<Self, TransportError> {
        let url = Url::parse(raw.trim())
            .map_err(|e| TransportError::InvalidEndpoint(format!("'{}': {e}", raw.trim())))?;
        if url.host_str().map(str::is_empty).unwrap_or(true) {
            return Err(TransportError::InvalidEndpoint(format!(
                "'{url}' has no host"
            )));
        }
        if !mode.schemes().contains(&url.scheme()) {
            return Err(TransportError::UnsupportedScheme {
                scheme: url.scheme().to_string(),
                mode,
            });
        }
        Ok(Self { url })
    }

    /// Parse `base` with `/segment` appended.
    pub fn with_segment(
        base: &str,
        segment: &str,
        mode: TransportMode,
    ) -> Result<Self, TransportError> {
        let joined = crate::config::join_segment(base, segment)
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
        Self::parse(&joined, mode)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> Option<u16> {
        self.url.port_or_known_default()
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Transport error types.
#[derive(Debug, Clone)]
pub enum TransportError {
    InvalidEndpoint(String),
    UnsupportedScheme { scheme: String, mode: TransportMode },
    Connect(String),
    Send(String),
    Receive(String),
    /// The peer closed the connection
    Closed,
    /// The collector answered with a non-success status
    Http { status: u16 },
    Network(String),
    Client(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::InvalidEndpoint(msg) => write!(f, "Invalid endpoint {msg}"),
            TransportError::UnsupportedScheme { scheme, mode } => {
                write!(f, "Scheme '{scheme}' is not usable in {mode} mode")
            }
            TransportError::Connect(msg) => write!(f, "Connect failed: {msg}"),
            TransportError::Send(msg) => write!(f, "Send failed: {msg}"),
            TransportError::Receive(msg) => write!(f, "Receive failed: {msg}"),
            TransportError::Closed => write!(f, "Connection closed by peer"),
            TransportError::Http { status } => write!(f, "Collector returned HTTP {status}"),
            TransportError::Network(msg) => write!(f, "Network error: {msg}"),
            TransportError::Client(msg) => write!(f, "HTTP client error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Latest transport outcome, for display.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportStatus {
    /// No session open
    Idle,
    /// Establishing, or waiting out the backoff before re-establishing
    Connecting { endpoint: String, attempt: u32 },
    Connected { endpoint: String },
    /// A request completed with this HTTP status
    Responded { status: u16 },
    Failed { reason: String },
}

impl TransportStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, TransportStatus::Connected { .. })
    }
}

impl std::fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportStatus::Idle => write!(f, "Idle"),
            TransportStatus::Connecting { endpoint, attempt } => {
                write!(f, "Connecting to {endpoint} (attempt {attempt})")
            }
            TransportStatus::Connected { endpoint } => write!(f, "Streaming to {endpoint}"),
            TransportStatus::Responded { status } => write!(f, "Last response: HTTP {status}"),
            TransportStatus::Failed { reason } => write!(f, "Error: {reason}"),
        }
    }
}

/// An open transport session.
pub trait Transport: Send + Sync {
    /// Hand one serialized ping over for delivery. Never blocks on the
    /// network. Returns `false` when the ping was dropped instead of queued.
    fn send(&self, frame: String) -> bool;

    /// Point subsequent sends at a new endpoint.
    fn retarget(&self, endpoint: Endpoint);

    /// Release the session and cancel any pending reconnect.
    fn close(&self);

    fn status(&self) -> TransportStatus;
}

/// Opens transport sessions when streaming starts.
pub trait TransportFactory: Send + Sync {
    /// Reject endpoints the sessions this factory opens could never reach.
    fn check(&self, _endpoint: &Endpoint) -> Result<(), TransportError> {
        Ok(())
    }

    fn open(&self, endpoint: Endpoint, runtime: &Handle) -> Arc<dyn Transport>;
}

/// Opens the session matching the configured mode.
pub struct DefaultTransportFactory {
    mode: TransportMode,
    connector: Arc<dyn Connector>,
    reconnect_backoff: Duration,
    request_timeout: Duration,
}

impl DefaultTransportFactory {
    pub fn new(mode: TransportMode, reconnect_backoff: Duration, request_timeout: Duration) -> Self {
        Self {
            mode,
            connector: Arc::new(TcpConnector::new()),
            reconnect_backoff,
            request_timeout,
        }
    }

    /// Use a different persistent-connection primitive.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn check(&self, endpoint: &Endpoint) -> Result<(), TransportError> {
        if !self.mode.schemes().contains(&endpoint.url().scheme()) {
            return Err(TransportError::UnsupportedScheme {
                scheme: endpoint.url().scheme().to_string(),
                mode: self.mode,
            });
        }
        if self.mode == TransportMode::Persistent && !self.connector.supports(endpoint) {
            return Err(TransportError::InvalidEndpoint(format!(
                "'{endpoint}' cannot be served by the configured connector \
                 (the built-in one needs tcp://host:port)"
            )));
        }
        Ok(())
    }

    fn open(&self, endpoint: Endpoint, runtime: &Handle) -> Arc<dyn Transport> {
        match self.mode {
            TransportMode::Persistent => Arc::new(PersistentSession::open(
                endpoint,
                self.connector.clone(),
                self.reconnect_backoff,
                runtime,
            )),
            TransportMode::Request => {
                match RequestSession::new(endpoint, self.request_timeout, runtime) {
                    Ok(session) => Arc::new(session),
                    Err(e) => {
                        tracing::error!("Could not create HTTP client: {e}");
                        Arc::new(FailedTransport::new(e))
                    }
                }
            }
        }
    }
}

/// Placeholder session when a transport could not be built at all.
struct FailedTransport {
    reason: String,
}

impl FailedTransport {
    fn new(error: TransportError) -> Self {
        Self {
            reason: error.to_string(),
        }
    }
}

impl Transport for FailedTransport {
    fn send(&self, _frame: String) -> bool {
        false
    }

    fn retarget(&self, _endpoint: Endpoint) {}

    fn close(&self) {}

    fn status(&self) -> TransportStatus {
        TransportStatus::Failed {
            reason: self.reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_schemes() {
        assert!(Endpoint::parse("tcp://127.0.0.1:7878/x", TransportMode::Persistent).is_ok());
        assert!(Endpoint::parse("wss://collector.example/a", TransportMode::Persistent).is_ok());
        assert!(Endpoint::parse("https://collector.example/a", TransportMode::Request).is_ok());

        assert!(matches!(
            Endpoint::parse("https://collector.example", TransportMode::Persistent),
            Err(TransportError::UnsupportedScheme { .. })
        ));
        assert!(matches!(
            Endpoint::parse("not a url", TransportMode::Request),
            Err(TransportError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_endpoint_with_segment() {
        let endpoint =
            Endpoint::with_segment("http://h:8080/submit/", "KEY", TransportMode::Request).unwrap();
        assert_eq!(endpoint.as_str(), "http://h:8080/submit/KEY");

        assert!(Endpoint::with_segment("http://h/", "  ", TransportMode::Request).is_err());
    }

    #[test]
    fn test_endpoint_ports() {
        let wss = Endpoint::parse("wss://collector.example/a", TransportMode::Persistent).unwrap();
        assert_eq!(wss.port(), Some(443));
        assert_eq!(wss.host(), "collector.example");

        let tcp = Endpoint::parse("tcp://10.0.0.2/a", TransportMode::Persistent).unwrap();
        assert_eq!(tcp.port(), None);
    }

    /// Connector claiming to reach any endpoint.
    struct AnyConnector;

    impl Connector for AnyConnector {
        fn connect<'a>(
            &'a self,
            _endpoint: &'a Endpoint,
        ) -> BoxFuture<'a, Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError>>
        {
            Box::pin(async { Err(TransportError::Connect("unreachable".to_string())) })
        }
    }

    #[test]
    fn test_factory_rejects_unreachable_endpoints() {
        let factory = DefaultTransportFactory::new(
            TransportMode::Persistent,
            Duration::from_secs(2),
            Duration::from_secs(10),
        );
        let persistent = |raw: &str| Endpoint::parse(raw, TransportMode::Persistent).unwrap();

        assert!(factory.check(&persistent("tcp://127.0.0.1:7878/t")).is_ok());
        assert!(matches!(
            factory.check(&persistent("wss://collector.example/telemetry")),
            Err(TransportError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            factory.check(&persistent("tcp://collector.example/telemetry")),
            Err(TransportError::InvalidEndpoint(_))
        ));

        let custom = factory.with_connector(Arc::new(AnyConnector));
        assert!(custom.check(&persistent("wss://collector.example/telemetry")).is_ok());

        let request = DefaultTransportFactory::new(
            TransportMode::Request,
            Duration::from_secs(2),
            Duration::from_secs(10),
        );
        assert!(request
            .check(&Endpoint::parse("https://collector.example/x", TransportMode::Request).unwrap())
            .is_ok());
        assert!(matches!(
            request.check(&persistent("tcp://127.0.0.1:7878/t")),
            Err(TransportError::UnsupportedScheme { .. })
        ));
    }

    #[test]
    fn test_status_display() {
        let status = TransportStatus::Connected {
            endpoint: "tcp://h:1/".to_string(),
        };
        assert!(status.is_connected());
        assert_eq!(status.to_string(), "Streaming to tcp://h:1/");
        assert_eq!(
            TransportStatus::Responded { status: 204 }.to_string(),
            "Last response: HTTP 204"
        );
    }
}
