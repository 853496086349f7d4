//! One independent HTTP POST per ping.

use super::{Endpoint, Transport, TransportError, TransportStatus};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;

/// HTTP client posting serialized pings.
#[derive(Debug, Clone)]
pub struct RequestClient {
    client: reqwest::Client,
}

impl RequestClient {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sensor-telemetry-streamer/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;
        Ok(Self { client })
    }

    /// POST one ping and return the HTTP status the collector answered with.
    pub async fn post(&self, endpoint: &Endpoint, body: String) -> Result<u16, TransportError> {
        let response = self
            .client
            .post(endpoint.url().clone())
            .header("Content-Type", "application/json; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(response.status().as_u16())
    }
}

/// Outcome of the newest request that has completed so far.
#[derive(Debug)]
struct LatestOutcome {
    /// Send order of the request that produced `status`
    generation: u64,
    status: TransportStatus,
}

/// Request-mode session: each `send` spawns its own POST and never waits for
/// it. The outcome of the most recently sent request that has completed is
/// kept for display; an older request finishing late does not replace it.
pub struct RequestSession {
    client: RequestClient,
    endpoint: Arc<RwLock<Endpoint>>,
    latest: Arc<Mutex<LatestOutcome>>,
    sent: AtomicU64,
    closed: Arc<AtomicBool>,
    runtime: Handle,
}

impl RequestSession {
    pub fn new(endpoint: Endpoint, timeout: Duration, runtime: &Handle) -> Result<Self, TransportError> {
        Ok(Self {
            client: RequestClient::new(timeout)?,
            endpoint: Arc::new(RwLock::new(endpoint)),
            latest: Arc::new(Mutex::new(LatestOutcome {
                generation: 0,
                status: TransportStatus::Idle,
            })),
            sent: AtomicU64::new(0),
            closed: Arc::new(AtomicBool::new(false)),
            runtime: runtime.clone(),
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Transport for RequestSession {
    fn send(&self, frame: String) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            tracing::trace!("Session closed, dropping ping");
            return false;
        }
        let generation = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
        let endpoint = self.endpoint();
        let client = self.client.clone();
        let latest = self.latest.clone();
        let closed = self.closed.clone();

        self.runtime.spawn(async move {
            let outcome = match client.post(&endpoint, frame).await {
                Ok(code) => {
                    if (200..300).contains(&code) {
                        tracing::trace!("Collector answered HTTP {code}");
                    } else {
                        tracing::warn!("Collector at {endpoint} answered HTTP {code}");
                    }
                    TransportStatus::Responded { status: code }
                }
                Err(e) => {
                    tracing::warn!("Request to {endpoint} failed: {e}");
                    TransportStatus::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            if closed.load(Ordering::SeqCst) {
                return;
            }
            let mut latest = latest.lock().unwrap_or_else(|e| e.into_inner());
            if generation > latest.generation {
                latest.generation = generation;
                latest.status = outcome;
            } else {
                tracing::trace!("Request {generation} finished after a newer one");
            }
        });
        true
    }

    fn retarget(&self, endpoint: Endpoint) {
        tracing::info!("Request session now posting to {endpoint}");
        *self.endpoint.write().unwrap_or_else(|e| e.into_inner()) = endpoint;
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.latest.lock().unwrap_or_else(|e| e.into_inner()).status = TransportStatus::Idle;
    }

    fn status(&self) -> TransportStatus {
        self.latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .status
            .clone()
    }
}

/// Blocking request client for the one-shot CLI commands.
pub struct BlockingRequestClient {
    inner: RequestClient,
    runtime: tokio::runtime::Runtime,
}

impl BlockingRequestClient {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| TransportError::Client(format!("Failed to create runtime: {e}")))?;

        Ok(Self {
            inner: RequestClient::new(timeout)?,
            runtime,
        })
    }

    /// POST one ping; a non-success status is returned as an error.
    pub fn send(&self, endpoint: &Endpoint, body: String) -> Result<u16, TransportError> {
        let status = self.runtime.block_on(self.inner.post(endpoint, body))?;
        if !(200..300).contains(&status) {
            return Err(TransportError::Http { status });
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportMode;
    use std::io::{Read, Write};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn request_complete(buf: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(buf);
        let (head, body) = text.split_once("\r\n\r\n")?;
        let length = head
            .lines()
            .find_map(|l| {
                let (name, value) = l.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        (body.len() >= length).then(|| body.to_string())
    }

    fn response(status_line: &str) -> String {
        format!("HTTP/1.1 {status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
    }

    /// Answers every request with `status_line` and reports the bodies.
    async fn responder(
        status_line: &'static str,
    ) -> (std::net::SocketAddr, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    let body = loop {
                        let n = stream.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if let Some(body) = request_complete(&buf) {
                            break body;
                        }
                    };
                    let _ = stream.write_all(response(status_line).as_bytes()).await;
                    let _ = tx.send(body);
                });
            }
        });
        (addr, rx)
    }

    async fn wait_for_status(session: &RequestSession) -> TransportStatus {
        for _ in 0..300 {
            let status = session.status();
            if status != TransportStatus::Idle {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no request completed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_records_server_error_without_retry() {
        let (addr, mut bodies) = responder("500 Internal Server Error").await;
        let endpoint =
            Endpoint::parse(&format!("http://{addr}/submit/KEY"), TransportMode::Request).unwrap();
        let session =
            RequestSession::new(endpoint, Duration::from_secs(5), &Handle::current()).unwrap();

        assert!(session.send(r#"{"seq":1}"#.to_string()));
        assert_eq!(
            wait_for_status(&session).await,
            TransportStatus::Responded { status: 500 }
        );
        assert_eq!(bodies.recv().await.unwrap(), r#"{"seq":1}"#);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(bodies.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connection_refused_is_recorded() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let endpoint =
            Endpoint::parse(&format!("http://{addr}/submit"), TransportMode::Request).unwrap();
        let session =
            RequestSession::new(endpoint, Duration::from_secs(5), &Handle::current()).unwrap();
        session.send("{}".to_string());

        assert!(matches!(
            wait_for_status(&session).await,
            TransportStatus::Failed { .. }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_retarget_and_close() {
        let (addr, mut bodies) = responder("204 No Content").await;
        let session = RequestSession::new(
            Endpoint::parse("http://127.0.0.1:9/old", TransportMode::Request).unwrap(),
            Duration::from_secs(5),
            &Handle::current(),
        )
        .unwrap();

        let target = Endpoint::parse(&format!("http://{addr}/new"), TransportMode::Request).unwrap();
        session.retarget(target.clone());
        assert_eq!(session.endpoint(), target);

        session.send("first".to_string());
        assert_eq!(bodies.recv().await.unwrap(), "first");
        assert_eq!(
            wait_for_status(&session).await,
            TransportStatus::Responded { status: 204 }
        );

        session.close();
        assert!(!session.send("late".to_string()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(bodies.try_recv().is_err());
        assert_eq!(session.status(), TransportStatus::Idle);
    }

    /// Answers "slow" with a delayed 500 and anything else with an
    /// immediate 204.
    async fn delaying_responder() -> (std::net::SocketAddr, tokio::sync::mpsc::UnboundedReceiver<String>)
    {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    let body = loop {
                        let n = stream.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if let Some(body) = request_complete(&buf) {
                            break body;
                        }
                    };
                    let _ = tx.send(body.clone());
                    let status_line = if body == "slow" {
                        tokio::time::sleep(Duration::from_millis(400)).await;
                        "500 Internal Server Error"
                    } else {
                        "204 No Content"
                    };
                    let _ = stream.write_all(response(status_line).as_bytes()).await;
                });
            }
        });
        (addr, rx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_late_answer_does_not_replace_newer_status() {
        let (addr, mut bodies) = delaying_responder().await;
        let endpoint =
            Endpoint::parse(&format!("http://{addr}/submit"), TransportMode::Request).unwrap();
        let session =
            RequestSession::new(endpoint, Duration::from_secs(5), &Handle::current()).unwrap();

        assert!(session.send("slow".to_string()));
        assert_eq!(bodies.recv().await.unwrap(), "slow");
        assert!(session.send("fast".to_string()));
        assert_eq!(bodies.recv().await.unwrap(), "fast");

        assert_eq!(
            wait_for_status(&session).await,
            TransportStatus::Responded { status: 204 }
        );
        // The slow 500 arrives afterwards and must be ignored
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(session.status(), TransportStatus::Responded { status: 204 });
    }

    #[test]
    fn test_blocking_client_reports_http_errors() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            for status_line in ["200 OK", "503 Service Unavailable"] {
                let (mut stream, _) = listener.accept().unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                while request_complete(&buf).is_none() {
                    let n = stream.read(&mut chunk).unwrap();
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                stream.write_all(response(status_line).as_bytes()).unwrap();
            }
        });

        let endpoint =
            Endpoint::parse(&format!("http://{addr}/submit"), TransportMode::Request).unwrap();
        let client = BlockingRequestClient::new(Duration::from_secs(5)).unwrap();
        assert_eq!(client.send(&endpoint, "{}".to_string()).unwrap(), 200);
        assert!(matches!(
            client.send(&endpoint, "{}".to_string()),
            Err(TransportError::Http { status: 503 })
        ));
        server.join().unwrap();
    }
}
