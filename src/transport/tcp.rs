//! Newline-delimited pings over a plain TCP stream.

use super::{BoxFuture, Connector, Endpoint, FrameSink, FrameSource, TransportError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Default limit for establishing a connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects to `tcp://host:port` endpoints. Every ping is written as one
/// line; every line the collector writes back is an inbound message.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for TcpConnector {
    fn supports(&self, endpoint: &Endpoint) -> bool {
        endpoint.url().scheme() == "tcp" && endpoint.port().is_some()
    }

    fn connect<'a>(
        &'a self,
        endpoint: &'a Endpoint,
    ) -> BoxFuture<'a, Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError>> {
        Box::pin(async move {
            if endpoint.url().scheme() != "tcp" {
                return Err(TransportError::Connect(format!(
                    "no built-in connector for '{}' endpoints",
                    endpoint.url().scheme()
                )));
            }
            let port = endpoint.port().ok_or_else(|| {
                TransportError::Connect(format!("{endpoint} does not name a port"))
            })?;
            let host = endpoint
                .host()
                .trim_start_matches('[')
                .trim_end_matches(']');

            let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
                .await
                .map_err(|_| TransportError::Connect(format!("timed out connecting to {endpoint}")))?
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            let _ = stream.set_nodelay(true);

            let (read, write) = stream.into_split();
            let sink: Box<dyn FrameSink> = Box::new(TcpSink { write });
            let source: Box<dyn FrameSource> = Box::new(TcpSource {
                lines: BufReader::new(read).lines(),
            });
            Ok((sink, source))
        })
    }
}

struct TcpSink {
    write: OwnedWriteHalf,
}

impl FrameSink for TcpSink {
    fn send<'a>(&'a mut self, frame: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let mut line = String::with_capacity(frame.len() + 1);
            line.push_str(frame);
            line.push('\n');
            self.write
                .write_all(line.as_bytes())
                .await
                .map_err(|e| TransportError::Send(e.to_string()))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let _ = self.write.shutdown().await;
        })
    }
}

struct TcpSource {
    lines: Lines<BufReader<OwnedReadHalf>>,
}

impl FrameSource for TcpSource {
    fn next_frame(&mut self) -> BoxFuture<'_, Result<Option<String>, TransportError>> {
        Box::pin(async move {
            self.lines
                .next_line()
                .await
                .map_err(|e| TransportError::Receive(e.to_string()))
        })
    }
}
