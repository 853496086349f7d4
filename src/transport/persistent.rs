//! Long-lived connection with a receive loop and fixed-backoff reconnects.
//!
//! A single actor task owns the connection. Callers talk to it through
//! channels: pings go through a bounded queue, retargets through a `watch`
//! and close through a `oneshot`. Each connection gets its own reader task
//! and its own failure channel, so a late failure from an old connection can
//! never tear down a newer one.

use super::{BoxFuture, Endpoint, Transport, TransportError, TransportStatus};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Pings queued for the connection before further sends are dropped.
pub const FRAME_QUEUE: usize = 64;

/// Writing half of an established connection.
pub trait FrameSink: Send {
    fn send<'a>(&'a mut self, frame: &'a str) -> BoxFuture<'a, Result<(), TransportError>>;

    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Reading half of an established connection.
pub trait FrameSource: Send {
    /// Next inbound message, `Ok(None)` once the peer has closed.
    fn next_frame(&mut self) -> BoxFuture<'_, Result<Option<String>, TransportError>>;
}

/// Establishes connections for a [`PersistentSession`].
pub trait Connector: Send + Sync {
    /// Whether this connector can ever reach `endpoint`. Checked before a
    /// session is aimed at it.
    fn supports(&self, _endpoint: &Endpoint) -> bool {
        true
    }

    fn connect<'a>(
        &'a self,
        endpoint: &'a Endpoint,
    ) -> BoxFuture<'a, Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError>>;
}

/// Handle to the connection actor.
pub struct PersistentSession {
    frames: mpsc::Sender<String>,
    endpoint: watch::Sender<Endpoint>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    status: Arc<Mutex<TransportStatus>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PersistentSession {
    /// Spawn the actor on `runtime` and start connecting to `endpoint`.
    pub fn open(
        endpoint: Endpoint,
        connector: Arc<dyn Connector>,
        backoff: Duration,
        runtime: &Handle,
    ) -> Self {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE);
        let (endpoint_tx, endpoint_rx) = watch::channel(endpoint);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let status = Arc::new(Mutex::new(TransportStatus::Idle));

        let actor = Actor {
            connector,
            backoff,
            frames: frames_rx,
            endpoint: endpoint_rx,
            shutdown: shutdown_rx,
            status: status.clone(),
            attempt: 0,
        };
        let task = runtime.spawn(actor.run());

        Self {
            frames: frames_tx,
            endpoint: endpoint_tx,
            shutdown: Mutex::new(Some(shutdown_tx)),
            status,
            task: Mutex::new(Some(task)),
        }
    }

    /// Endpoint the session is currently aimed at.
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.borrow().clone()
    }

    /// Whether the actor task has exited.
    pub fn is_finished(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|t| t.is_finished())
            .unwrap_or(true)
    }
}

impl Transport for PersistentSession {
    fn send(&self, frame: String) -> bool {
        if !self.status().is_connected() {
            tracing::trace!("Not connected, dropping ping");
            return false;
        }
        match self.frames.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!("Outbound queue full, dropping ping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!("Session closed, dropping ping");
                false
            }
        }
    }

    fn retarget(&self, endpoint: Endpoint) {
        tracing::info!("Retargeting persistent session to {endpoint}");
        self.endpoint.send_replace(endpoint);
    }

    fn close(&self) {
        let sender = self
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(());
            tracing::info!("Persistent session closed");
        }
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = TransportStatus::Idle;
    }

    fn status(&self) -> TransportStatus {
        if self
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
        {
            return TransportStatus::Idle;
        }
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Drop for PersistentSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Why the actor left a phase.
enum Exit {
    /// Close requested, or the session handle is gone
    Shutdown,
    /// A new endpoint was set; connect to it right away
    Retarget,
    /// The connection failed; wait out the backoff
    Failed(TransportError),
}

struct Actor {
    connector: Arc<dyn Connector>,
    backoff: Duration,
    frames: mpsc::Receiver<String>,
    endpoint: watch::Receiver<Endpoint>,
    shutdown: oneshot::Receiver<()>,
    status: Arc<Mutex<TransportStatus>>,
    attempt: u32,
}

impl Actor {
    async fn run(mut self) {
        loop {
            let endpoint = self.endpoint.borrow_and_update().clone();
            let exit = match self.connect(&endpoint).await {
                Ok((sink, source)) => {
                    self.attempt = 0;
                    tracing::info!("Connected to {endpoint}");
                    self.set_status(TransportStatus::Connected {
                        endpoint: endpoint.to_string(),
                    });
                    self.stream(sink, source).await
                }
                Err(exit) => exit,
            };

            match exit {
                Exit::Shutdown => break,
                Exit::Retarget => continue,
                Exit::Failed(e) => {
                    tracing::warn!(
                        "Connection to {endpoint} failed: {e}; retrying in {:?}",
                        self.backoff
                    );
                    self.set_status(TransportStatus::Failed {
                        reason: e.to_string(),
                    });
                    match self.wait_backoff().await {
                        Exit::Shutdown => break,
                        _ => continue,
                    }
                }
            }
        }
        tracing::debug!("Persistent session actor stopped");
    }

    async fn connect(
        &mut self,
        endpoint: &Endpoint,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), Exit> {
        self.attempt += 1;
        self.set_status(TransportStatus::Connecting {
            endpoint: endpoint.to_string(),
            attempt: self.attempt,
        });
        tracing::debug!("Connecting to {endpoint} (attempt {})", self.attempt);

        let connector = self.connector.clone();
        let mut connecting = connector.connect(endpoint);
        loop {
            tokio::select! {
                _ = &mut self.shutdown => return Err(Exit::Shutdown),
                changed = self.endpoint.changed() => {
                    return Err(if changed.is_ok() { Exit::Retarget } else { Exit::Shutdown });
                }
                frame = self.frames.recv() => {
                    if frame.is_none() {
                        return Err(Exit::Shutdown);
                    }
                    tracing::trace!("Not connected, dropping ping");
                }
                result = &mut connecting => return result.map_err(Exit::Failed),
            }
        }
    }

    async fn stream(&mut self, mut sink: Box<dyn FrameSink>, source: Box<dyn FrameSource>) -> Exit {
        let (failed_tx, mut failed_rx) = oneshot::channel();
        let reader = tokio::spawn(read_loop(source, failed_tx));

        let exit = loop {
            tokio::select! {
                biased;
                _ = &mut self.shutdown => break Exit::Shutdown,
                changed = self.endpoint.changed() => {
                    break if changed.is_ok() { Exit::Retarget } else { Exit::Shutdown };
                }
                failure = &mut failed_rx => {
                    break Exit::Failed(failure.unwrap_or(TransportError::Closed));
                }
                frame = self.frames.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = sink.send(&frame).await {
                            break Exit::Failed(e);
                        }
                    }
                    None => break Exit::Shutdown,
                },
            }
        };

        reader.abort();
        if !matches!(exit, Exit::Failed(_)) {
            sink.close().await;
        }
        exit
    }

    async fn wait_backoff(&mut self) -> Exit {
        let delay = tokio::time::sleep(self.backoff);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut self.shutdown => return Exit::Shutdown,
                changed = self.endpoint.changed() => {
                    return if changed.is_ok() { Exit::Retarget } else { Exit::Shutdown };
                }
                frame = self.frames.recv() => {
                    if frame.is_none() {
                        return Exit::Shutdown;
                    }
                    tracing::trace!("Waiting to reconnect, dropping ping");
                }
                _ = &mut delay => return Exit::Retarget,
            }
        }
    }

    fn set_status(&self, status: TransportStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }
}

async fn read_loop(mut source: Box<dyn FrameSource>, failed: oneshot::Sender<TransportError>) {
    let error = loop {
        match source.next_frame().await {
            Ok(Some(message)) => tracing::debug!("Received from collector: {message}"),
            Ok(None) => break TransportError::Closed,
            Err(e) => break e,
        }
    };
    let _ = failed.send(error);
}
