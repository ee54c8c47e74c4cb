use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::health::HealthMetrics;

use super::wire::{encode, write_frame, RemoteMessage};

/// Outbound channel to one peer.
///
/// Messages go through a bounded queue to a task that owns the connection.
/// The connection is opened on first use and reopened after a failure; the
/// message that hit the failure is dropped.
pub struct PeerClient {
    target: Arc<str>,
    tx: mpsc::Sender<RemoteMessage>,
    health: Option<Arc<HealthMetrics>>,
}

/// Settings shared by every peer client.
#[derive(Debug, Clone)]
pub struct PeerSettings {
    pub queue_size: usize,
    pub connect_timeout: Duration,
    pub compression: String,
}

impl PeerClient {
    pub fn spawn(
        target: &str,
        settings: PeerSettings,
        health: Option<Arc<HealthMetrics>>,
        ctx: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_size.max(1));
        let target: Arc<str> = Arc::from(target);

        let sender = Sender {
            target: Arc::clone(&target),
            settings,
            health: health.clone(),
            conn: None,
        };
        tokio::spawn(sender.run(rx, ctx));

        Self { target, tx, health }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Queues `message` without waiting.
    pub fn send(&self, message: RemoteMessage) -> Result<(), PipelineError> {
        self.tx.try_send(message).map_err(|e| {
            let (role, reason) = match e {
                TrySendError::Full(m) => (m.role, "peer queue full"),
                TrySendError::Closed(m) => (m.role, "peer channel closed"),
            };
            if let Some(h) = &self.health {
                h.remote_failures.with_label_values(&[&role, "queue"]).inc();
            }
            PipelineError::RemoteDispatchFailure {
                role,
                target: self.target.to_string(),
                reason: reason.to_string(),
            }
        })
    }
}

struct Sender {
    target: Arc<str>,
    settings: PeerSettings,
    health: Option<Arc<HealthMetrics>>,
    conn: Option<BufWriter<TcpStream>>,
}

impl Sender {
    async fn run(mut self, mut rx: mpsc::Receiver<RemoteMessage>, ctx: CancellationToken) {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    // Deliver what was already accepted before closing.
                    while let Ok(message) = rx.try_recv() {
                        self.deliver(message).await;
                    }
                    self.flush().await;
                    break;
                }
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    self.deliver(message).await;

                    // Batch whatever else is queued before flushing the socket.
                    while let Ok(message) = rx.try_recv() {
                        self.deliver(message).await;
                    }
                    self.flush().await;
                }
            }
        }

        if let Some(mut conn) = self.conn.take() {
            let _ = conn.shutdown().await;
        }
        debug!(target = %self.target, "peer client stopped");
    }

    async fn deliver(&mut self, message: RemoteMessage) {
        let payload = match encode(&message, &self.settings.compression) {
            Ok(payload) => payload,
            Err(e) => {
                self.fail(&message.role, "codec", e.to_string());
                return;
            }
        };

        let conn = match self.connection().await {
            Ok(conn) => conn,
            Err(reason) => {
                self.fail(&message.role, "connect", reason);
                return;
            }
        };

        if let Err(e) = write_frame(conn, &payload).await {
            self.conn = None;
            self.fail(&message.role, "write", e.to_string());
        }
    }

    async fn flush(&mut self) {
        if let Some(conn) = &mut self.conn {
            if let Err(e) = conn.flush().await {
                warn!(target = %self.target, error = %e, "flushing peer connection failed");
                self.conn = None;
            }
        }
    }

    async fn connection(&mut self) -> Result<&mut BufWriter<TcpStream>, String> {
        if self.conn.is_none() {
            let stream = tokio::time::timeout(
                self.settings.connect_timeout,
                TcpStream::connect(&*self.target),
            )
            .await
            .map_err(|_| format!("connect timed out after {:?}", self.settings.connect_timeout))?
            .map_err(|e| e.to_string())?;
            let _ = stream.set_nodelay(true);
            info!(target = %self.target, "connected to peer");
            self.conn = Some(BufWriter::new(stream));
        }
        self.conn
            .as_mut()
            .ok_or_else(|| "connection unavailable".to_string())
    }

    fn fail(&self, role: &str, stage: &str, reason: String) {
        let err = PipelineError::RemoteDispatchFailure {
            role: role.to_string(),
            target: self.target.to_string(),
            reason,
        };
        warn!(role, target = %self.target, error = %err, "dropping remote message");
        if let Some(h) = &self.health {
            h.remote_failures.with_label_values(&[role, stage]).inc();
        }
    }
}
