use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::health::HealthMetrics;
use crate::model::registry::SchemaRegistry;

use super::wire::{decode, read_frame, RemoteMessage};
use super::RoleRegistry;

/// Accepts peer connections and hands each received record to the local
/// receiver of its role.
pub struct RemoteServer {
    listen_addr: String,
    compression: String,
    roles: Arc<RoleRegistry>,
    schemas: Arc<SchemaRegistry>,
    health: Option<Arc<HealthMetrics>>,
    run_task: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl RemoteServer {
    pub fn new(
        listen_addr: &str,
        compression: &str,
        roles: Arc<RoleRegistry>,
        schemas: Arc<SchemaRegistry>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            listen_addr: listen_addr.to_string(),
            compression: compression.to_string(),
            roles,
            schemas,
            health,
            run_task: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Binds the listener and spawns the accept loop. Returns the bound
    /// address.
    pub async fn start(&self, ctx: CancellationToken) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .with_context(|| format!("binding remote listener on {}", self.listen_addr))?;
        let local_addr = listener.local_addr().context("reading listener address")?;

        let receiver = Arc::new(Receiver {
            compression: self.compression.clone(),
            roles: Arc::clone(&self.roles),
            schemas: Arc::clone(&self.schemas),
            health: self.health.clone(),
        });

        let run_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "peer connected");
                            tokio::spawn(Arc::clone(&receiver).serve(stream, peer, ctx.clone()));
                        }
                        Err(e) => warn!(error = %e, "accepting peer connection failed"),
                    },
                }
            }
        });
        *self.run_task.lock().await = Some(run_task);

        info!(addr = %local_addr, compression = %self.compression, "remote server listening");

        Ok(local_addr)
    }

    pub async fn wait_for_shutdown(&self) {
        if let Some(handle) = self.run_task.lock().await.take() {
            let _ = handle.await;
        }
    }
}

struct Receiver {
    compression: String,
    roles: Arc<RoleRegistry>,
    schemas: Arc<SchemaRegistry>,
    health: Option<Arc<HealthMetrics>>,
}

impl Receiver {
    async fn serve(self: Arc<Self>, stream: TcpStream, peer: SocketAddr, ctx: CancellationToken) {
        let mut reader = BufReader::new(stream);
        loop {
            let frame = tokio::select! {
                _ = ctx.cancelled() => return,
                frame = read_frame(&mut reader) => frame,
            };
            match frame {
                Ok(Some(payload)) => self.handle(&payload),
                Ok(None) => {
                    debug!(peer = %peer, "peer disconnected");
                    return;
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "closing peer connection after read failure");
                    return;
                }
            }
        }
    }

    fn handle(&self, payload: &[u8]) {
        let message = match decode(payload, &self.compression) {
            Ok(message) => message,
            Err(e) => {
                self.reject("unknown", &e);
                return;
            }
        };
        let role = message.role.clone();
        if let Err(e) = self.deliver(message) {
            self.reject(&role, &e);
        }
    }

    fn deliver(&self, message: RemoteMessage) -> Result<(), PipelineError> {
        let entry = self
            .roles
            .get(&message.role)
            .ok_or_else(|| PipelineError::UnknownRole {
                role: message.role.clone(),
            })?;
        let role = message.role.clone();
        let record = message.into_record(&self.schemas)?;
        entry.receiver().enqueue(record)?;

        if let Some(h) = &self.health {
            h.remote_received.with_label_values(&[&role]).inc();
        }
        Ok(())
    }

    fn reject(&self, role: &str, err: &PipelineError) {
        warn!(role, error = %err, "dropping received message");
        if let Some(h) = &self.health {
            h.remote_failures
                .with_label_values(&[role, err.kind()])
                .inc();
        }
    }
}
