use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::analysis::SpanEvent;
use crate::graph::Graph;
use crate::health::HealthMetrics;

/// HTTP endpoint accepting span batches from agents.
///
/// `POST /v1/spans` takes a JSON array of spans and starts the span graph
/// once per span. The handler returns as soon as every span is handed to
/// the graph.
pub struct SpanReceiver {
    addr: String,
    graph: Arc<Graph<SpanEvent>>,
    health: Option<Arc<HealthMetrics>>,
    shutdown: Mutex<Option<CancellationToken>>,
}

struct ReceiverState {
    graph: Arc<Graph<SpanEvent>>,
    health: Option<Arc<HealthMetrics>>,
}

impl SpanReceiver {
    pub fn new(addr: &str, graph: Arc<Graph<SpanEvent>>, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            addr: addr.to_string(),
            graph,
            health,
            shutdown: Mutex::new(None),
        }
    }

    /// Binds and serves in the background. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        // ":port" shorthand binds every interface.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let state = Arc::new(ReceiverState {
            graph: Arc::clone(&self.graph),
            health: self.health.clone(),
        });
        let app = Router::new()
            .route("/v1/spans", post(spans_handler))
            .with_state(state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "span receiver started");
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "span receiver error");
            }
        });

        Ok(local_addr)
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
        Ok(())
    }
}

/// POST /v1/spans - JSON array of spans.
async fn spans_handler(State(state): State<Arc<ReceiverState>>, body: Bytes) -> impl IntoResponse {
    let spans: Vec<SpanEvent> = match serde_json::from_slice(&body) {
        Ok(spans) => spans,
        Err(e) => {
            tracing::warn!(error = %e, bytes = body.len(), "rejecting malformed span batch");
            if let Some(h) = &state.health {
                h.spans_rejected.inc();
            }
            return (StatusCode::BAD_REQUEST, format!("invalid span batch: {e}"));
        }
    };

    let count = spans.len();
    for span in spans {
        state.graph.start(span);
    }
    if let Some(h) = &state.health {
        h.spans_received.inc_by(count as f64);
    }

    (StatusCode::ACCEPTED, format!("{{\"accepted\":{count}}}"))
}
