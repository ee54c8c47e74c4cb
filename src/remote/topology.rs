use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arc_swap::ArcSwap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::health::HealthMetrics;

/// Ordered list of cluster nodes, replaced atomically.
///
/// Readers take a snapshot without locking. Every node sorts the list the
/// same way so selectors agree on owners.
pub struct ClusterTopology {
    self_addr: String,
    nodes: ArcSwap<Vec<String>>,
    health: Option<Arc<HealthMetrics>>,
}

impl ClusterTopology {
    pub fn new(self_addr: impl Into<String>, health: Option<Arc<HealthMetrics>>) -> Self {
        let self_addr = self_addr.into();
        let topology = Self {
            nodes: ArcSwap::from_pointee(Vec::new()),
            self_addr: self_addr.clone(),
            health,
        };
        topology.update(vec![self_addr]);
        topology
    }

    pub fn self_addr(&self) -> &str {
        &self.self_addr
    }

    pub fn snapshot(&self) -> Arc<Vec<String>> {
        self.nodes.load_full()
    }

    /// Installs a new node list. Returns true when it differs from the
    /// current one.
    pub fn update(&self, mut nodes: Vec<String>) -> bool {
        nodes.sort();
        nodes.dedup();

        if **self.nodes.load() == nodes {
            return false;
        }

        if let Some(h) = &self.health {
            h.topology_size.set(nodes.len() as f64);
        }
        info!(nodes = ?nodes, "cluster topology changed");
        self.nodes.store(Arc::new(nodes));
        true
    }

    pub fn is_self(&self, addr: &str) -> bool {
        addr == self.self_addr
    }

    /// True when this node heads the ordered list.
    pub fn is_first(&self) -> bool {
        self.nodes
            .load()
            .first()
            .is_some_and(|first| self.is_self(first))
    }
}

/// Source of the current node list.
pub trait TopologyProvider: Send + Sync + 'static {
    fn current_topology(&self) -> impl Future<Output = Result<Vec<String>>> + Send;
}

/// Provider backed by the configured peer list.
pub struct StaticTopology {
    peers: Vec<String>,
}

impl StaticTopology {
    pub fn new(peers: Vec<String>) -> Self {
        Self { peers }
    }
}

impl TopologyProvider for StaticTopology {
    async fn current_topology(&self) -> Result<Vec<String>> {
        Ok(self.peers.clone())
    }
}

/// Polls `provider` every `interval` and installs what it returns.
///
/// The first poll runs immediately.
pub fn spawn_watch<P: TopologyProvider>(
    provider: P,
    topology: Arc<ClusterTopology>,
    interval: Duration,
    ctx: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = ticker.tick() => {
                    match provider.current_topology().await {
                        Ok(nodes) if nodes.is_empty() => {
                            warn!("topology provider returned no nodes, keeping current list");
                        }
                        Ok(nodes) => {
                            topology.update(nodes);
                        }
                        Err(e) => warn!(error = %e, "refreshing cluster topology failed"),
                    }
                }
            }
        }
    })
}
