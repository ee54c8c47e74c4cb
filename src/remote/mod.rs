//! Cluster routing: decides which node owns a key and delivers the record
//! there, in-process or over TCP.

pub mod client;
pub mod selector;
pub mod server;
pub mod topology;
pub mod wire;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::graph::{Next, Stage};
use crate::health::HealthMetrics;
use crate::model::Record;
use crate::worker::WorkerHandle;

use self::client::{PeerClient, PeerSettings};
use self::selector::Selector;
use self::topology::ClusterTopology;
use self::wire::RemoteMessage;

/// Routing rule and local endpoint of one role.
pub struct RoleEntry {
    selector: Selector,
    receiver: WorkerHandle<Record>,
}

impl RoleEntry {
    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn receiver(&self) -> &WorkerHandle<Record> {
        &self.receiver
    }
}

/// Role name to selector and local receiver. Built once at startup.
#[derive(Default)]
pub struct RoleRegistry {
    roles: HashMap<String, RoleEntry>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, selector: Selector, receiver: WorkerHandle<Record>) -> Result<()> {
        let role = receiver.role().to_string();
        if self.roles.contains_key(&role) {
            bail!("role {role} registered twice");
        }
        self.roles.insert(role, RoleEntry { selector, receiver });
        Ok(())
    }

    pub fn get(&self, role: &str) -> Option<&RoleEntry> {
        self.roles.get(role)
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

/// Where a dispatched record went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Local,
    Remote(String),
}

/// Routes records to the node that owns their id.
pub struct RemoteDispatcher {
    topology: Arc<ClusterTopology>,
    roles: Arc<RoleRegistry>,
    peers: DashMap<String, PeerClient>,
    settings: PeerSettings,
    health: Option<Arc<HealthMetrics>>,
    ctx: CancellationToken,
}

impl RemoteDispatcher {
    /// Peer clients are spawned lazily and stop when `ctx` is cancelled.
    pub fn new(
        topology: Arc<ClusterTopology>,
        roles: Arc<RoleRegistry>,
        settings: PeerSettings,
        health: Option<Arc<HealthMetrics>>,
        ctx: CancellationToken,
    ) -> Self {
        Self {
            topology,
            roles,
            peers: DashMap::new(),
            settings,
            health,
            ctx,
        }
    }

    pub fn topology(&self) -> &Arc<ClusterTopology> {
        &self.topology
    }

    /// Hands `record` to the owner of its id for `role`.
    ///
    /// Local delivery enqueues into the role's worker. Remote delivery only
    /// queues the message for the peer's sender task; transport failures are
    /// logged there and the message is lost.
    pub fn dispatch(&self, role: &str, record: Record) -> Result<Destination, PipelineError> {
        let entry = self.roles.get(role).ok_or_else(|| PipelineError::UnknownRole {
            role: role.to_string(),
        })?;

        let nodes = self.topology.snapshot();
        let target = entry
            .selector
            .select(record.id(), &nodes)
            .filter(|t| !self.topology.is_self(t));

        let Some(target) = target else {
            entry.receiver.enqueue(record)?;
            self.count(role, "local");
            return Ok(Destination::Local);
        };

        let message = RemoteMessage::from_record(role, &record);
        self.peer(target).send(message)?;
        self.count(role, "remote");
        Ok(Destination::Remote(target.clone()))
    }

    fn peer(&self, target: &str) -> dashmap::mapref::one::Ref<'_, String, PeerClient> {
        if let Some(peer) = self.peers.get(target) {
            return peer;
        }
        self.peers
            .entry(target.to_string())
            .or_insert_with(|| {
                PeerClient::spawn(
                    target,
                    self.settings.clone(),
                    self.health.clone(),
                    self.ctx.child_token(),
                )
            })
            .downgrade()
    }

    fn count(&self, role: &str, destination: &str) {
        if let Some(h) = &self.health {
            h.remote_dispatch
                .with_label_values(&[role, destination])
                .inc();
        }
    }
}

/// Terminal graph stage routing each record through the dispatcher.
pub struct RemoteStage {
    name: String,
    role: String,
    dispatcher: Arc<RemoteDispatcher>,
}

impl RemoteStage {
    pub fn new(role: &str, dispatcher: Arc<RemoteDispatcher>) -> Self {
        Self {
            name: format!("remote-{role}"),
            role: role.to_string(),
            dispatcher,
        }
    }
}

impl Stage for RemoteStage {
    type Input = Record;
    type Output = ();

    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, input: Record, _next: &Next<()>) -> Result<()> {
        self.dispatcher.dispatch(&self.role, input)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::WorkerConfig;
    use crate::worker::tests::calls;
    use crate::worker::QueuedWorker;

    fn settings() -> PeerSettings {
        PeerSettings {
            queue_size: 16,
            connect_timeout: Duration::from_millis(200),
            compression: "none".into(),
        }
    }

    fn worker(role: &str) -> QueuedWorker<Record> {
        QueuedWorker::new(role, WorkerConfig::default(), None)
    }

    #[test]
    fn test_registry_rejects_duplicate_role() {
        let w = worker("persist");
        let mut roles = RoleRegistry::new();
        roles.register(Selector::HashCode, w.handle()).expect("first");
        assert!(roles.register(Selector::HashCode, w.handle()).is_err());
        assert_eq!(roles.len(), 1);
    }

    #[tokio::test]
    async fn test_single_node_dispatches_locally() {
        let w = worker("persist");
        let mut roles = RoleRegistry::new();
        roles.register(Selector::HashCode, w.handle()).expect("register");
        let topology = Arc::new(ClusterTopology::new("127.0.0.1:11800", None));
        let dispatcher = RemoteDispatcher::new(
            topology,
            Arc::new(roles),
            settings(),
            None,
            CancellationToken::new(),
        );

        for i in 0..10 {
            let dest = dispatcher
                .dispatch("persist", calls(&format!("id-{i}"), 1))
                .expect("dispatch");
            assert_eq!(dest, Destination::Local);
        }
    }

    #[tokio::test]
    async fn test_unknown_role() {
        let topology = Arc::new(ClusterTopology::new("a:1", None));
        let dispatcher = RemoteDispatcher::new(
            topology,
            Arc::new(RoleRegistry::new()),
            settings(),
            None,
            CancellationToken::new(),
        );
        let err = dispatcher.dispatch("nope", calls("a", 1)).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownRole { .. }));
    }

    #[tokio::test]
    async fn test_forever_first_routes_to_head_node() {
        let w = worker("single");
        let mut roles = RoleRegistry::new();
        roles.register(Selector::ForeverFirst, w.handle()).expect("register");
        let topology = Arc::new(ClusterTopology::new("b:1", None));
        topology.update(vec!["a:1".into(), "b:1".into()]);
        let ctx = CancellationToken::new();
        let dispatcher = RemoteDispatcher::new(topology, Arc::new(roles), settings(), None, ctx.clone());

        let dest = dispatcher.dispatch("single", calls("x", 1)).expect("dispatch");
        assert_eq!(dest, Destination::Remote("a:1".into()));
        ctx.cancel();
    }

    #[tokio::test]
    async fn test_hash_code_splits_between_nodes() {
        let w = worker("persist");
        let mut roles = RoleRegistry::new();
        roles.register(Selector::HashCode, w.handle()).expect("register");
        let topology = Arc::new(ClusterTopology::new("a:1", None));
        topology.update(vec!["a:1".into(), "b:1".into()]);
        let ctx = CancellationToken::new();
        let dispatcher = RemoteDispatcher::new(
            Arc::clone(&topology),
            Arc::new(roles),
            PeerSettings {
                queue_size: 1024,
                ..settings()
            },
            None,
            ctx.clone(),
        );

        let nodes = topology.snapshot();
        for i in 0..100 {
            let id = format!("2024010110_svc-{i}");
            let owner = Selector::HashCode.select(&id, &nodes).expect("owner").clone();
            let dest = dispatcher.dispatch("persist", calls(&id, 1)).expect("dispatch");
            if owner == "a:1" {
                assert_eq!(dest, Destination::Local);
            } else {
                assert_eq!(dest, Destination::Remote(owner));
            }
        }
        ctx.cancel();
    }
}
