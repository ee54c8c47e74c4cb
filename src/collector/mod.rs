use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::analysis::{self, SpanEvent, SpanTransformStage};
use crate::config::{Config, StorageConfig, StorageEngine};
use crate::graph::bridge::BridgeStage;
use crate::graph::{Graph, GraphManager};
use crate::health::HealthMetrics;
use crate::model::registry::SchemaRegistry;
use crate::model::Record;
use crate::receiver::SpanReceiver;
use crate::remote::client::PeerSettings;
use crate::remote::selector::Selector;
use crate::remote::server::RemoteServer;
use crate::remote::topology::{spawn_watch, ClusterTopology, StaticTopology};
use crate::remote::{RemoteDispatcher, RemoteStage, RoleRegistry};
use crate::retention::RetentionKeeper;
use crate::storage::batch::BatchGateway;
use crate::storage::clickhouse::ClickHouseStorage;
use crate::storage::elasticsearch::ElasticsearchStorage;
use crate::storage::memory::MemoryStorage;
use crate::storage::Storage;
use crate::worker::aggregation::AggregationWorker;
use crate::worker::persistence::PersistenceWorker;

const SPAN_GRAPH_ID: u32 = 0;
const METRIC_GRAPH_BASE: u32 = 100;

/// Collector wires the pipeline together: span receiver, analysis graphs,
/// workers, cluster routing, storage, retention and health.
///
/// Shutdown runs in stages so every upstream component flushes into a
/// downstream one that is still running.
pub struct Collector {
    cfg: Config,
    health: Arc<HealthMetrics>,
    storage: Option<Arc<Storage>>,
    gateway: Option<Arc<BatchGateway>>,
    span_graph: Option<Arc<Graph<SpanEvent>>>,
    receiver: Option<SpanReceiver>,
    receiver_addr: Option<SocketAddr>,
    remote_server: Option<RemoteServer>,
    remote_addr: Option<SocketAddr>,
    aggregation: Vec<AggregationWorker>,
    persistence: Vec<PersistenceWorker>,
    retention: Option<RetentionKeeper>,
    topology_watch: Option<JoinHandle<()>>,
    ingest_cancel: CancellationToken,
    routing_cancel: CancellationToken,
    persist_cancel: CancellationToken,
    storage_cancel: CancellationToken,
}

impl Collector {
    /// Creates a new Collector, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            storage: None,
            gateway: None,
            span_graph: None,
            receiver: None,
            receiver_addr: None,
            remote_server: None,
            remote_addr: None,
            aggregation: Vec::new(),
            persistence: Vec::new(),
            retention: None,
            topology_watch: None,
            ingest_cancel: CancellationToken::new(),
            routing_cancel: CancellationToken::new(),
            persist_cancel: CancellationToken::new(),
            storage_cancel: CancellationToken::new(),
        })
    }

    /// Uses `storage` instead of building one from the configured engine.
    pub fn with_storage(mut self, storage: Storage) -> Self {
        self.storage = Some(Arc::new(storage));
        self
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Entry graph for span events; set once started.
    pub fn span_graph(&self) -> Option<&Arc<Graph<SpanEvent>>> {
        self.span_graph.as_ref()
    }

    /// Bound address of the span receiver, when enabled.
    pub fn receiver_addr(&self) -> Option<SocketAddr> {
        self.receiver_addr
    }

    /// Bound address of the peer listener.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Start all components and begin accepting spans.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Health server first so health checks answer during startup.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Schemas.
        let mut registry = SchemaRegistry::new();
        analysis::register_schemas(&mut registry).context("registering schemas")?;
        let schemas = Arc::new(registry);
        let granularities = self.cfg.analysis.granularities.clone();

        // 2. Storage and batch gateway.
        let storage = match &self.storage {
            Some(storage) => Arc::clone(storage),
            None => Arc::new(build_storage(&self.cfg.storage, &self.health)?),
        };
        storage
            .start(&schemas.schemas(), &granularities)
            .await
            .with_context(|| format!("starting {} storage", storage.name()))?;
        info!(engine = storage.name(), "storage ready");

        let mut gateway = BatchGateway::new(
            Arc::clone(&storage),
            self.cfg.storage.batch.clone(),
            Some(Arc::clone(&self.health)),
        );
        gateway.start(self.storage_cancel.child_token()).await;
        let gateway = Arc::new(gateway);

        // 3. Cluster topology.
        let topology = Arc::new(ClusterTopology::new(
            self.cfg.node.advertise_addr.clone(),
            Some(Arc::clone(&self.health)),
        ));
        topology.update(self.cfg.peer_addresses());
        self.topology_watch = Some(spawn_watch(
            StaticTopology::new(self.cfg.peer_addresses()),
            Arc::clone(&topology),
            self.cfg.cluster.refresh_interval,
            self.ingest_cancel.child_token(),
        ));

        // 4. Persistence workers, one per metric, owned by hash of id.
        let mut roles = RoleRegistry::new();
        for schema in schemas.schemas() {
            let role = persistence_role(schema.name());
            let mut worker = PersistenceWorker::new(
                &role,
                self.cfg.workers.for_role(&role),
                Arc::clone(&gateway),
                Some(Arc::clone(&self.health)),
            );
            roles.register(Selector::HashCode, worker.handle())?;
            worker.start(self.persist_cancel.child_token()).await;
            self.persistence.push(worker);
        }
        let roles = Arc::new(roles);

        // 5. Peer listener and dispatcher.
        let server = RemoteServer::new(
            &self.cfg.remote.listen_addr,
            &self.cfg.remote.compression,
            Arc::clone(&roles),
            Arc::clone(&schemas),
            Some(Arc::clone(&self.health)),
        );
        self.remote_addr = Some(
            server
                .start(self.persist_cancel.child_token())
                .await
                .context("starting remote server")?,
        );
        self.remote_server = Some(server);

        let dispatcher = Arc::new(RemoteDispatcher::new(
            Arc::clone(&topology),
            roles,
            PeerSettings {
                queue_size: self.cfg.remote.queue_size,
                connect_timeout: self.cfg.remote.connect_timeout,
                compression: self.cfg.remote.compression.clone(),
            },
            Some(Arc::clone(&self.health)),
            self.routing_cancel.child_token(),
        ));

        // 6. Graphs: span graph -> transform -> bridge -> metric graph ->
        // aggregation -> remote dispatch.
        let graphs = GraphManager::new(Some(Arc::clone(&self.health)));
        let span_graph = graphs.create_if_absent::<SpanEvent>(SPAN_GRAPH_ID);

        for (name, dimension) in analysis::METRICS {
            let schema = schemas
                .by_name(name)
                .with_context(|| format!("schema {name} not registered"))?;
            let metric_graph =
                graphs.create_if_absent::<Record>(METRIC_GRAPH_BASE + schema.id().0);

            let agg_role = aggregation_role(name);
            let mut aggregation = AggregationWorker::new(
                &agg_role,
                self.cfg.workers.for_role(&agg_role),
                Some(Arc::clone(&self.health)),
            );
            let agg_node = metric_graph.add_node(aggregation.stage());
            agg_node.add_next(RemoteStage::new(
                &persistence_role(name),
                Arc::clone(&dispatcher),
            ));
            aggregation
                .start(agg_node.next(), self.ingest_cancel.child_token())
                .await;
            self.aggregation.push(aggregation);

            span_graph
                .add_node(SpanTransformStage::new(
                    Arc::clone(schema),
                    dimension,
                    &granularities,
                ))
                .add_next(BridgeStage::new(metric_graph));
        }
        info!(graphs = graphs.len(), "analysis graphs built");

        // 7. Retention.
        let retention = RetentionKeeper::new(
            self.cfg.retention.clone(),
            Arc::clone(&storage),
            &schemas.schemas(),
            &granularities,
            Arc::clone(&topology),
            Some(Arc::clone(&self.health)),
        );
        retention.start(self.ingest_cancel.child_token()).await;
        self.retention = Some(retention);

        // 8. Span receiver last, once everything downstream runs.
        if self.cfg.receiver.enabled {
            let receiver = SpanReceiver::new(
                &self.cfg.receiver.addr,
                Arc::clone(&span_graph),
                Some(Arc::clone(&self.health)),
            );
            self.receiver_addr = Some(receiver.start().await.context("starting span receiver")?);
            self.receiver = Some(receiver);
        }

        self.span_graph = Some(span_graph);
        self.storage = Some(storage);
        self.gateway = Some(gateway);

        info!(
            node = %self.cfg.node.id,
            advertise_addr = %self.cfg.node.advertise_addr,
            nodes = topology.snapshot().len(),
            "collector fully started"
        );

        Ok(())
    }

    /// Gracefully stop all components, flushing buffered aggregates.
    pub async fn stop(&mut self) -> Result<()> {
        // Stop intake.
        if let Some(receiver) = &self.receiver {
            if let Err(e) = receiver.stop().await {
                error!(error = %e, "error stopping span receiver");
            }
        }

        // Aggregation workers flush their last window into dispatch.
        self.ingest_cancel.cancel();
        for worker in &self.aggregation {
            worker.wait_for_shutdown().await;
        }
        if let Some(retention) = &self.retention {
            retention.wait_for_shutdown().await;
        }
        if let Some(watch) = self.topology_watch.take() {
            let _ = watch.await;
        }

        // Peer clients drain what they accepted.
        self.routing_cancel.cancel();

        // Persistence workers write their last batch.
        self.persist_cancel.cancel();
        for worker in &self.persistence {
            worker.wait_for_shutdown().await;
        }
        if let Some(server) = &self.remote_server {
            server.wait_for_shutdown().await;
        }

        // Gateway drains buffered writes.
        self.storage_cancel.cancel();
        if let Some(gateway) = &self.gateway {
            gateway.wait_for_shutdown().await;
        }
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.stop().await {
                error!(error = %e, "error stopping storage");
            }
        }

        self.health.stop().await?;

        info!("collector stopped");

        Ok(())
    }
}

fn aggregation_role(metric: &str) -> String {
    format!("{metric}_aggregation")
}

fn persistence_role(metric: &str) -> String {
    format!("{metric}_persistence")
}

fn build_storage(cfg: &StorageConfig, health: &Arc<HealthMetrics>) -> Result<Storage> {
    let storage = match cfg.engine {
        StorageEngine::Memory => Storage::Memory(MemoryStorage::new()),
        StorageEngine::ClickHouse => Storage::ClickHouse(ClickHouseStorage::new(
            cfg.clickhouse.clone(),
            Some(Arc::clone(health)),
        )),
        StorageEngine::Elasticsearch => Storage::Elasticsearch(
            ElasticsearchStorage::new(cfg.elasticsearch.clone(), Some(Arc::clone(health)))
                .context("creating elasticsearch client")?,
        ),
    };
    Ok(storage)
}
