pub mod bridge;

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::warn;

use crate::health::HealthMetrics;

/// One processing step inside a graph.
///
/// A stage either produces output synchronously through `next`, or hands the
/// input to a worker that emits later through the same handle.
pub trait Stage: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Clone + Send + 'static;

    /// Stable name, used as the node id in logs and metrics.
    fn name(&self) -> &str;

    /// Handles one value.
    fn process(&self, input: Self::Input, next: &Next<Self::Output>) -> Result<()>;
}

/// Type-erased entry point of a node accepting `T`.
pub trait NodeInput<T>: Send + Sync {
    fn node_id(&self) -> &str;
    fn input(&self, value: T) -> Result<()>;
}

/// Ordered set of downstream nodes sharing one output value.
///
/// Cheap to clone; clones share the same downstream list.
pub struct Next<T> {
    nodes: Arc<ArcSwap<Vec<Arc<dyn NodeInput<T>>>>>,
    health: Option<Arc<HealthMetrics>>,
}

impl<T> Clone for Next<T> {
    fn clone(&self) -> Self {
        Self {
            nodes: Arc::clone(&self.nodes),
            health: self.health.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Next<T> {
    pub fn new(health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            nodes: Arc::new(ArcSwap::from_pointee(Vec::new())),
            health,
        }
    }

    /// Appends a downstream node.
    pub fn push(&self, node: Arc<dyn NodeInput<T>>) {
        self.nodes.rcu(|current| {
            let mut nodes = Vec::with_capacity(current.len() + 1);
            nodes.extend(current.iter().cloned());
            nodes.push(Arc::clone(&node));
            nodes
        });
    }

    pub fn len(&self) -> usize {
        self.nodes.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.load().is_empty()
    }

    /// Delivers `value` to every downstream node in registration order.
    ///
    /// A failing node is logged and counted; the remaining nodes still run.
    pub fn execute(&self, value: T) {
        let nodes = self.nodes.load();
        let Some((last, rest)) = nodes.split_last() else {
            return;
        };
        for node in rest {
            self.deliver(node.as_ref(), value.clone());
        }
        self.deliver(last.as_ref(), value);
    }

    fn deliver(&self, node: &dyn NodeInput<T>, value: T) {
        if let Err(e) = node.input(value) {
            warn!(node = node.node_id(), error = %e, "stage failed");
            if let Some(health) = &self.health {
                health
                    .graph_stage_errors
                    .with_label_values(&[node.node_id()])
                    .inc();
            }
        }
    }
}

/// A stage plus its downstream list.
pub struct Node<S: Stage> {
    stage: S,
    next: Next<S::Output>,
}

impl<S: Stage> Node<S> {
    fn new(stage: S, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            stage,
            next: Next::new(health),
        }
    }

    pub fn id(&self) -> &str {
        self.stage.name()
    }

    pub fn stage(&self) -> &S {
        &self.stage
    }

    /// Handle through which this node's output reaches its downstream nodes.
    pub fn next(&self) -> Next<S::Output> {
        self.next.clone()
    }

    /// Attaches a downstream stage and returns its node for further chaining.
    pub fn add_next<N>(&self, stage: N) -> Arc<Node<N>>
    where
        N: Stage<Input = S::Output>,
    {
        let node = Arc::new(Node::new(stage, self.next.health.clone()));
        self.next.push(Arc::clone(&node) as Arc<dyn NodeInput<S::Output>>);
        node
    }

    /// Attaches an already-built node, e.g. one shared by several parents.
    pub fn add_next_node(&self, node: Arc<dyn NodeInput<S::Output>>) {
        self.next.push(node);
    }
}

impl<S: Stage> NodeInput<S::Input> for Node<S> {
    fn node_id(&self) -> &str {
        self.stage.name()
    }

    fn input(&self, value: S::Input) -> Result<()> {
        self.stage.process(value, &self.next)
    }
}

/// Named, typed DAG of stages.
pub struct Graph<T> {
    id: u32,
    entries: Next<T>,
}

impl<T: Clone + Send + 'static> Graph<T> {
    fn new(id: u32, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            id,
            entries: Next::new(health),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Registers an entry stage.
    pub fn add_node<S>(&self, stage: S) -> Arc<Node<S>>
    where
        S: Stage<Input = T>,
    {
        let node = Arc::new(Node::new(stage, self.entries.health.clone()));
        self.entries.push(Arc::clone(&node) as Arc<dyn NodeInput<T>>);
        node
    }

    /// Pushes a value into every entry node. Stage failures never reach the
    /// caller.
    pub fn start(&self, value: T) {
        self.entries.execute(value);
    }
}

/// Registry of graphs keyed by `(graph id, value type)`.
///
/// Created once at startup and passed to whatever builds or bridges graphs.
pub struct GraphManager {
    graphs: Mutex<HashMap<(u32, TypeId), Arc<dyn Any + Send + Sync>>>,
    health: Option<Arc<HealthMetrics>>,
}

impl GraphManager {
    pub fn new(health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            graphs: Mutex::new(HashMap::new()),
            health,
        }
    }

    /// Returns the graph registered under `graph_id` for `T`, creating it on
    /// first use.
    pub fn create_if_absent<T>(&self, graph_id: u32) -> Arc<Graph<T>>
    where
        T: Clone + Send + 'static,
    {
        let mut graphs = self.graphs.lock();
        let entry = graphs
            .entry((graph_id, TypeId::of::<T>()))
            .or_insert_with(|| Arc::new(Graph::<T>::new(graph_id, self.health.clone())));
        Arc::clone(entry)
            .downcast::<Graph<T>>()
            .expect("graph registry is keyed by value type")
    }

    /// Looks up an existing graph.
    pub fn find_graph<T>(&self, graph_id: u32) -> Option<Arc<Graph<T>>>
    where
        T: Clone + Send + 'static,
    {
        let graphs = self.graphs.lock();
        let entry = graphs.get(&(graph_id, TypeId::of::<T>()))?;
        Arc::clone(entry).downcast::<Graph<T>>().ok()
    }

    pub fn len(&self) -> usize {
        self.graphs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.lock().is_empty()
    }
}

/// Stage backed by a closure returning zero or more outputs.
pub struct FnStage<I, O, F> {
    name: String,
    f: F,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O, F> FnStage<I, O, F>
where
    F: Fn(I) -> Result<Vec<O>>,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
            _types: PhantomData,
        }
    }
}

impl<I, O, F> Stage for FnStage<I, O, F>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
    F: Fn(I) -> Result<Vec<O>> + Send + Sync + 'static,
{
    type Input = I;
    type Output = O;

    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, input: I, next: &Next<O>) -> Result<()> {
        for out in (self.f)(input)? {
            next.execute(out);
        }
        Ok(())
    }
}
