use std::sync::Arc;

use anyhow::Result;

use super::{Graph, Next, Stage};

/// Terminal stage that re-enters another graph.
///
/// Lets one pipeline feed a second one without the two knowing each other's
/// internals, e.g. a metrics graph fed from the span graph.
pub struct BridgeStage<T> {
    name: String,
    target: Arc<Graph<T>>,
}

impl<T: Clone + Send + 'static> BridgeStage<T> {
    pub fn new(target: Arc<Graph<T>>) -> Self {
        Self {
            name: format!("bridge-{}", target.id()),
            target,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Stage for BridgeStage<T> {
    type Input = T;
    type Output = ();

    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, input: T, _next: &Next<()>) -> Result<()> {
        self.target.start(input);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{FnStage, GraphManager};
    use parking_lot::Mutex;

    #[test]
    fn test_bridge_forwards_into_target_graph() {
        let manager = GraphManager::new(None);
        let source = manager.create_if_absent::<String>(1);
        let target = manager.create_if_absent::<String>(2);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        target.add_node(FnStage::new("record", move |v: String| {
            sink.lock().push(v);
            Ok(Vec::<()>::new())
        }));

        source
            .add_node(FnStage::new("upper", |v: String| Ok(vec![v.to_uppercase()])))
            .add_next(BridgeStage::new(Arc::clone(&target)));

        source.start("checkout".to_string());
        source.start("cart".to_string());
        assert_eq!(*seen.lock(), vec!["CHECKOUT".to_string(), "CART".to_string()]);
    }

    #[test]
    fn test_bridge_name_includes_target_id() {
        let manager = GraphManager::new(None);
        let target = manager.create_if_absent::<u64>(42);
        assert_eq!(BridgeStage::new(target).name(), "bridge-42");
    }
}
