use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};

use super::{Schema, SchemaId};

/// Startup-built table of every record schema known to this node.
///
/// Schema ids travel on the wire instead of names, so two builds can exchange
/// records as long as the id and attribute order are unchanged.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    by_id: HashMap<SchemaId, Arc<Schema>>,
    by_name: HashMap<String, SchemaId>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a schema under its numeric id.
    pub fn register(&mut self, schema: Schema) -> Result<Arc<Schema>> {
        if let Some(existing) = self.by_id.get(&schema.id()) {
            bail!(
                "schema id {} already registered for {}",
                schema.id(),
                existing.name()
            );
        }
        if self.by_name.contains_key(schema.name()) {
            bail!("schema name {} already registered", schema.name());
        }

        let schema = Arc::new(schema);
        self.by_name
            .insert(schema.name().to_string(), schema.id());
        self.by_id.insert(schema.id(), Arc::clone(&schema));
        Ok(schema)
    }

    pub fn get(&self, id: SchemaId) -> Option<&Arc<Schema>> {
        self.by_id.get(&id)
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<Schema>> {
        self.by_name.get(name).and_then(|id| self.by_id.get(id))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Registered schemas ordered by id.
    pub fn schemas(&self) -> Vec<Arc<Schema>> {
        let mut all: Vec<_> = self.by_id.values().cloned().collect();
        all.sort_by_key(|s| s.id());
        all
    }
}
