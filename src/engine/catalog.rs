//! Registered workflow definitions, validated once at registration

use crate::engine::error::EngineError;
use crate::model::{DagGraph, DefinitionError, WorkflowDefinition};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct DefinitionCatalog {
    graphs: RwLock<HashMap<(String, u32), Arc<DagGraph>>>,
}

impl DefinitionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and publish a definition
    ///
    /// Definitions are immutable: re-registering identical content is a
    /// no-op, different content under the same (code, version) is rejected.
    pub async fn register(&self, definition: WorkflowDefinition) -> Result<Arc<DagGraph>, EngineError> {
        let key = (definition.code.clone(), definition.version);
        let mut graphs = self.graphs.write().await;
        if let Some(existing) = graphs.get(&key) {
            if existing.definition().as_ref() == &definition {
                return Ok(existing.clone());
            }
            return Err(EngineError::DefinitionConflict {
                code: key.0,
                version: key.1,
            });
        }

        let graph = Arc::new(DagGraph::build(Arc::new(definition))?);
        graphs.insert(key, graph.clone());
        Ok(graph)
    }

    /// Look up a definition; `None` version picks the highest registered
    pub async fn get(&self, code: &str, version: Option<u32>) -> Result<Arc<DagGraph>, EngineError> {
        let graphs = self.graphs.read().await;
        let found = match version {
            Some(v) => graphs.get(&(code.to_string(), v)).cloned(),
            None => graphs
                .iter()
                .filter(|((c, _), _)| c == code)
                .max_by_key(|((_, v), _)| *v)
                .map(|(_, graph)| graph.clone()),
        };
        found.ok_or_else(|| {
            EngineError::Definition(DefinitionError::NotFound {
                code: code.to_string(),
                version: version.unwrap_or(0),
            })
        })
    }

    pub async fn len(&self) -> usize {
        self.graphs.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Edge, TaskDefinition};

    fn def(version: u32, command: &str) -> WorkflowDefinition {
        WorkflowDefinition::new("etl", version).with_task(TaskDefinition::shell("a", command))
    }

    #[tokio::test]
    async fn test_register_is_idempotent_but_immutable() {
        let catalog = DefinitionCatalog::new();
        catalog.register(def(1, "true")).await.unwrap();
        catalog.register(def(1, "true")).await.unwrap();
        assert!(matches!(
            catalog.register(def(1, "false")).await,
            Err(EngineError::DefinitionConflict { .. })
        ));
        assert_eq!(catalog.len().await, 1);
    }

    #[tokio::test]
    async fn test_latest_version_lookup() {
        let catalog = DefinitionCatalog::new();
        catalog.register(def(1, "true")).await.unwrap();
        catalog.register(def(3, "true")).await.unwrap();
        catalog.register(def(2, "true")).await.unwrap();

        assert_eq!(catalog.get("etl", None).await.unwrap().definition().version, 3);
        assert_eq!(catalog.get("etl", Some(2)).await.unwrap().definition().version, 2);
        assert!(catalog.get("etl", Some(9)).await.is_err());
        assert!(catalog.get("other", None).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_definition_is_rejected() {
        let catalog = DefinitionCatalog::new();
        let cyclic = def(1, "true")
            .with_task(TaskDefinition::shell("b", "true"))
            .with_edge(Edge::new("a", "b"))
            .with_edge(Edge::new("b", "a"));
        assert!(matches!(
            catalog.register(cyclic).await,
            Err(EngineError::Definition(DefinitionError::CycleDetected(_)))
        ));
    }
}
