use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::model::{DEFAULT_TIME_ESTIMATE, Job};
use crate::error::{RelaunchError, Result};

/// Comportamento específico de cada tipo de job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Segundos que um job com este dataset deve levar.
    fn time_estimate(&self, _dataset: &Value) -> u64 {
        DEFAULT_TIME_ESTIMATE
    }

    /// Roda o job. Retornar um erro marca a tentativa como falha.
    async fn run(&self, job: &mut Job) -> anyhow::Result<()>;
}

/// Mapeia tags de tipo para handlers.
///
/// Montado uma vez na inicialização e depois compartilhado, só para leitura,
/// com a fila.
#[derive(Default, Clone)]
pub struct JobTypeRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra (ou substitui) o handler de `type_tag`.
    pub fn register(&mut self, type_tag: impl Into<String>, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(type_tag.into(), handler);
        self
    }

    pub fn deregister(&mut self, type_tag: &str) -> &mut Self {
        self.handlers.remove(type_tag);
        self
    }

    pub fn resolve(&self, type_tag: &str) -> Result<Arc<dyn JobHandler>> {
        self.handlers
            .get(type_tag)
            .cloned()
            .ok_or_else(|| RelaunchError::UnregisteredJobType(type_tag.to_string()))
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.handlers.contains_key(type_tag)
    }

    /// Tags de tipo registradas, em ordem.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for JobTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobTypeRegistry")
            .field("types", &self.types())
            .finish()
    }
}
