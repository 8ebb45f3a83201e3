//! Contratos de armazenamento compartilhados por todos os workers.
//!
//! [`JobStore`] guarda os registros de jobs e fornece a reivindicação atômica.
//! [`CoordinationStore`] guarda pequenos registros por chave: heartbeats,
//! pedidos de parada, o segredo compartilhado e a url de loopback em cache.
//! Ambos são implementados por [`MemoryStore`] e [`SqliteStore`].

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::job::{JobId, JobStatus};

/// Um job como o store o vê: colunas indexadas mais um payload JSON opaco.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    /// Zero até o store atribuir um id.
    pub id: JobId,
    pub job_type: String,
    pub label: String,
    pub queue: String,
    pub claim_id: String,
    pub worker_id: String,
    pub status: JobStatus,
    pub payload: String,
}

/// Filtro para listar e reivindicar jobs. Resultados ordenados por id.
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    /// Vazio aceita qualquer tipo.
    pub job_types: Vec<String>,
    /// Vazio aceita qualquer status.
    pub statuses: Vec<JobStatus>,
    pub queue: Option<String>,
    pub unclaimed_only: bool,
    pub limit: Option<u32>,
}

/// Verdadeiro quando `owner` é o slot `worker_id` ou uma de suas execuções
/// (`worker_id:<execução>`).
pub fn owned_by_slot(worker_id: &str, owner: &str) -> bool {
    owner
        .strip_prefix(worker_id)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(':'))
}

impl JobQuery {
    /// Jobs que um worker pode pegar em seguida.
    pub fn claimable(job_types: Vec<String>, queue: Option<String>) -> Self {
        Self {
            job_types,
            statuses: JobStatus::CLAIMABLE.to_vec(),
            queue,
            unclaimed_only: true,
            limit: Some(1),
        }
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        (self.job_types.is_empty() || self.job_types.contains(&record.job_type))
            && (self.statuses.is_empty() || self.statuses.contains(&record.status))
            && self.queue.as_ref().is_none_or(|q| *q == record.queue)
            && (!self.unclaimed_only || (record.claim_id.is_empty() && record.worker_id.is_empty()))
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insere um registro e retorna o novo id.
    async fn create(&self, record: &JobRecord) -> Result<JobId>;

    /// Sobrescreve o registro com o mesmo id.
    async fn update(&self, record: &JobRecord) -> Result<()>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>>;

    async fn query(&self, query: &JobQuery) -> Result<Vec<JobRecord>>;

    /// Escolhe atomicamente o primeiro registro livre que satisfaz `query`,
    /// marca-o como reivindicado por `worker_id` com status IN_PROGRESS e
    /// retorna o registro atualizado.
    async fn claim(&self, query: &JobQuery, claim_id: &str, worker_id: &str) -> Result<Option<JobRecord>>;

    /// Libera as reivindicações do slot `worker_id` e de suas execuções
    /// (ver [`owned_by_slot`]), exceto as de `keep`. Mantém os status e
    /// retorna quantos registros foram liberados.
    async fn release_claims(&self, worker_id: &str, keep: Option<&str>) -> Result<u64>;

    /// Retorna false quando não havia nada para remover.
    async fn delete(&self, id: JobId) -> Result<bool>;

    /// Nomes de filas distintos, opcionalmente só os com jobs não terminais.
    async fn queue_names(&self, active_only: bool) -> Result<Vec<String>>;
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Retorna o valor, salvo se ausente ou expirado.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Grava `value` só se não houver valor vivo e retorna o valor que ficou
    /// gravado.
    async fn put_if_absent(&self, key: &str, value: &str) -> Result<String>;

    /// Troca o valor vivo por `value` somente se ele ainda for `expected`
    /// (`None` significa ausente). `value` igual a `None` remove a chave.
    /// Retorna se a troca foi aplicada. Valores gravados aqui não expiram.
    async fn compare_and_swap(&self, key: &str, expected: Option<&str>, value: Option<&str>) -> Result<bool>;

    async fn remove(&self, key: &str) -> Result<bool>;
}
