use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::status::{JobStatus, Transition};
use crate::error::Result;
use crate::store::JobRecord;

/// Identificador de um job persistido no store.
pub type JobId = i64;

/// Segundos assumidos para um job quando o tipo não dá estimativa melhor.
pub const DEFAULT_TIME_ESTIMATE: u64 = 20;

/// Uma unidade de trabalho na fila.
///
/// Jobs são criados por [`JobQueue::create`](super::JobQueue::create) e só
/// mudam de status pelas operações da fila, que persistem cada transição.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub(crate) id: Option<JobId>,
    pub(crate) job_type: String,
    pub(crate) label: String,
    pub(crate) dataset: Value,
    pub(crate) queue: String,
    pub(crate) claim_id: String,
    pub(crate) worker_id: String,
    pub(crate) status: JobStatus,
    pub(crate) time_estimate: u64,
    pub(crate) retry_i: u32,
    pub(crate) max_retries: u32,
    pub(crate) parent_id: Option<JobId>,
    pub(crate) history: Vec<String>,
    pub(crate) output: Vec<String>,
}

/// Tudo do job que o store guarda na coluna opaca de payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobPayload {
    #[serde(default)]
    dataset: Value,
    #[serde(default)]
    history: Vec<String>,
    #[serde(default)]
    output: Vec<String>,
    #[serde(default)]
    retry_i: u32,
    #[serde(default)]
    max_retries: u32,
    #[serde(default = "default_time_estimate")]
    time_estimate: u64,
    #[serde(default)]
    parent_id: Option<JobId>,
}

fn default_time_estimate() -> u64 {
    DEFAULT_TIME_ESTIMATE
}

impl Job {
    pub(crate) fn new(label: String, job_type: String, dataset: Value, time_estimate: u64) -> Self {
        Self {
            id: None,
            job_type,
            label,
            dataset,
            queue: String::new(),
            claim_id: String::new(),
            worker_id: String::new(),
            status: JobStatus::Unqueued,
            time_estimate,
            retry_i: 0,
            max_retries: 0,
            parent_id: None,
            history: Vec::new(),
            output: Vec::new(),
        }
    }

    /// Número de tentativas falhas toleradas antes de abandonar o job.
    /// Zero abandona na primeira falha.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Registra o job que originou este.
    pub fn with_parent(mut self, parent_id: JobId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn id(&self) -> Option<JobId> {
        self.id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn dataset(&self) -> &Value {
        &self.dataset
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn claim_id(&self) -> &str {
        &self.claim_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn time_estimate(&self) -> u64 {
        self.time_estimate
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_i
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn parent_id(&self) -> Option<JobId> {
        self.parent_id
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn output(&self) -> &[String] {
        &self.output
    }

    /// Um job só está reivindicado enquanto a reivindicação e o worker estão definidos.
    pub fn is_claimed(&self) -> bool {
        !self.claim_id.is_empty() && !self.worker_id.is_empty()
    }

    /// Se outra tentativa é permitida depois das falhas registradas até agora.
    pub fn can_be_retried(&self) -> bool {
        self.status != JobStatus::Abandoned
            && self.max_retries != 0
            && self.retry_i <= self.max_retries
    }

    /// Acrescenta uma entrada com data e hora ao histórico do job.
    pub fn log_history(&mut self, msg: impl AsRef<str>) {
        self.history.push(stamp(msg.as_ref()));
    }

    /// Acrescenta uma entrada com data e hora à saída do job.
    pub fn log_output(&mut self, msg: impl AsRef<str>) {
        self.output.push(stamp(msg.as_ref()));
    }

    pub(crate) fn release_claim(&mut self) {
        self.claim_id.clear();
        self.worker_id.clear();
    }

    pub(crate) fn record_done(&mut self) {
        self.status = JobStatus::Done;
        self.log_history("Job is complete");
        self.release_claim();
    }

    /// Conta uma tentativa falha e move o job para FAILED ou ABANDONED.
    pub(crate) fn record_failure(&mut self, reason: &str) -> Transition {
        self.log_history(format!("A problem occurred processing the job: {reason}"));
        self.retry_i += 1;
        let attempt = self.retry_i;

        if self.can_be_retried() {
            self.status = JobStatus::Failed;
            self.log_history(format!("Job failed in attempt #{attempt}"));
            Transition::Retry { attempt }
        } else {
            self.status = JobStatus::Abandoned;
            self.log_history(format!("Job abandoned after attempt #{attempt}"));
            self.release_claim();
            Transition::Abandon { attempt }
        }
    }

    pub(crate) fn to_record(&self) -> Result<JobRecord> {
        let payload = JobPayload {
            dataset: self.dataset.clone(),
            history: self.history.clone(),
            output: self.output.clone(),
            retry_i: self.retry_i,
            max_retries: self.max_retries,
            time_estimate: self.time_estimate,
            parent_id: self.parent_id,
        };
        Ok(JobRecord {
            id: self.id.unwrap_or_default(),
            job_type: self.job_type.clone(),
            label: self.label.clone(),
            queue: self.queue.clone(),
            claim_id: self.claim_id.clone(),
            worker_id: self.worker_id.clone(),
            status: self.status,
            payload: serde_json::to_string(&payload)?,
        })
    }

    /// Reconstrói um job a partir do registro gravado. Cabe a quem chama
    /// conferir que o tipo do registro está registrado.
    pub(crate) fn from_record(record: JobRecord) -> Result<Self> {
        let payload: JobPayload = serde_json::from_str(&record.payload)?;
        Ok(Self {
            id: Some(record.id),
            job_type: record.job_type,
            label: record.label,
            dataset: payload.dataset,
            queue: record.queue,
            claim_id: record.claim_id,
            worker_id: record.worker_id,
            status: record.status,
            time_estimate: payload.time_estimate,
            retry_i: payload.retry_i,
            max_retries: payload.max_retries,
            parent_id: payload.parent_id,
            history: payload.history,
            output: payload.output,
        })
    }
}

fn stamp(msg: &str) -> String {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    format!("{now}\t{msg}")
}
