//! Erros do domínio de filas e workers.

use thiserror::Error;

use crate::job::JobStatus;

/// Erros produzidos pela fila, pelos stores e pelos workers.
#[derive(Debug, Error)]
pub enum RelaunchError {
    #[error("A type has not been registered for '{0}'")]
    UnregisteredJobType(String),

    #[error("Job could not be dequeued: {0}")]
    DequeueJob(String),

    #[error("Job could not be saved: {0}")]
    SaveJob(String),

    #[error("No endpoint url configured for the workers")]
    MisconfiguredWorker,

    #[error("Could not determine loopback url ({candidates} candidates probed)")]
    LoopbackUnresolvable { candidates: usize },

    #[error("Job #{id} is {status} and can no longer change")]
    TerminalJob { id: i64, status: JobStatus },

    #[error("Job is not claimed by a worker")]
    NotClaimed,

    #[error("Worker {worker_id} is already running")]
    WorkerBusy { worker_id: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RelaunchError>;
