use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Os seis estados de um job em segundo plano.
///
/// Um job segue UNQUEUED → QUEUED → IN_PROGRESS → DONE, com
/// QUEUED ⇄ FAILED → ABANDONED no caminho de falha.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Unqueued,
    Queued,
    InProgress,
    Done,
    Failed,
    Abandoned,
}

impl JobStatus {
    /// Status dos quais um worker pode reivindicar, se o job estiver livre.
    pub const CLAIMABLE: [JobStatus; 3] =
        [JobStatus::Queued, JobStatus::Failed, JobStatus::InProgress];

    /// Tag gravada no store para o status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Unqueued => "unqueued",
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Abandoned => "abandoned",
        }
    }

    /// DONE e ABANDONED não aceitam mais mudanças.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Abandoned)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Unqueued => write!(f, "UNQUEUED"),
            JobStatus::Queued => write!(f, "QUEUED"),
            JobStatus::InProgress => write!(f, "IN_PROGRESS"),
            JobStatus::Done => write!(f, "DONE"),
            JobStatus::Failed => write!(f, "FAILED"),
            JobStatus::Abandoned => write!(f, "ABANDONED"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unqueued" => Ok(JobStatus::Unqueued),
            "queued" => Ok(JobStatus::Queued),
            "in_progress" => Ok(JobStatus::InProgress),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            "abandoned" => Ok(JobStatus::Abandoned),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// Resultado de registrar uma tentativa falha num job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// O job pode ser reivindicado de novo.
    Retry { attempt: u32 },
    /// Retentativas esgotadas. O job é terminal.
    Abandon { attempt: u32 },
}
