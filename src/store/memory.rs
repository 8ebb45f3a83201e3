use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{CoordinationStore, JobQuery, JobRecord, JobStore, owned_by_slot};
use crate::error::{RelaunchError, Result};
use crate::job::{JobId, JobStatus};

/// Store em memória do processo. Cada operação roda sob um único lock, o que
/// torna `claim` e `compare_and_swap` atômicos.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: Mutex<Jobs>,
    entries: Mutex<HashMap<String, Entry>>,
}

#[derive(Debug, Default)]
struct Jobs {
    last_id: JobId,
    rows: BTreeMap<JobId, JobRecord>,
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create(&self, record: &JobRecord) -> Result<JobId> {
        let mut jobs = self.jobs.lock();
        jobs.last_id += 1;
        let id = jobs.last_id;
        let mut stored = record.clone();
        stored.id = id;
        jobs.rows.insert(id, stored);
        Ok(id)
    }

    async fn update(&self, record: &JobRecord) -> Result<()> {
        let mut jobs = self.jobs.lock();
        match jobs.rows.get_mut(&record.id) {
            Some(row) => {
                *row = record.clone();
                Ok(())
            }
            None => Err(RelaunchError::Store(format!("job #{} does not exist", record.id))),
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        Ok(self.jobs.lock().rows.get(&id).cloned())
    }

    async fn query(&self, query: &JobQuery) -> Result<Vec<JobRecord>> {
        let jobs = self.jobs.lock();
        let limit = query.limit.map_or(usize::MAX, |l| l as usize);
        Ok(jobs
            .rows
            .values()
            .filter(|r| query.matches(r))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn claim(&self, query: &JobQuery, claim_id: &str, worker_id: &str) -> Result<Option<JobRecord>> {
        let mut jobs = self.jobs.lock();
        let Some(row) = jobs
            .rows
            .values_mut()
            .find(|r| query.matches(r) && r.claim_id.is_empty() && r.worker_id.is_empty())
        else {
            return Ok(None);
        };
        row.claim_id = claim_id.to_string();
        row.worker_id = worker_id.to_string();
        row.status = JobStatus::InProgress;
        Ok(Some(row.clone()))
    }

    async fn release_claims(&self, worker_id: &str, keep: Option<&str>) -> Result<u64> {
        let mut jobs = self.jobs.lock();
        let mut released = 0;
        for row in jobs
            .rows
            .values_mut()
            .filter(|r| owned_by_slot(worker_id, &r.worker_id) && keep != Some(r.worker_id.as_str()))
        {
            row.claim_id.clear();
            row.worker_id.clear();
            released += 1;
        }
        Ok(released)
    }

    async fn delete(&self, id: JobId) -> Result<bool> {
        Ok(self.jobs.lock().rows.remove(&id).is_some())
    }

    async fn queue_names(&self, active_only: bool) -> Result<Vec<String>> {
        let jobs = self.jobs.lock();
        let names: BTreeSet<String> = jobs
            .rows
            .values()
            .filter(|r| !r.queue.is_empty())
            .filter(|r| !active_only || !r.status.is_terminal())
            .map(|r| r.queue.clone())
            .collect();
        Ok(names.into_iter().collect())
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at = match ttl {
            Some(ttl) => Some(Utc::now() + chrono::Duration::from_std(ttl).map_err(|e| RelaunchError::Store(e.to_string()))?),
            None => None,
        };
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> Result<String> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(key).filter(|e| e.is_live(now)) {
            return Ok(entry.value.clone());
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(value.to_string())
    }

    async fn compare_and_swap(&self, key: &str, expected: Option<&str>, value: Option<&str>) -> Result<bool> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let current = entries.get(key).filter(|e| e.is_live(now)).map(|e| e.value.as_str());
        if current != expected {
            return Ok(false);
        }
        match value {
            Some(value) => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: value.to_string(),
                        expires_at: None,
                    },
                );
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }
}
