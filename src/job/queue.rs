use std::fmt::Display;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{Job, JobId};
use super::registry::JobTypeRegistry;
use super::status::{JobStatus, Transition};
use crate::error::{RelaunchError, Result};
use crate::store::{JobQuery, JobRecord, JobStore};

/// Operações de job ligadas a um store e a um registro de tipos.
///
/// Toda mudança de estado passa por aqui e é persistida antes de a chamada
/// retornar. Quando uma escrita falha, o job em memória volta ao que era
/// antes da chamada.
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    registry: Arc<JobTypeRegistry>,
    events: Option<mpsc::UnboundedSender<JobId>>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<JobTypeRegistry>) -> Self {
        Self {
            store,
            registry,
            events: None,
        }
    }

    /// Envia o id de cada job que entra em QUEUED pela primeira vez.
    pub fn with_enqueue_events(mut self, events: mpsc::UnboundedSender<JobId>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn registry(&self) -> &JobTypeRegistry {
        &self.registry
    }

    /// Cria um job ainda não salvo de um tipo registrado.
    pub fn create(&self, label: impl Into<String>, job_type: &str, dataset: Value) -> Result<Job> {
        let handler = self.registry.resolve(job_type)?;
        let estimate = handler.time_estimate(&dataset);
        Ok(Job::new(label.into(), job_type.to_string(), dataset, estimate))
    }

    /// Persiste o job em `queue`, enfileirando-o se estava UNQUEUED.
    pub async fn save(&self, job: &mut Job, queue: &str) -> Result<()> {
        ensure_mutable(job)?;
        if queue.is_empty() {
            return Err(RelaunchError::SaveJob("queue name must not be empty".into()));
        }

        let snapshot = job.clone();
        let first_enqueue = job.status == JobStatus::Unqueued;
        if first_enqueue {
            job.status = JobStatus::Queued;
        }
        job.queue = queue.to_string();
        self.write(job, snapshot).await?;

        if first_enqueue {
            self.notify_enqueued(job);
        }
        Ok(())
    }

    pub async fn get(&self, id: JobId) -> Result<Option<Job>> {
        match self.store.get(id).await? {
            Some(record) => self.reconstitute(record).map(Some),
            None => Ok(None),
        }
    }

    /// Lista jobs na ordem do store. `statuses` vazio aceita todos.
    pub async fn list(&self, queue: Option<&str>, limit: Option<u32>, statuses: &[JobStatus]) -> Result<Vec<Job>> {
        let query = JobQuery {
            statuses: statuses.to_vec(),
            queue: queue.map(str::to_string),
            limit,
            ..Default::default()
        };
        self.store
            .query(&query)
            .await?
            .into_iter()
            .map(|record| self.reconstitute(record))
            .collect()
    }

    /// Reivindica para `worker_id` o job reivindicável mais antigo de um tipo
    /// registrado, de `queue` ou de qualquer fila.
    pub async fn claim_next(&self, queue: Option<&str>, worker_id: &str) -> Result<Option<Job>> {
        let types = self.registry.types();
        if types.is_empty() {
            return Ok(None);
        }
        let query = JobQuery::claimable(types, queue.map(str::to_string));
        let claim_id = Uuid::new_v4().to_string();

        let Some(record) = self.store.claim(&query, &claim_id, worker_id).await? else {
            return Ok(None);
        };
        debug!(job_id = record.id, worker_id, queue = %record.queue, "claimed job");
        self.reconstitute(record).map(Some)
    }

    /// Roda o handler do job. O job precisa estar reivindicado.
    pub async fn execute(&self, job: &mut Job) -> anyhow::Result<()> {
        if !job.is_claimed() {
            return Err(RelaunchError::NotClaimed.into());
        }
        let handler = self.registry.resolve(&job.job_type)?;
        handler.run(job).await
    }

    pub async fn mark_as_done(&self, job: &mut Job) -> Result<()> {
        ensure_persisted_and_mutable(job)?;
        let snapshot = job.clone();
        job.record_done();
        self.write(job, snapshot).await?;
        info!(job_id = job.id, label = %job.label, "job complete");
        Ok(())
    }

    /// Conta uma tentativa falha. O job fica FAILED enquanto restam
    /// retentativas e ABANDONED depois.
    pub async fn mark_as_failed(&self, job: &mut Job, error: impl Display) -> Result<Transition> {
        ensure_persisted_and_mutable(job)?;
        let snapshot = job.clone();
        let transition = job.record_failure(&error.to_string());
        self.write(job, snapshot).await?;

        match transition {
            Transition::Retry { attempt } => {
                warn!(job_id = job.id, attempt, max_retries = job.max_retries, "job failed: {error}")
            }
            Transition::Abandon { attempt } => {
                warn!(job_id = job.id, attempt, "job abandoned: {error}")
            }
        }
        Ok(transition)
    }

    /// Devolve o job ao conjunto sem contar uma falha.
    pub async fn unclaim(&self, job: &mut Job) -> Result<()> {
        ensure_persisted_and_mutable(job)?;
        let snapshot = job.clone();
        let from = std::mem::take(&mut job.worker_id);
        job.log_history(format!("Job was unclaimed from {from}"));
        job.release_claim();
        self.write(job, snapshot).await?;
        debug!(job_id = job.id, worker_id = %from, "unclaimed job");
        Ok(())
    }

    /// Remove o job do store. Em caso de sucesso o job fica solto: sem id,
    /// sem fila e sem reivindicação.
    pub async fn delete(&self, job: &mut Job) -> Result<()> {
        let Some(id) = job.id else {
            return Err(RelaunchError::DequeueJob("job has never been saved".into()));
        };
        match self.store.delete(id).await {
            Ok(true) => {
                job.id = None;
                job.queue.clear();
                job.release_claim();
                Ok(())
            }
            Ok(false) => Err(RelaunchError::DequeueJob(format!("could not dequeue #{id}"))),
            Err(err) => Err(RelaunchError::DequeueJob(format!("could not dequeue #{id}: {err}"))),
        }
    }

    /// Carrega e remove o job `id`, retornando o job solto.
    pub async fn dequeue(&self, id: JobId) -> Result<Job> {
        let Some(mut job) = self.get(id).await? else {
            return Err(RelaunchError::DequeueJob(format!("Job #{id} could not be dequeued")));
        };
        self.delete(&mut job).await?;
        Ok(job)
    }

    pub async fn queue_names(&self, active_only: bool) -> Result<Vec<String>> {
        self.store.queue_names(active_only).await
    }

    /// Libera as reivindicações deixadas por execuções anteriores do slot
    /// `worker_id`, poupando as de `keep`.
    pub async fn release_claims(&self, worker_id: &str, keep: Option<&str>) -> Result<u64> {
        self.store.release_claims(worker_id, keep).await
    }

    fn reconstitute(&self, record: JobRecord) -> Result<Job> {
        self.registry.resolve(&record.job_type)?;
        Job::from_record(record)
    }

    async fn write(&self, job: &mut Job, snapshot: Job) -> Result<()> {
        if let Err(err) = self.try_write(job).await {
            *job = snapshot;
            return Err(match err {
                RelaunchError::SaveJob(msg) => RelaunchError::SaveJob(msg),
                other => RelaunchError::SaveJob(other.to_string()),
            });
        }
        Ok(())
    }

    async fn try_write(&self, job: &mut Job) -> Result<()> {
        match job.id {
            Some(_) => self.store.update(&job.to_record()?).await,
            None => {
                job.log_history("Job was persisted");
                let id = self.store.create(&job.to_record()?).await?;
                job.id = Some(id);
                Ok(())
            }
        }
    }

    fn notify_enqueued(&self, job: &Job) {
        let (Some(events), Some(id)) = (&self.events, job.id) else {
            return;
        };
        if events.send(id).is_err() {
            debug!(job_id = id, "no listener for enqueue events");
        }
    }
}

fn ensure_mutable(job: &Job) -> Result<()> {
    if job.status.is_terminal() {
        return Err(RelaunchError::TerminalJob {
            id: job.id.unwrap_or_default(),
            status: job.status,
        });
    }
    Ok(())
}

fn ensure_persisted_and_mutable(job: &Job) -> Result<()> {
    if job.id.is_none() {
        return Err(RelaunchError::SaveJob("job has not been saved to a queue".into()));
    }
    ensure_mutable(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::SleepJob;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;

    fn registry() -> Arc<JobTypeRegistry> {
        let mut registry = JobTypeRegistry::new();
        registry.register("sleep", Arc::new(SleepJob));
        Arc::new(registry)
    }

    fn queue() -> (Arc<MemoryStore>, JobQueue) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), JobQueue::new(store, registry()))
    }

    async fn queued(jobs: &JobQueue, max_retries: u32) -> Job {
        let mut job = jobs
            .create("nap", "sleep", json!(1))
            .unwrap()
            .with_max_retries(max_retries);
        jobs.save(&mut job, "default").await.unwrap();
        job
    }

    /// Delega leituras e reivindicações, recusa toda escrita.
    struct ReadOnlyStore(MemoryStore);

    #[async_trait]
    impl JobStore for ReadOnlyStore {
        async fn create(&self, _record: &JobRecord) -> Result<JobId> {
            Err(RelaunchError::Store("read-only".into()))
        }
        async fn update(&self, _record: &JobRecord) -> Result<()> {
            Err(RelaunchError::Store("read-only".into()))
        }
        async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
            JobStore::get(&self.0, id).await
        }
        async fn query(&self, query: &JobQuery) -> Result<Vec<JobRecord>> {
            self.0.query(query).await
        }
        async fn claim(&self, query: &JobQuery, claim_id: &str, worker_id: &str) -> Result<Option<JobRecord>> {
            self.0.claim(query, claim_id, worker_id).await
        }
        async fn release_claims(&self, worker_id: &str, keep: Option<&str>) -> Result<u64> {
            self.0.release_claims(worker_id, keep).await
        }
        async fn delete(&self, _id: JobId) -> Result<bool> {
            Ok(false)
        }
        async fn queue_names(&self, active_only: bool) -> Result<Vec<String>> {
            self.0.queue_names(active_only).await
        }
    }

    #[test]
    fn create_requires_registered_type() {
        let (_, jobs) = queue();
        let err = jobs.create("x", "resize", json!({})).err().unwrap();
        assert!(matches!(err, RelaunchError::UnregisteredJobType(_)));

        let job = jobs.create("nap", "sleep", json!(4)).unwrap();
        assert_eq!(job.time_estimate(), 4);
        assert_eq!(job.status(), JobStatus::Unqueued);
    }

    #[tokio::test]
    async fn first_save_enqueues_and_notifies_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let store = Arc::new(MemoryStore::new());
        let jobs = JobQueue::new(store, registry()).with_enqueue_events(tx);

        let mut job = jobs.create("nap", "sleep", json!(2)).unwrap();
        jobs.save(&mut job, "default").await.unwrap();
        assert_eq!(job.status(), JobStatus::Queued);
        assert_eq!(job.queue(), "default");
        assert_eq!(rx.try_recv().unwrap(), job.id().unwrap());

        jobs.save(&mut job, "other").await.unwrap();
        assert_eq!(job.queue(), "other");
        assert!(rx.try_recv().is_err());
        assert_eq!(job.history().len(), 1);
    }

    #[tokio::test]
    async fn failed_save_restores_the_job() {
        let store = Arc::new(ReadOnlyStore(MemoryStore::new()));
        let jobs = JobQueue::new(store, registry());
        let mut job = jobs.create("nap", "sleep", json!(2)).unwrap();

        let err = jobs.save(&mut job, "default").await.err().unwrap();
        assert!(matches!(err, RelaunchError::SaveJob(_)));
        assert_eq!(job.status(), JobStatus::Unqueued);
        assert_eq!(job.id(), None);
        assert!(job.history().is_empty());
    }

    /// Um job reivindicado por `worker-1` numa fila que recusa escritas.
    async fn claimed_read_only(max_retries: u32) -> (JobQueue, Job) {
        let inner = MemoryStore::new();
        let mut record = Job::new("nap".into(), "sleep".into(), json!(1), 1)
            .with_max_retries(max_retries)
            .to_record()
            .unwrap();
        record.queue = "default".into();
        record.status = JobStatus::Queued;
        inner.create(&record).await.unwrap();

        let jobs = JobQueue::new(Arc::new(ReadOnlyStore(inner)), registry());
        let claimed = jobs.claim_next(None, "worker-1").await.unwrap().unwrap();
        (jobs, claimed)
    }

    #[tokio::test]
    async fn failed_write_restores_a_failed_attempt() {
        for max_retries in [0, 1] {
            let (jobs, mut claimed) = claimed_read_only(max_retries).await;
            let before = claimed.clone();

            let err = jobs.mark_as_failed(&mut claimed, "boom").await.err().unwrap();
            assert!(matches!(err, RelaunchError::SaveJob(_)));
            assert_eq!(claimed, before);
            assert_eq!(claimed.status(), JobStatus::InProgress);
            assert_eq!(claimed.retry_attempts(), 0);
            assert!(claimed.is_claimed());
            assert!(!claimed.history().iter().any(|h| h.contains("boom")));
        }
    }

    #[tokio::test]
    async fn failed_write_restores_an_unclaim() {
        let (jobs, mut claimed) = claimed_read_only(1).await;
        let before = claimed.clone();

        let err = jobs.unclaim(&mut claimed).await.err().unwrap();
        assert!(matches!(err, RelaunchError::SaveJob(_)));
        assert_eq!(claimed, before);
        assert!(claimed.is_claimed());
        assert_eq!(claimed.worker_id(), "worker-1");
        assert!(!claimed.history().iter().any(|h| h.contains("unclaimed")));

        assert!(matches!(jobs.mark_as_done(&mut claimed).await, Err(RelaunchError::SaveJob(_))));
        assert_eq!(claimed, before);
    }

    #[tokio::test]
    async fn empty_queue_name_is_rejected() {
        let (_, jobs) = queue();
        let mut job = jobs.create("nap", "sleep", json!(2)).unwrap();
        assert!(matches!(jobs.save(&mut job, "").await, Err(RelaunchError::SaveJob(_))));
        assert_eq!(job.status(), JobStatus::Unqueued);
    }

    #[tokio::test]
    async fn retry_bookkeeping_matches_failures() {
        let (_, jobs) = queue();
        let job = queued(&jobs, 2).await;
        let id = job.id().unwrap();

        for attempt in 1..=2 {
            let mut claimed = jobs.claim_next(None, "worker-1").await.unwrap().unwrap();
            assert_eq!(claimed.id(), Some(id));
            let t = jobs.mark_as_failed(&mut claimed, "boom").await.unwrap();
            assert_eq!(t, Transition::Retry { attempt });
            assert_eq!(claimed.status(), JobStatus::Failed);
            assert_eq!(claimed.retry_attempts(), attempt);
            jobs.unclaim(&mut claimed).await.unwrap();
        }

        let mut claimed = jobs.claim_next(None, "worker-1").await.unwrap().unwrap();
        let t = jobs.mark_as_failed(&mut claimed, "boom").await.unwrap();
        assert_eq!(t, Transition::Abandon { attempt: 3 });

        let stored = jobs.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Abandoned);
        assert_eq!(stored.retry_attempts(), 3);
        assert!(jobs.claim_next(None, "worker-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_retries_is_abandoned_and_never_reclaimed() {
        let (_, jobs) = queue();
        queued(&jobs, 0).await;

        let mut claimed = jobs.claim_next(None, "worker-1").await.unwrap().unwrap();
        jobs.mark_as_failed(&mut claimed, "bad input").await.unwrap();
        assert_eq!(claimed.status(), JobStatus::Abandoned);
        assert!(!claimed.is_claimed());
        assert!(!claimed.history().iter().any(|h| h.contains("failed in attempt #1")));

        assert!(matches!(
            jobs.unclaim(&mut claimed).await,
            Err(RelaunchError::TerminalJob { .. })
        ));
        assert!(jobs.claim_next(None, "worker-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unclaim_keeps_status_and_retry_count() {
        let (_, jobs) = queue();
        queued(&jobs, 1).await;

        let mut claimed = jobs.claim_next(None, "worker-1").await.unwrap().unwrap();
        assert_eq!(claimed.status(), JobStatus::InProgress);
        assert!(claimed.is_claimed());

        jobs.unclaim(&mut claimed).await.unwrap();
        assert_eq!(claimed.status(), JobStatus::InProgress);
        assert_eq!(claimed.retry_attempts(), 0);
        assert!(!claimed.is_claimed());
        assert!(claimed.history().last().unwrap().ends_with("Job was unclaimed from worker-1"));

        let again = jobs.claim_next(None, "worker-2").await.unwrap().unwrap();
        assert_eq!(again.id(), claimed.id());
        assert_eq!(again.worker_id(), "worker-2");
    }

    #[tokio::test]
    async fn done_jobs_are_terminal() {
        let (_, jobs) = queue();
        queued(&jobs, 0).await;
        let mut claimed = jobs.claim_next(None, "worker-1").await.unwrap().unwrap();

        jobs.mark_as_done(&mut claimed).await.unwrap();
        assert_eq!(claimed.status(), JobStatus::Done);
        assert!(!claimed.is_claimed());
        assert!(matches!(
            jobs.mark_as_failed(&mut claimed, "late").await,
            Err(RelaunchError::TerminalJob { .. })
        ));
        assert!(matches!(
            jobs.save(&mut claimed, "default").await,
            Err(RelaunchError::TerminalJob { .. })
        ));
    }

    #[tokio::test]
    async fn claim_filters_by_queue() {
        let (_, jobs) = queue();
        let mut a = jobs.create("a", "sleep", json!(1)).unwrap();
        jobs.save(&mut a, "emails").await.unwrap();
        let mut b = jobs.create("b", "sleep", json!(1)).unwrap();
        jobs.save(&mut b, "reports").await.unwrap();

        let claimed = jobs.claim_next(Some("reports"), "worker-1").await.unwrap().unwrap();
        assert_eq!(claimed.label(), "b");
        assert!(jobs.claim_next(Some("reports"), "worker-1").await.unwrap().is_none());
        assert_eq!(jobs.queue_names(true).await.unwrap(), vec!["emails", "reports"]);
    }

    #[tokio::test]
    async fn unregistered_records_are_not_claimed_but_fail_on_load() {
        let store = Arc::new(MemoryStore::new());
        let full = JobQueue::new(store.clone(), registry());
        let job = queued(&full, 0).await;

        let empty = JobQueue::new(store, Arc::new(JobTypeRegistry::new()));
        assert!(empty.claim_next(None, "worker-1").await.unwrap().is_none());
        assert!(matches!(
            empty.get(job.id().unwrap()).await,
            Err(RelaunchError::UnregisteredJobType(_))
        ));
    }

    #[tokio::test]
    async fn execute_requires_a_claim() {
        let (_, jobs) = queue();
        let mut job = queued(&jobs, 0).await;
        let err = jobs.execute(&mut job).await.err().unwrap();
        assert!(err.to_string().contains("not claimed"));
    }

    #[tokio::test]
    async fn delete_and_dequeue() {
        let (_, jobs) = queue();
        let mut job = queued(&jobs, 0).await;
        let id = job.id().unwrap();

        jobs.delete(&mut job).await.unwrap();
        assert_eq!(job.id(), None);
        assert!(job.queue().is_empty());
        assert!(jobs.get(id).await.unwrap().is_none());
        assert!(matches!(jobs.delete(&mut job).await, Err(RelaunchError::DequeueJob(_))));

        let other = queued(&jobs, 0).await;
        let detached = jobs.dequeue(other.id().unwrap()).await.unwrap();
        assert_eq!(detached.label(), "nap");
        assert!(matches!(jobs.dequeue(999).await, Err(RelaunchError::DequeueJob(_))));
    }

    #[tokio::test]
    async fn refused_delete_keeps_job_state() {
        let inner = MemoryStore::new();
        let mut record = Job::new("nap".into(), "sleep".into(), json!(1), 1).to_record().unwrap();
        record.queue = "default".into();
        record.status = JobStatus::Queued;
        let id = inner.create(&record).await.unwrap();

        let jobs = JobQueue::new(Arc::new(ReadOnlyStore(inner)), registry());
        let mut job = jobs.get(id).await.unwrap().unwrap();
        assert!(matches!(jobs.delete(&mut job).await, Err(RelaunchError::DequeueJob(_))));
        assert_eq!(job.id(), Some(id));
        assert_eq!(job.queue(), "default");
    }

    #[tokio::test]
    async fn list_filters_statuses() {
        let (_, jobs) = queue();
        queued(&jobs, 0).await;
        queued(&jobs, 0).await;
        let mut claimed = jobs.claim_next(None, "worker-1").await.unwrap().unwrap();
        jobs.mark_as_done(&mut claimed).await.unwrap();

        let open = jobs
            .list(None, None, &[JobStatus::Queued, JobStatus::Failed])
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(jobs.list(Some("default"), Some(1), &[]).await.unwrap().len(), 1);
    }
}
