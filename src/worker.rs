//! O run-loop do worker: reivindica, executa e registra jobs até a fila
//! esvaziar, uma parada ser pedida ou o orçamento de tempo acabar.
//!
//! Cada execução tem um id próprio. Ela só roda depois de tomar o heartbeat
//! do slot e reivindica jobs em nome de `worker-N:<execução>`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{RelaunchError, Result};
use crate::job::{Job, JobQueue, Transition};
use crate::liveness::{LivenessTracker, run_owner, worker_id};

/// Motivo gravado num job que nunca cabe no orçamento de um worker.
pub const OVERSIZED_JOB: &str = "estimate exceeds worker time budget";

/// Inicia um novo run-loop para um slot de worker.
#[async_trait]
pub trait WorkerTrigger: Send + Sync {
    /// `replaces` é o id da execução que está se relançando e entrega o slot.
    async fn start_worker(&self, num: u32, replaces: Option<&str>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Relaunching,
    Stopping,
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    QueueEmpty,
    StopRequested,
    BudgetExhausted,
    /// O próximo job não cabia no tempo restante e foi devolvido.
    HandedBack,
    /// Outra execução tomou o slot.
    Superseded,
}

impl ExitReason {
    /// Se o slot continua num novo run-loop.
    pub fn relaunches(self) -> bool {
        matches!(self, ExitReason::BudgetExhausted | ExitReason::HandedBack)
    }
}

/// Como um job reivindicado se compara ao orçamento de tempo do worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetCheck {
    Fits,
    /// Cabe numa execução nova, mas não nesta.
    HandBack,
    /// Maior que uma execução inteira.
    NeverFits,
}

pub fn check_budget(estimate: Duration, remaining: Duration, budget: Duration) -> BudgetCheck {
    if estimate > budget {
        BudgetCheck::NeverFits
    } else if remaining < estimate {
        BudgetCheck::HandBack
    } else {
        BudgetCheck::Fits
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub time_limit: Duration,
    /// Só reivindica desta fila. Todas as filas quando ausente.
    pub queue: Option<String>,
    pub heartbeat_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            time_limit: Duration::from_secs(25),
            queue: None,
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

/// Tudo de que um worker precisa, compartilhado por todos os slots.
#[derive(Clone)]
pub struct WorkerDeps {
    pub jobs: Arc<JobQueue>,
    pub tracker: LivenessTracker,
    pub trigger: Option<Arc<dyn WorkerTrigger>>,
    pub settings: WorkerSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub worker_id: String,
    pub exit: ExitReason,
    pub jobs_done: u32,
    pub jobs_failed: u32,
}

/// Uma execução do run-loop do slot `num`.
pub struct Worker {
    num: u32,
    id: String,
    run_id: String,
    /// Dono gravado nas reivindicações desta execução.
    owner: String,
    acquired: bool,
    started_at: DateTime<Utc>,
    jobs: Arc<JobQueue>,
    tracker: LivenessTracker,
    trigger: Arc<dyn WorkerTrigger>,
    settings: WorkerSettings,
    state: WorkerState,
}

impl Worker {
    /// Falha com [`RelaunchError::MisconfiguredWorker`] quando não há
    /// gatilho para relançar o slot.
    pub fn new(num: u32, deps: &WorkerDeps) -> Result<Self> {
        let trigger = deps.trigger.clone().ok_or(RelaunchError::MisconfiguredWorker)?;
        let id = worker_id(num);
        let run_id = Uuid::new_v4().simple().to_string();
        Ok(Self {
            num,
            owner: run_owner(&id, &run_id),
            id,
            run_id,
            acquired: false,
            started_at: Utc::now(),
            jobs: deps.jobs.clone(),
            tracker: deps.tracker.clone(),
            trigger,
            settings: deps.settings.clone(),
            state: WorkerState::Idle,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Toma o slot para esta execução. `replaces` é a execução que se
    /// relançou. Retorna false quando outra execução viva detém o slot.
    pub async fn acquire(&mut self, replaces: Option<&str>) -> Result<bool> {
        self.started_at = Utc::now();
        self.acquired = self
            .tracker
            .acquire(&self.id, &self.run_id, self.started_at, replaces)
            .await?;
        if !self.acquired {
            debug!(worker_id = %self.id, run_id = %self.run_id, "slot already running");
        }
        Ok(self.acquired)
    }

    /// Roda o loop e depois relança o slot ou adormece. Toma o slot antes,
    /// se ainda não o fez, e falha com [`RelaunchError::WorkerBusy`] quando
    /// outra execução o detém.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let acquired = if self.acquired { Ok(true) } else { self.acquire(None).await };
        match acquired {
            Ok(true) => {}
            Ok(false) => {
                self.state = WorkerState::Drained;
                return Err(RelaunchError::WorkerBusy {
                    worker_id: self.id.clone(),
                });
            }
            Err(err) => {
                self.state = WorkerState::Drained;
                return Err(err);
            }
        }

        self.state = WorkerState::Running;
        let started = Instant::now();
        info!(worker_id = %self.id, run_id = %self.run_id, "worker started");

        let summary = match self.run_loop(started).await {
            Ok(summary) => summary,
            Err(err) => {
                error!(worker_id = %self.id, "worker loop failed: {err}");
                self.go_dormant().await;
                return Err(err);
            }
        };

        if summary.exit.relaunches() {
            self.state = WorkerState::Relaunching;
            if let Err(err) = self.trigger.start_worker(self.num, Some(self.run_id.as_str())).await {
                error!(worker_id = %self.id, "relaunch failed: {err}");
                self.go_dormant().await;
                return Err(err);
            }
            info!(worker_id = %self.id, exit = ?summary.exit, done = summary.jobs_done, "worker relaunched");
        } else {
            self.go_dormant().await;
            info!(worker_id = %self.id, exit = ?summary.exit, done = summary.jobs_done, "worker dormant");
        }
        Ok(summary)
    }

    /// Roda o loop numa task própria. Um loop que entra em pânico ainda
    /// libera o heartbeat do slot.
    pub fn spawn(mut self) -> JoinHandle<()> {
        let id = self.id.clone();
        let run_id = self.run_id.clone();
        let tracker = self.tracker.clone();
        let run = tokio::spawn(async move { self.run().await });

        tokio::spawn(async move {
            match run.await {
                Ok(Ok(summary)) => debug!(worker_id = %id, ?summary, "worker finished"),
                Ok(Err(_)) => {}
                Err(err) => {
                    error!(worker_id = %id, "worker aborted: {err}");
                    if let Err(err) = tracker.release(&id, &run_id).await {
                        error!(worker_id = %id, "could not clear heartbeat: {err}");
                    }
                }
            }
        })
    }

    async fn run_loop(&mut self, started: Instant) -> Result<RunSummary> {
        // Quem detém o heartbeat é esta execução, então qualquer outra
        // reivindicação do slot ficou de uma execução encerrada.
        let released = self.jobs.release_claims(&self.id, Some(self.owner.as_str())).await?;
        if released > 0 {
            warn!(worker_id = %self.id, released, "released claims left by an earlier run");
        }
        let _heartbeat = self.tracker.keep_alive(
            &self.id,
            &self.run_id,
            self.started_at,
            self.settings.heartbeat_interval,
        );

        let budget = self.settings.time_limit;
        let mut summary = RunSummary {
            worker_id: self.id.clone(),
            exit: ExitReason::QueueEmpty,
            jobs_done: 0,
            jobs_failed: 0,
        };

        summary.exit = loop {
            if started.elapsed() >= budget {
                break ExitReason::BudgetExhausted;
            }
            if !self.tracker.owns(&self.id, &self.run_id).await? {
                warn!(worker_id = %self.id, run_id = %self.run_id, "slot taken over by another run");
                break ExitReason::Superseded;
            }
            if self.tracker.take_stop_request(&self.id).await? {
                self.state = WorkerState::Stopping;
                break ExitReason::StopRequested;
            }
            let Some(mut job) = self
                .jobs
                .claim_next(self.settings.queue.as_deref(), &self.owner)
                .await?
            else {
                break ExitReason::QueueEmpty;
            };

            let estimate = Duration::from_secs(job.time_estimate());
            let remaining = budget.saturating_sub(started.elapsed());
            match check_budget(estimate, remaining, budget) {
                BudgetCheck::Fits => self.process(&mut job, &mut summary).await?,
                BudgetCheck::NeverFits => {
                    self.fail(&mut job, OVERSIZED_JOB).await?;
                    summary.jobs_failed += 1;
                }
                BudgetCheck::HandBack => {
                    warn!(
                        worker_id = %self.id,
                        job_id = job.id(),
                        estimate = estimate.as_secs(),
                        remaining = remaining.as_secs(),
                        "not enough time left, handing job back"
                    );
                    self.jobs.unclaim(&mut job).await?;
                    break ExitReason::HandedBack;
                }
            }
        };
        Ok(summary)
    }

    async fn process(&self, job: &mut Job, summary: &mut RunSummary) -> Result<()> {
        debug!(worker_id = %self.id, job_id = job.id(), label = job.label(), "running job");
        match self.jobs.execute(job).await {
            Ok(()) => {
                self.jobs.mark_as_done(job).await?;
                summary.jobs_done += 1;
            }
            Err(err) => {
                self.fail(job, format!("{err:#}")).await?;
                summary.jobs_failed += 1;
            }
        }
        Ok(())
    }

    /// Registra a tentativa falha e devolve um job retentável ao conjunto.
    async fn fail(&self, job: &mut Job, reason: impl std::fmt::Display) -> Result<()> {
        if let Transition::Retry { .. } = self.jobs.mark_as_failed(job, reason).await? {
            self.jobs.unclaim(job).await?;
        }
        Ok(())
    }

    async fn go_dormant(&mut self) {
        if let Err(err) = self.tracker.release(&self.id, &self.run_id).await {
            error!(worker_id = %self.id, "could not clear heartbeat: {err}");
        }
        self.state = WorkerState::Drained;
    }
}
