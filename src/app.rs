//! Montagem do store, da fila, da vivacidade, do loopback e do coordenador
//! num único serviço.

use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{self, AppState};
use crate::config::RelaunchConfig;
use crate::coordinator::Coordinator;
use crate::job::{JobId, JobQueue, JobTypeRegistry};
use crate::liveness::{LivenessTracker, probe_for};
use crate::loopback::{LoopbackResolver, LoopbackTrigger};
use crate::secret;
use crate::store::{CoordinationStore, JobStore};
use crate::worker::{WorkerDeps, WorkerTrigger};

/// O serviço montado: fila, coordenador e estado dos endpoints.
pub struct App {
    pub config: RelaunchConfig,
    pub jobs: Arc<JobQueue>,
    pub coordinator: Arc<Coordinator>,
    pub state: AppState,
    enqueued: Option<mpsc::UnboundedReceiver<JobId>>,
}

impl App {
    pub async fn new<S>(config: RelaunchConfig, registry: JobTypeRegistry, store: Arc<S>) -> Result<Self>
    where
        S: JobStore + CoordinationStore + 'static,
    {
        let (events, enqueued) = mpsc::unbounded_channel();
        let jobs = Arc::new(JobQueue::new(store.clone(), Arc::new(registry)).with_enqueue_events(events));
        let secret = secret::load_or_create(store.as_ref()).await?;

        let probe = probe_for(config.liveness, config.heartbeat_stale_after());
        let tracker = LivenessTracker::new(store.clone(), probe).with_pings(config.ping_rounds, config.ping_interval());

        let resolver = match config.loopback_settings()? {
            Some(settings) => Some(Arc::new(LoopbackResolver::new(settings, store.clone(), secret.clone())?)),
            None => None,
        };
        let trigger = resolver.as_ref().map(|resolver| {
            Arc::new(LoopbackTrigger::new(resolver.clone(), tracker.clone())) as Arc<dyn WorkerTrigger>
        });
        if trigger.is_none() {
            warn!("no endpoint_url configured, workers cannot be started");
        }

        let coordinator = Arc::new(Coordinator::new(tracker.clone(), trigger.clone(), config.desired_workers));
        let state = AppState {
            workers: WorkerDeps {
                jobs: jobs.clone(),
                tracker,
                trigger,
                settings: config.worker_settings(),
            },
            coordinator: coordinator.clone(),
            resolver,
            secret: secret.into(),
            admin_token: config.admin_token.as_deref().map(Into::into),
        };

        Ok(Self {
            config,
            jobs,
            coordinator,
            state,
            enqueued: Some(enqueued),
        })
    }

    pub fn router(&self) -> Router {
        api::router(self.state.clone(), &self.config.route_prefix)
    }

    /// Inicia o ouvinte de enfileiramento e o despertar periódico. Não faz
    /// nada quando workers não podem ser iniciados ou quando já iniciou.
    pub fn start_background(&mut self) -> Vec<JoinHandle<()>> {
        if self.state.workers.trigger.is_none() {
            return Vec::new();
        }
        let Some(enqueued) = self.enqueued.take() else {
            return Vec::new();
        };
        info!(
            desired = self.coordinator.desired_worker_count(),
            every = self.config.tick_interval_secs,
            "starting coordinator"
        );
        vec![
            self.coordinator.clone().spawn_enqueue_listener(enqueued),
            self.coordinator.clone().spawn_ticker(self.config.tick_interval()),
        ]
    }
}
