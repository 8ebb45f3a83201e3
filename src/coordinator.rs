//! Mantém rodando o número desejado de slots de worker.
//!
//! O coordenador só dispara pedidos. Se dois disparos chegam ao mesmo slot,
//! o heartbeat do slot garante que apenas uma execução o toma.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{RelaunchError, Result};
use crate::job::JobId;
use crate::liveness::{LivenessTracker, worker_id};
use crate::worker::WorkerTrigger;

/// Acorda slots mortos até a contagem desejada.
pub struct Coordinator {
    tracker: LivenessTracker,
    trigger: Option<Arc<dyn WorkerTrigger>>,
    desired: AtomicU32,
}

impl Coordinator {
    pub fn new(tracker: LivenessTracker, trigger: Option<Arc<dyn WorkerTrigger>>, desired: u32) -> Self {
        Self {
            tracker,
            trigger,
            desired: AtomicU32::new(desired),
        }
    }

    pub fn set_desired_worker_count(&self, count: u32) {
        self.desired.store(count, Ordering::Relaxed);
    }

    pub fn desired_worker_count(&self) -> u32 {
        self.desired.load(Ordering::Relaxed)
    }

    /// Dispara cada slot morto em `1..=count` e retorna os ids acordados.
    /// Um slot cujo disparo falha é registrado no log e pulado.
    pub async fn wakeup(&self, count: u32) -> Result<Vec<String>> {
        let trigger = self.trigger.as_ref().ok_or(RelaunchError::MisconfiguredWorker)?;

        let mut woken = Vec::new();
        for num in 1..=count {
            let id = worker_id(num);
            if !self.tracker.is_dead(&id).await? {
                debug!(worker_id = %id, "worker already running");
                continue;
            }
            match trigger.start_worker(num, None).await {
                Ok(()) => {
                    info!(worker_id = %id, "woke worker");
                    woken.push(id);
                }
                Err(err) => error!(worker_id = %id, "could not wake worker: {err}"),
            }
        }
        Ok(woken)
    }

    pub async fn ensure_worker_count(&self) -> Result<Vec<String>> {
        self.wakeup(self.desired_worker_count()).await
    }

    /// Pede parada a cada slot rodando e retorna os ids avisados.
    pub async fn request_stop_all(&self) -> Result<Vec<String>> {
        let mut asked = Vec::new();
        for num in 1..=self.desired_worker_count() {
            let id = worker_id(num);
            if self.tracker.request_stop(&id).await? {
                asked.push(id);
            }
        }
        Ok(asked)
    }

    /// Acorda workers sempre que jobs entram na fila. Rajadas de eventos viram
    /// um único despertar.
    pub fn spawn_enqueue_listener(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<JobId>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(job_id) = events.recv().await {
                while events.try_recv().is_ok() {}
                debug!(job_id, "job enqueued");
                if let Err(err) = self.ensure_worker_count().await {
                    error!("wakeup after enqueue failed: {err}");
                }
            }
        })
    }

    /// Acorda workers a cada `period`, começando imediatamente.
    pub fn spawn_ticker(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = self.ensure_worker_count().await {
                    error!("periodic wakeup failed: {err}");
                }
            }
        })
    }
}
