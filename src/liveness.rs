//! Heartbeats dos workers, pedidos de parada e as sondas que decidem se um
//! slot de worker ainda está rodando.
//!
//! O heartbeat de um slot funciona como concessão: guarda o id da execução
//! dona do slot e só é trocado por `compare_and_swap`, de modo que duas
//! execuções nunca ocupam o mesmo slot ao mesmo tempo.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::CoordinationStore;

/// Id do worker que ocupa o slot `num`.
pub fn worker_id(num: u32) -> String {
    format!("worker-{num}")
}

fn heartbeat_key(worker_id: &str) -> String {
    format!("worker:{worker_id}:heartbeat")
}

fn stop_key(worker_id: &str) -> String {
    format!("worker:{worker_id}:stop")
}

/// Dono das reivindicações feitas pela execução `run_id` do slot `worker_id`.
pub fn run_owner(worker_id: &str, run_id: &str) -> String {
    format!("{worker_id}:{run_id}")
}

const LEASE_ATTEMPTS: usize = 3;

/// Prova persistida de que um run-loop está executando.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub pid: u32,
    /// Execução que detém o slot.
    #[serde(default)]
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub beat_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Alive,
    Dead,
}

/// Como a vivacidade é decidida.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessMode {
    /// Tabela de processos quando o SO suporta, idade do heartbeat caso contrário.
    #[default]
    Auto,
    ProcessTable,
    Heartbeat,
}

pub trait LivenessProbe: Send + Sync {
    fn is_running(&self, heartbeat: &Heartbeat) -> bool;
}

/// Vivo enquanto o PID gravado estiver na tabela de processos do SO.
#[derive(Debug, Default)]
pub struct ProcessTableProbe;

impl LivenessProbe for ProcessTableProbe {
    fn is_running(&self, heartbeat: &Heartbeat) -> bool {
        let pid = Pid::from_u32(heartbeat.pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).is_some()
    }
}

/// Vivo enquanto a última batida for mais nova que `stale_after`.
#[derive(Debug)]
pub struct HeartbeatProbe {
    stale_after: Duration,
}

impl HeartbeatProbe {
    pub fn new(stale_after: Duration) -> Self {
        Self { stale_after }
    }
}

impl LivenessProbe for HeartbeatProbe {
    fn is_running(&self, heartbeat: &Heartbeat) -> bool {
        let age = Utc::now().signed_duration_since(heartbeat.beat_at);
        // Batida no futuro (relógios defasados) conta como recente.
        age.to_std().ok().is_none_or(|age| age < self.stale_after)
    }
}

/// Escolhe a sonda para `mode`.
pub fn probe_for(mode: LivenessMode, stale_after: Duration) -> Arc<dyn LivenessProbe> {
    match mode {
        LivenessMode::ProcessTable => Arc::new(ProcessTableProbe),
        LivenessMode::Heartbeat => Arc::new(HeartbeatProbe::new(stale_after)),
        LivenessMode::Auto if sysinfo::IS_SUPPORTED_SYSTEM => Arc::new(ProcessTableProbe),
        LivenessMode::Auto => Arc::new(HeartbeatProbe::new(stale_after)),
    }
}

/// Lê e grava heartbeats e pedidos de parada no store de coordenação.
#[derive(Clone)]
pub struct LivenessTracker {
    store: Arc<dyn CoordinationStore>,
    probe: Arc<dyn LivenessProbe>,
    pings: u32,
    ping_interval: Duration,
}

impl LivenessTracker {
    pub fn new(store: Arc<dyn CoordinationStore>, probe: Arc<dyn LivenessProbe>) -> Self {
        Self {
            store,
            probe,
            pings: 1,
            ping_interval: Duration::from_secs(1),
        }
    }

    /// Rodadas e intervalo usados por [`is_alive`](Self::is_alive).
    pub fn with_pings(mut self, pings: u32, interval: Duration) -> Self {
        self.pings = pings;
        self.ping_interval = interval;
        self
    }

    fn beat(run_id: &str, started_at: DateTime<Utc>) -> Result<String> {
        let beat = Heartbeat {
            pid: std::process::id(),
            run_id: run_id.to_string(),
            started_at,
            beat_at: Utc::now(),
        };
        Ok(serde_json::to_string(&beat)?)
    }

    /// O registro bruto e sua leitura. Um registro ilegível vira `None`.
    async fn read(&self, worker_id: &str) -> Result<Option<(String, Option<Heartbeat>)>> {
        let Some(raw) = self.store.get(&heartbeat_key(worker_id)).await? else {
            return Ok(None);
        };
        let beat = match serde_json::from_str(&raw) {
            Ok(beat) => Some(beat),
            Err(err) => {
                warn!(worker_id, "ignoring unreadable heartbeat: {err}");
                None
            }
        };
        Ok(Some((raw, beat)))
    }

    /// O heartbeat gravado. Um registro ilegível conta como ausente.
    pub async fn heartbeat(&self, worker_id: &str) -> Result<Option<Heartbeat>> {
        Ok(self.read(worker_id).await?.and_then(|(_, beat)| beat))
    }

    /// Toma o slot para a execução `run_id`.
    ///
    /// Só tem sucesso se o slot estiver livre, se o dono atual não estiver
    /// mais rodando, ou se o dono atual for `replaces` (a execução que está
    /// se relançando). Retorna false quando outra execução viva detém o slot.
    pub async fn acquire(
        &self,
        worker_id: &str,
        run_id: &str,
        started_at: DateTime<Utc>,
        replaces: Option<&str>,
    ) -> Result<bool> {
        let key = heartbeat_key(worker_id);
        let value = Self::beat(run_id, started_at)?;
        for _ in 0..LEASE_ATTEMPTS {
            let current = self.read(worker_id).await?;
            if let Some((_, Some(beat))) = &current {
                let handed_over = beat.run_id == run_id || replaces == Some(beat.run_id.as_str());
                if !handed_over && self.probe.is_running(beat) {
                    debug!(worker_id, holder = %beat.run_id, "slot is held by a live run");
                    return Ok(false);
                }
            }
            let expected = current.as_ref().map(|(raw, _)| raw.as_str());
            if self.store.compare_and_swap(&key, expected, Some(value.as_str())).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Atualiza a batida enquanto `run_id` ainda detém o slot. Retorna false
    /// quando o slot foi tomado ou liberado.
    pub async fn refresh(&self, worker_id: &str, run_id: &str, started_at: DateTime<Utc>) -> Result<bool> {
        let Some((raw, Some(beat))) = self.read(worker_id).await? else {
            return Ok(false);
        };
        if beat.run_id != run_id {
            return Ok(false);
        }
        let value = Self::beat(run_id, started_at)?;
        self.store
            .compare_and_swap(&heartbeat_key(worker_id), Some(raw.as_str()), Some(value.as_str()))
            .await
    }

    pub async fn owns(&self, worker_id: &str, run_id: &str) -> Result<bool> {
        Ok(self
            .heartbeat(worker_id)
            .await?
            .is_some_and(|beat| beat.run_id == run_id))
    }

    /// Remove o heartbeat e o pedido de parada, desde que `run_id` ainda seja
    /// o dono do slot.
    pub async fn release(&self, worker_id: &str, run_id: &str) -> Result<bool> {
        let key = heartbeat_key(worker_id);
        for _ in 0..LEASE_ATTEMPTS {
            let Some((raw, Some(beat))) = self.read(worker_id).await? else {
                return Ok(false);
            };
            if beat.run_id != run_id {
                return Ok(false);
            }
            if self.store.compare_and_swap(&key, Some(raw.as_str()), None).await? {
                self.store.remove(&stop_key(worker_id)).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Vivo na primeira de até `pings` rodadas que encontrar um worker
    /// rodando, dormindo `ttl` entre as rodadas.
    pub async fn get_status(&self, worker_id: &str, pings: u32, ttl: Duration) -> Result<WorkerStatus> {
        for round in 0..pings.max(1) {
            if round > 0 {
                tokio::time::sleep(ttl).await;
            }
            if let Some(beat) = self.heartbeat(worker_id).await?
                && self.probe.is_running(&beat)
            {
                return Ok(WorkerStatus::Alive);
            }
            debug!(worker_id, round, "worker did not answer");
        }
        Ok(WorkerStatus::Dead)
    }

    pub async fn is_alive(&self, worker_id: &str) -> Result<bool> {
        let status = self.get_status(worker_id, self.pings, self.ping_interval).await?;
        Ok(status == WorkerStatus::Alive)
    }

    pub async fn is_dead(&self, worker_id: &str) -> Result<bool> {
        Ok(!self.is_alive(worker_id).await?)
    }

    /// Pede a um worker vivo que pare depois do job atual. Retorna false, sem
    /// gravar nada, quando o worker não está vivo.
    pub async fn request_stop(&self, worker_id: &str) -> Result<bool> {
        if !self.is_alive(worker_id).await? {
            return Ok(false);
        }
        self.store.put(&stop_key(worker_id), "1", None).await?;
        Ok(true)
    }

    /// Lê e apaga o pedido de parada.
    pub async fn take_stop_request(&self, worker_id: &str) -> Result<bool> {
        self.store.remove(&stop_key(worker_id)).await
    }

    /// Atualiza o heartbeat a cada `interval` até o guard ser descartado ou
    /// outra execução tomar o slot.
    pub fn keep_alive(&self, worker_id: &str, run_id: &str, started_at: DateTime<Utc>, interval: Duration) -> KeepAlive {
        let tracker = self.clone();
        let worker_id = worker_id.to_string();
        let run_id = run_id.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match tracker.refresh(&worker_id, &run_id, started_at).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(worker_id, run_id, "slot no longer held, heartbeat refresh stopped");
                        break;
                    }
                    Err(err) => warn!(worker_id, "heartbeat refresh failed: {err}"),
                }
            }
        });
        KeepAlive { handle }
    }
}

/// Interrompe a atualização do heartbeat ao ser descartado.
pub struct KeepAlive {
    handle: JoinHandle<()>,
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
