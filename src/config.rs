//! Configuração do serviço carregada a partir de `relaunch.toml`.
//!
//! A struct [`RelaunchConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis `RELAUNCH_DATABASE_URL`, `RELAUNCH_ENDPOINT_URL` e
//! `RELAUNCH_ADMIN_TOKEN` têm precedência sobre o arquivo.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

use crate::liveness::LivenessMode;
use crate::loopback::LoopbackSettings;
use crate::worker::WorkerSettings;

pub const DEFAULT_CONFIG_FILE: &str = "relaunch.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct RelaunchConfig {
    /// Url de conexão sqlx do store de jobs.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Endereço em que o servidor HTTP escuta.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Url pública dos endpoints de worker, com o prefixo. Sem ela os workers
    /// não conseguem se relançar.
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Cabeçalho Host dos pedidos de loopback.
    #[serde(default)]
    pub server_name: Option<String>,

    /// Porta em que o servidor é alcançável localmente, quando difere da
    /// pública.
    #[serde(default)]
    pub server_port: Option<u16>,

    #[serde(default = "default_route_prefix")]
    pub route_prefix: String,

    #[serde(default = "default_desired_workers")]
    pub desired_workers: u32,

    /// Segundos que um run-loop pode gastar antes de passar a vez.
    #[serde(default = "default_time_limit_secs")]
    pub time_limit_secs: u64,

    /// Restringe os workers a uma fila.
    #[serde(default)]
    pub worker_queue: Option<String>,

    #[serde(default = "default_ping_rounds")]
    pub ping_rounds: u32,

    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Idade do heartbeat a partir da qual um worker conta como morto (modo heartbeat).
    #[serde(default = "default_heartbeat_stale_secs")]
    pub heartbeat_stale_secs: u64,

    #[serde(default)]
    pub liveness: LivenessMode,

    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    #[serde(default = "default_loopback_ttl_secs")]
    pub loopback_ttl_secs: u64,

    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Token Bearer de `/wakeup`. Sem ele o endpoint fica desativado.
    #[serde(default)]
    pub admin_token: Option<String>,
}

// Valor padrão para o banco: "sqlite:relaunch.db?mode=rwc".
fn default_database_url() -> String {
    "sqlite:relaunch.db?mode=rwc".to_string()
}

// Valor padrão para o endereço de escuta: "127.0.0.1:8080".
fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

// Valor padrão para o prefixo das rotas: "/bg/v1".
fn default_route_prefix() -> String {
    "/bg/v1".to_string()
}

// Valor padrão para workers desejados: 1.
fn default_desired_workers() -> u32 {
    1
}

// Valor padrão para o orçamento de cada execução: 25s.
fn default_time_limit_secs() -> u64 {
    25
}

// Valor padrão para rodadas de ping: 1.
fn default_ping_rounds() -> u32 {
    1
}

// Valor padrão para o intervalo entre pings: 1s.
fn default_ping_interval_secs() -> u64 {
    1
}

// Valor padrão para o intervalo do heartbeat: 5s.
fn default_heartbeat_interval_secs() -> u64 {
    5
}

// Valor padrão para a idade de um heartbeat velho: 15s.
fn default_heartbeat_stale_secs() -> u64 {
    15
}

// Valor padrão para o timeout da sondagem: 5s.
fn default_probe_timeout_secs() -> u64 {
    5
}

// Valor padrão para o cache da url de loopback: 24h.
fn default_loopback_ttl_secs() -> u64 {
    24 * 60 * 60
}

// Valor padrão para o despertar periódico: 60s.
fn default_tick_interval_secs() -> u64 {
    60
}

impl Default for RelaunchConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            bind: default_bind(),
            endpoint_url: None,
            server_name: None,
            server_port: None,
            route_prefix: default_route_prefix(),
            desired_workers: default_desired_workers(),
            time_limit_secs: default_time_limit_secs(),
            worker_queue: None,
            ping_rounds: default_ping_rounds(),
            ping_interval_secs: default_ping_interval_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_stale_secs: default_heartbeat_stale_secs(),
            liveness: LivenessMode::default(),
            probe_timeout_secs: default_probe_timeout_secs(),
            loopback_ttl_secs: default_loopback_ttl_secs(),
            tick_interval_secs: default_tick_interval_secs(),
            admin_token: None,
        }
    }
}

impl RelaunchConfig {
    /// Carrega `path`, ou os defaults se o arquivo não existir, e depois
    /// aplica as variáveis de ambiente.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<RelaunchConfig>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let set = |key: &str| var(key).filter(|v| !v.is_empty());
        if let Some(url) = set("RELAUNCH_DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(url) = set("RELAUNCH_ENDPOINT_URL") {
            self.endpoint_url = Some(url);
        }
        if let Some(token) = set("RELAUNCH_ADMIN_TOKEN") {
            self.admin_token = Some(token);
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            time_limit: Duration::from_secs(self.time_limit_secs),
            queue: self.worker_queue.clone().filter(|q| !q.is_empty()),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
        }
    }

    /// Ajustes de loopback, ou `None` quando não há url de endpoint.
    pub fn loopback_settings(&self) -> Result<Option<LoopbackSettings>> {
        let Some(endpoint) = self.endpoint_url.as_deref().filter(|u| !u.is_empty()) else {
            return Ok(None);
        };
        let site_url = Url::parse(endpoint).with_context(|| format!("invalid endpoint_url '{endpoint}'"))?;
        Ok(Some(LoopbackSettings {
            site_url,
            server_name: self.server_name.clone(),
            server_port: self.server_port,
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            cache_ttl: Duration::from_secs(self.loopback_ttl_secs),
        }))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn heartbeat_stale_after(&self) -> Duration {
        Duration::from_secs(self.heartbeat_stale_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }
}
