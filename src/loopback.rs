//! Descoberta de uma URL base que volta para esta aplicação e o gatilho HTTP
//! que inicia workers por ela.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::select_ok;
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, StatusCode, header};
use serde_json::{Value, json};
use tracing::{debug, error, info};
use url::Url;

use crate::error::{RelaunchError, Result};
use crate::liveness::{LivenessTracker, worker_id};
use crate::store::CoordinationStore;
use crate::worker::WorkerTrigger;

/// Corpo com que um endpoint `noop` vivo responde.
pub const NOOP_MARKER: &str = "noop";

#[derive(Debug, Clone)]
pub struct LoopbackSettings {
    /// URL pública dos endpoints de worker, com o caminho.
    pub site_url: Url,
    /// Enviado como cabeçalho `Host` em cada pedido de loopback.
    pub server_name: Option<String>,
    /// Porta em que o servidor escuta quando difere da pública.
    pub server_port: Option<u16>,
    pub probe_timeout: Duration,
    pub cache_ttl: Duration,
}

/// Todas as URLs base que valem uma sondagem, em ordem de preferência.
///
/// Os hosts são o host do site, o último par autenticado e `localhost`.
/// Cada um é tentado com o esquema e a porta do site, depois com http e
/// https puros, e então as mesmas variantes na porta do servidor.
pub fn candidate_urls(site_url: &Url, remote_addr: Option<IpAddr>, server_port: Option<u16>) -> Vec<Url> {
    let site_scheme = site_url.scheme().to_string();
    let site_port = site_url.port();
    let server_port = server_port.or(site_port);

    let variants = [
        (site_scheme.as_str(), site_port),
        ("http", site_port),
        ("https", site_port),
        (site_scheme.as_str(), server_port),
        ("http", server_port),
        ("https", server_port),
    ];

    let mut hosts: Vec<Host> = Vec::new();
    if let Some(host) = site_url.host_str() {
        hosts.push(Host::Name(host.to_string()));
    }
    if let Some(addr) = remote_addr {
        hosts.push(Host::Ip(addr));
    }
    hosts.push(Host::Name("localhost".to_string()));

    let mut candidates = Vec::new();
    for host in &hosts {
        for (scheme, port) in variants {
            let Some(url) = build_candidate(site_url, host, scheme, port) else {
                continue;
            };
            if !candidates.contains(&url) {
                candidates.push(url);
            }
        }
    }
    candidates
}

enum Host {
    Name(String),
    Ip(IpAddr),
}

fn build_candidate(site_url: &Url, host: &Host, scheme: &str, port: Option<u16>) -> Option<Url> {
    let mut url = site_url.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.set_scheme(scheme).ok()?;
    match host {
        Host::Name(name) => url.set_host(Some(name.as_str())).ok()?,
        Host::Ip(ip) => url.set_ip_host(*ip).ok()?,
    }
    url.set_port(port).ok()?;
    Some(url)
}

/// `{base}/{action}`, mantendo o caminho da base.
fn endpoint(base: &Url, action: &str) -> String {
    format!("{}/{action}", base.as_str().trim_end_matches('/'))
}

/// Descobre, sonda e guarda em cache a URL base de loopback.
pub struct LoopbackResolver {
    client: Client,
    store: Arc<dyn CoordinationStore>,
    settings: LoopbackSettings,
    secret: String,
    last_peer: Mutex<Option<IpAddr>>,
}

impl LoopbackResolver {
    pub fn new(settings: LoopbackSettings, store: Arc<dyn CoordinationStore>, secret: String) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(settings.probe_timeout)
            .timeout(settings.probe_timeout)
            .build()?;
        Ok(Self {
            client,
            store,
            settings,
            secret,
            last_peer: Mutex::new(None),
        })
    }

    /// Lembra o endereço da última chamada autenticada recebida.
    pub fn record_peer(&self, addr: IpAddr) {
        *self.last_peer.lock() = Some(addr);
    }

    pub fn last_peer(&self) -> Option<IpAddr> {
        *self.last_peer.lock()
    }

    pub fn candidates(&self) -> Vec<Url> {
        candidate_urls(&self.settings.site_url, self.last_peer(), self.settings.server_port)
    }

    fn cache_key(&self) -> String {
        format!("loopback-url:{}", self.settings.site_url)
    }

    /// A URL base em cache, ou a vencedora de uma nova rodada de sondagem.
    pub async fn resolve(&self) -> Result<Url> {
        let key = self.cache_key();
        if let Some(cached) = self.store.get(&key).await? {
            match Url::parse(&cached) {
                Ok(url) => return Ok(url),
                Err(err) => debug!(%cached, "discarding cached loopback url: {err}"),
            }
        }

        let url = self.resolve_from(self.candidates()).await?;
        self.store
            .put(&key, url.as_str(), Some(self.settings.cache_ttl))
            .await?;
        info!(%url, "resolved loopback url");
        Ok(url)
    }

    /// Sonda `candidates` em paralelo. A primeira a responder `noop` vence.
    pub async fn resolve_from(&self, candidates: Vec<Url>) -> Result<Url> {
        let count = candidates.len();
        if candidates.is_empty() {
            return Err(RelaunchError::LoopbackUnresolvable { candidates: 0 });
        }

        let probes = candidates.into_iter().map(|base| self.probe(base).boxed());
        match select_ok(probes).await {
            Ok((url, _)) => Ok(url),
            Err(err) => {
                debug!("last loopback probe error: {err:#}");
                Err(RelaunchError::LoopbackUnresolvable { candidates: count })
            }
        }
    }

    async fn probe(&self, base: Url) -> anyhow::Result<Url> {
        let response = self
            .post(&base, "noop", &json!({ "secret": self.secret }))
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        if body.as_str() != Some(NOOP_MARKER) {
            anyhow::bail!("{base} answered {body}");
        }
        debug!(%base, "loopback probe answered");
        Ok(base)
    }

    fn post(&self, base: &Url, action: &str, body: &Value) -> RequestBuilder {
        let request = self.client.post(endpoint(base, action)).json(body);
        match &self.settings.server_name {
            Some(name) => request.header(header::HOST, name),
            None => request,
        }
    }
}

/// Inicia workers com um POST no próprio endpoint `startWorker` da aplicação.
pub struct LoopbackTrigger {
    resolver: Arc<LoopbackResolver>,
    tracker: LivenessTracker,
}

impl LoopbackTrigger {
    pub fn new(resolver: Arc<LoopbackResolver>, tracker: LivenessTracker) -> Self {
        Self { resolver, tracker }
    }
}

#[async_trait]
impl WorkerTrigger for LoopbackTrigger {
    /// Retorna assim que o pedido sai. A resposta é tratada em segundo plano:
    /// 409 significa que o slot já roda, e qualquer outra falha libera o
    /// heartbeat deixado por `replaces` para que o coordenador acorde o slot
    /// de novo.
    async fn start_worker(&self, num: u32, replaces: Option<&str>) -> Result<()> {
        let base = self.resolver.resolve().await?;
        let mut body = json!({ "secret": self.resolver.secret, "num": num });
        if let Some(run_id) = replaces {
            body["replaces"] = json!(run_id);
        }
        let request = self.resolver.post(&base, "startWorker", &body);
        let tracker = self.tracker.clone();
        let replaces = replaces.map(str::to_string);

        tokio::spawn(async move {
            let id = worker_id(num);
            match request.send().await.and_then(|r| r.error_for_status()) {
                Ok(_) => debug!(worker_id = %id, "start request accepted"),
                Err(err) if err.status() == Some(StatusCode::CONFLICT) => {
                    debug!(worker_id = %id, "slot already running");
                }
                Err(err) => {
                    error!(worker_id = %id, "start request failed: {err}");
                    if let Some(run_id) = replaces
                        && let Err(err) = tracker.release(&id, &run_id).await
                    {
                        error!(worker_id = %id, "could not clear heartbeat: {err}");
                    }
                }
            }
        });
        Ok(())
    }
}
