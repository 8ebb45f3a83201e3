//! Handlers dos endpoints de worker e do endpoint de operação.

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode, header},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::error::{ApiError, ApiResult};
use super::{AppState, PeerAddr};
use crate::error::RelaunchError;
use crate::liveness::worker_id;
use crate::loopback::NOOP_MARKER;
use crate::secret;
use crate::worker::Worker;

#[derive(Debug, Deserialize)]
pub struct WorkerRequest {
    pub secret: String,
    pub num: u32,
    /// Execução que está se relançando e entrega o slot.
    #[serde(default)]
    pub replaces: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NoopRequest {
    pub secret: String,
}

impl AppState {
    /// Confere o segredo compartilhado e lembra quem chamou.
    fn authenticate(&self, given: &str, peer: Option<std::net::IpAddr>) -> ApiResult<()> {
        if !secret::matches(&self.secret, given) {
            warn!(?peer, "rejected call with a bad secret");
            return Err(ApiError::unauthorized("invalid secret"));
        }
        if let (Some(resolver), Some(peer)) = (&self.resolver, peer) {
            resolver.record_peer(peer);
        }
        Ok(())
    }
}

/// Inicia um run-loop para o slot pedido e responde na hora. Responde 409
/// quando outra execução viva detém o slot, salvo se ela for `replaces`.
pub(super) async fn start_worker(
    State(state): State<AppState>,
    PeerAddr(peer): PeerAddr,
    Json(req): Json<WorkerRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    state.authenticate(&req.secret, peer)?;
    if req.num == 0 {
        return Err(ApiError::bad_request("worker numbers start at 1"));
    }

    let mut worker = Worker::new(req.num, &state.workers)?;
    let id = worker.id().to_string();
    if !worker.acquire(req.replaces.as_deref()).await? {
        info!(worker_id = %id, "start refused, slot already running");
        return Err(RelaunchError::WorkerBusy { worker_id: id }.into());
    }
    let run_id = worker.run_id().to_string();
    worker.spawn();
    Ok((StatusCode::ACCEPTED, Json(json!({ "worker": id, "run": run_id }))))
}

pub(super) async fn noop(
    State(state): State<AppState>,
    PeerAddr(peer): PeerAddr,
    Json(req): Json<NoopRequest>,
) -> ApiResult<Json<&'static str>> {
    state.authenticate(&req.secret, peer)?;
    Ok(Json(NOOP_MARKER))
}

/// Endpoint de operação: traz a contagem de workers de volta à desejada.
pub(super) async fn wakeup(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Vec<String>>> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(ApiError::forbidden("wakeup is disabled"));
    };
    let given = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();
    if !secret::matches(expected, given) {
        return Err(ApiError::forbidden("invalid admin token"));
    }

    let woken = state.coordinator.ensure_worker_count().await?;
    info!(woken = woken.len(), "wakeup requested");
    Ok(Json(woken))
}

pub(super) async fn stop_worker(
    State(state): State<AppState>,
    PeerAddr(peer): PeerAddr,
    Json(req): Json<WorkerRequest>,
) -> ApiResult<Json<Value>> {
    state.authenticate(&req.secret, peer)?;
    let id = worker_id(req.num);
    let requested = state.workers.tracker.request_stop(&id).await?;
    Ok(Json(json!({ "worker": id, "stop_requested": requested })))
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::Router;
    use axum::body::{Body, to_bytes};
    use axum::extract::ConnectInfo;
    use axum::http::Request;
    use chrono::Utc;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use tower::ServiceExt;
    use url::Url;

    use crate::api::{AppState, router};
    use crate::coordinator::Coordinator;
    use crate::error::Result;
    use crate::job::{JobQueue, JobStatus, JobTypeRegistry, SleepJob};
    use crate::liveness::{HeartbeatProbe, LivenessTracker};
    use crate::loopback::{LoopbackResolver, LoopbackSettings};
    use crate::store::MemoryStore;
    use crate::worker::{WorkerDeps, WorkerSettings, WorkerTrigger};

    const SECRET: &str = "0123456789abcdef";

    #[derive(Default)]
    struct MockTrigger {
        started: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl WorkerTrigger for MockTrigger {
        async fn start_worker(&self, num: u32, _replaces: Option<&str>) -> Result<()> {
            self.started.lock().push(num);
            Ok(())
        }
    }

    struct Harness {
        app: Router,
        jobs: Arc<JobQueue>,
        tracker: LivenessTracker,
        resolver: Arc<LoopbackResolver>,
        trigger: Arc<MockTrigger>,
    }

    fn harness(admin_token: Option<&str>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let mut registry = JobTypeRegistry::new();
        registry.register("sleep", Arc::new(SleepJob));
        let jobs = Arc::new(JobQueue::new(store.clone(), Arc::new(registry)));
        let tracker = LivenessTracker::new(store.clone(), Arc::new(HeartbeatProbe::new(Duration::from_secs(15))));
        let trigger = Arc::new(MockTrigger::default());
        let resolver = Arc::new(
            LoopbackResolver::new(
                LoopbackSettings {
                    site_url: Url::parse("http://example.com/bg/v1").unwrap(),
                    server_name: None,
                    server_port: None,
                    probe_timeout: Duration::from_secs(1),
                    cache_ttl: Duration::from_secs(60),
                },
                store,
                SECRET.into(),
            )
            .unwrap(),
        );

        let state = AppState {
            workers: WorkerDeps {
                jobs: jobs.clone(),
                tracker: tracker.clone(),
                trigger: Some(trigger.clone()),
                settings: WorkerSettings::default(),
            },
            coordinator: Arc::new(Coordinator::new(tracker.clone(), Some(trigger.clone()), 2)),
            resolver: Some(resolver.clone()),
            secret: SECRET.into(),
            admin_token: admin_token.map(Into::into),
        };

        Harness {
            app: router(state, "/bg/v1"),
            jobs,
            tracker,
            resolver,
            trigger,
        }
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn noop_answers_the_marker() {
        let h = harness(None);
        let mut request = post("/bg/v1/noop", json!({ "secret": SECRET }));
        let peer: SocketAddr = "10.1.2.3:5555".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));

        let response = h.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(json_body(response).await, json!("noop"));
        assert_eq!(h.resolver.last_peer(), Some(peer.ip()));
    }

    #[tokio::test]
    async fn bad_secret_is_unauthorized() {
        let h = harness(None);
        let mut request = post("/bg/v1/noop", json!({ "secret": "guess" }));
        request
            .extensions_mut()
            .insert(ConnectInfo("10.1.2.3:5555".parse::<SocketAddr>().unwrap()));

        let response = h.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), 401);
        assert_eq!(json_body(response).await["code"], "UNAUTHORIZED");
        assert_eq!(h.resolver.last_peer(), None);
    }

    #[tokio::test]
    async fn start_worker_runs_jobs_in_background() {
        let h = harness(None);
        let mut job = h.jobs.create("nap", "sleep", json!(0)).unwrap();
        h.jobs.save(&mut job, "default").await.unwrap();
        let id = job.id().unwrap();

        let response = h
            .app
            .oneshot(post("/bg/v1/startWorker", json!({ "secret": SECRET, "num": 2 })))
            .await
            .unwrap();
        assert_eq!(response.status(), 202);
        let body = json_body(response).await;
        assert_eq!(body["worker"], "worker-2");
        assert_eq!(body["run"].as_str().unwrap().len(), 32);

        for _ in 0..100 {
            if h.jobs.get(id).await.unwrap().unwrap().status() == JobStatus::Done {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job was not run");
    }

    #[tokio::test]
    async fn start_worker_refuses_a_slot_held_by_a_live_run() {
        let h = harness(None);
        h.tracker.acquire("worker-1", "r1", Utc::now(), None).await.unwrap();

        let response = h
            .app
            .clone()
            .oneshot(post("/bg/v1/startWorker", json!({ "secret": SECRET, "num": 1 })))
            .await
            .unwrap();
        assert_eq!(response.status(), 409);
        assert_eq!(json_body(response).await["code"], "CONFLICT");
        assert!(h.tracker.owns("worker-1", "r1").await.unwrap());

        let response = h
            .app
            .clone()
            .oneshot(post(
                "/bg/v1/startWorker",
                json!({ "secret": SECRET, "num": 1, "replaces": "someone-else" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), 409);
    }

    #[tokio::test]
    async fn start_worker_accepts_the_relaunch_hand_off() {
        let h = harness(None);
        h.tracker.acquire("worker-1", "r1", Utc::now(), None).await.unwrap();

        let response = h
            .app
            .oneshot(post(
                "/bg/v1/startWorker",
                json!({ "secret": SECRET, "num": 1, "replaces": "r1" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), 202);
        let run = json_body(response).await["run"].as_str().unwrap().to_string();
        assert_ne!(run, "r1");
        assert!(!h.tracker.owns("worker-1", "r1").await.unwrap());
    }

    #[tokio::test]
    async fn start_worker_rejects_slot_zero() {
        let h = harness(None);
        let response = h
            .app
            .oneshot(post("/bg/v1/startWorker", json!({ "secret": SECRET, "num": 0 })))
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn wakeup_needs_the_admin_token() {
        let h = harness(None);
        let response = h.app.oneshot(post("/bg/v1/wakeup", json!({}))).await.unwrap();
        assert_eq!(response.status(), 403);

        let h = harness(Some("admin"));
        let request = Request::builder()
            .method("POST")
            .uri("/bg/v1/wakeup")
            .header("authorization", "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        assert_eq!(h.app.oneshot(request).await.unwrap().status(), 403);
        assert!(h.trigger.started.lock().is_empty());
    }

    #[tokio::test]
    async fn wakeup_triggers_dead_workers() {
        let h = harness(Some("admin"));
        h.tracker.acquire("worker-1", "r1", Utc::now(), None).await.unwrap();

        let request = Request::builder()
            .method("POST")
            .uri("/bg/v1/wakeup")
            .header("authorization", "Bearer admin")
            .body(Body::empty())
            .unwrap();
        let response = h.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(json_body(response).await, json!(["worker-2"]));
        assert_eq!(*h.trigger.started.lock(), vec![2]);
    }

    #[tokio::test]
    async fn stop_worker_flags_live_workers() {
        let h = harness(None);
        h.tracker.acquire("worker-1", "r1", Utc::now(), None).await.unwrap();

        let response = h
            .app
            .clone()
            .oneshot(post("/bg/v1/stopWorker", json!({ "secret": SECRET, "num": 1 })))
            .await
            .unwrap();
        assert_eq!(
            json_body(response).await,
            json!({ "worker": "worker-1", "stop_requested": true })
        );

        let response = h
            .app
            .oneshot(post("/bg/v1/stopWorker", json!({ "secret": SECRET, "num": 3 })))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["stop_requested"], false);
        assert!(h.tracker.take_stop_request("worker-1").await.unwrap());
    }
}
