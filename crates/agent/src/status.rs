//! Loopback-only status server for the user-session helper.
//!
//! This is a read/nudge surface, not a control plane: non-loopback peers
//! are refused before routing, and every unknown path answers with a note
//! that the agent accepts no inbound control.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pw_domain::Result;
use pw_os::ProcessAdapter;
use pw_plugins::ExtensionManager;

use crate::config_store::ConfigStore;
use crate::connection::ConnectionHandle;
use crate::policy::PolicyEngine;
use crate::updater::UpdateLauncher;

/// Nudges the helper may send; executed by the supervisor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperCommand {
    SyncNow,
    RestartMonitoring,
    CheckUpdate,
}

#[derive(Clone)]
pub struct StatusState {
    pub store: Arc<ConfigStore>,
    pub connection: ConnectionHandle,
    pub engine: Arc<PolicyEngine>,
    pub extensions: Arc<ExtensionManager>,
    pub adapter: Arc<dyn ProcessAdapter>,
    pub updater: Arc<dyn UpdateLauncher>,
    pub helper_tx: mpsc::Sender<HelperCommand>,
    pub monitoring_enabled: Arc<AtomicBool>,
    /// Category of the most recent sync failure, for the helper UI.
    pub last_error: Arc<RwLock<Option<String>>>,
    pub started_at: Instant,
    pub version: &'static str,
}

/// Bind to loopback and serve until `shutdown` fires. Returns the bound
/// address (port 0 resolves to an ephemeral port) and the server task.
pub async fn serve(
    state: StatusState,
    port: u16,
    shutdown: CancellationToken,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "status server listening (loopback only)");
    let handle = tokio::spawn(async move {
        let serve = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown.cancelled_owned());
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "status server error");
        }
    });
    Ok((addr, handle))
}

fn router(state: StatusState) -> axum::Router {
    axum::Router::new()
        .route("/api/health", get(health))
        .route("/api/heartbeat", post(helper_heartbeat))
        .route("/api/helper/status", get(helper_status))
        .route("/api/helper/command", post(helper_command))
        .route("/api/platform-users", get(platform_users))
        .fallback(not_found)
        .layer(middleware::from_fn(loopback_guard))
        .with_state(state)
}

/// Reject non-loopback peers before any route matches.
async fn loopback_guard(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if !is_loopback(peer.ip()) {
        tracing::warn!(peer = %peer, "refused non-loopback status request");
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({
                "error": "forbidden",
                "note": "the status endpoint is local-only",
            })),
        )
            .into_response();
    }
    next.run(request).await
}

fn is_loopback(ip: IpAddr) -> bool {
    ip.is_loopback()
}

async fn health(State(state): State<StatusState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "version": state.version,
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

/// The helper checks in here; nothing is stored beyond the log line.
async fn helper_heartbeat() -> Json<serde_json::Value> {
    tracing::debug!("helper heartbeat");
    Json(serde_json::json!({ "ok": true }))
}

async fn helper_status(State(state): State<StatusState>) -> Json<serde_json::Value> {
    let config = state.store.snapshot();
    let connection = state.connection.snapshot();
    let offline_secs = connection
        .offline_since_ts
        .map(|since| (Utc::now() - since).num_seconds().max(0));
    // Flag an offline stretch beyond the configured ceiling; enforcement
    // continues from the cached policy set regardless.
    let offline_overlimit = offline_secs
        .map(|secs| secs as u64 > u64::from(config.offline_mode_settings.max_offline_days) * 86_400)
        .unwrap_or(false);
    Json(serde_json::json!({
        "connection_state": connection.current,
        "consecutive_failures": connection.consecutive_failures,
        "offline_duration_secs": offline_secs,
        "offline_overlimit": offline_overlimit,
        "last_sync_ts": config.last_sync_ts,
        "configured": config.is_configured(),
        "monitoring": state.monitoring_enabled.load(Ordering::Relaxed),
        "policy_count": state.engine.count(),
        "monitor_count": state.extensions.monitor_count(),
        "action_count": state.extensions.action_count(),
        "pending_shutdown": state.extensions.pending_shutdown(),
        "update_available": state.updater.available(),
        "last_error": state.last_error.read().clone(),
        "version": state.version,
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "hostname": pw_os::host::hostname(),
        "agent_id": config.agent_id,
    }))
}

#[derive(Debug, serde::Deserialize)]
struct HelperCommandBody {
    command: String,
}

async fn helper_command(
    State(state): State<StatusState>,
    Json(body): Json<HelperCommandBody>,
) -> Response {
    match body.command.as_str() {
        "sync" => nudge(&state, HelperCommand::SyncNow).await,
        "restart_monitoring" => {
            state.monitoring_enabled.store(true, Ordering::Relaxed);
            nudge(&state, HelperCommand::RestartMonitoring).await
        }
        "check_update" => nudge(&state, HelperCommand::CheckUpdate).await,
        "get_policies" => Json(serde_json::json!({
            "policies": state.engine.all(),
        }))
        .into_response(),
        "get_processes" => match state.adapter.processes() {
            Ok(processes) => Json(serde_json::json!({ "processes": processes })).into_response(),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response(),
        },
        other => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": format!("unknown command: {other}") })),
        )
            .into_response(),
    }
}

async fn nudge(state: &StatusState, command: HelperCommand) -> Response {
    match state.helper_tx.send(command).await {
        Ok(()) => Json(serde_json::json!({ "accepted": true })).into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "agent is shutting down" })),
        )
            .into_response(),
    }
}

async fn platform_users() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "users": pw_os::host::platform_users() }))
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "error": "not found",
            "note": "this agent does not accept inbound control; all \
                     controller interaction is outbound",
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pw_queue::{ResponseQueue, TelemetryQueue};

    use crate::connection::ConnectionMachine;
    use crate::updater::LogOnlyLauncher;

    struct NullEvaluator;

    #[async_trait::async_trait]
    impl pw_scripthost::ScriptEvaluator for NullEvaluator {
        async fn evaluate(
            &self,
            _source: &str,
            _args: &serde_json::Value,
            _ctx: &pw_scripthost::EvalContext,
        ) -> std::result::Result<serde_json::Value, pw_scripthost::ScriptError> {
            Ok(serde_json::json!(null))
        }
    }

    struct OneProcessAdapter;

    impl ProcessAdapter for OneProcessAdapter {
        fn processes(&self) -> Result<Vec<pw_os::ProcessInfo>> {
            Ok(vec![pw_os::ProcessInfo {
                pid: 42,
                name: "steam.exe".into(),
                exe: None,
                memory_bytes: 0,
            }])
        }
        fn terminate_pid(&self, _pid: u32) -> Result<bool> {
            Ok(false)
        }
    }

    async fn start() -> (SocketAddr, mpsc::Receiver<HelperCommand>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(&tmp.path().join("config.json")).unwrap();
        let engine = Arc::new(PolicyEngine::new(store.clone()));
        let telemetry = Arc::new(TelemetryQueue::open(tmp.path(), None).unwrap());
        let responses = Arc::new(ResponseQueue::open(tmp.path(), None).unwrap());
        let extensions = Arc::new(
            ExtensionManager::new(
                &tmp.path().join("plugins"),
                Arc::new(NullEvaluator),
                telemetry,
                responses,
                Arc::new(OneProcessAdapter),
            )
            .unwrap(),
        );
        let (helper_tx, helper_rx) = mpsc::channel(8);
        let state = StatusState {
            store,
            connection: ConnectionHandle::new(ConnectionMachine::new(
                false,
                Default::default(),
            )),
            engine,
            extensions,
            adapter: Arc::new(OneProcessAdapter),
            updater: Arc::new(LogOnlyLauncher::new(CancellationToken::new())),
            helper_tx,
            monitoring_enabled: Arc::new(AtomicBool::new(true)),
            last_error: Arc::new(RwLock::new(None)),
            started_at: Instant::now(),
            version: "0.1.0-test",
        };
        let (addr, _handle) = serve(state, 0, CancellationToken::new()).await.unwrap();
        (addr, helper_rx, tmp)
    }

    #[tokio::test]
    async fn health_and_status_respond() {
        let (addr, _rx, _tmp) = start().await;
        let health: serde_json::Value = reqwest::get(format!("http://{addr}/api/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["ok"], serde_json::json!(true));

        let status: serde_json::Value =
            reqwest::get(format!("http://{addr}/api/helper/status"))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
        assert_eq!(status["connection_state"], "UNCONFIGURED");
        assert_eq!(status["configured"], serde_json::json!(false));
        assert_eq!(status["policy_count"], serde_json::json!(0));
    }

    #[tokio::test]
    async fn unknown_paths_carry_the_no_inbound_note() {
        let (addr, _rx, _tmp) = start().await;
        let response = reqwest::get(format!("http://{addr}/api/agent/policies"))
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
        let body: serde_json::Value = response.json().await.unwrap();
        assert!(body["note"].as_str().unwrap().contains("inbound control"));
    }

    #[tokio::test]
    async fn sync_command_reaches_the_supervisor_channel() {
        let (addr, mut rx, _tmp) = start().await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{addr}/api/helper/command"))
            .json(&serde_json::json!({ "command": "sync" }))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
        assert_eq!(rx.recv().await, Some(HelperCommand::SyncNow));
    }

    #[tokio::test]
    async fn get_processes_uses_the_adapter() {
        let (addr, _rx, _tmp) = start().await;
        let client = reqwest::Client::new();
        let body: serde_json::Value = client
            .post(format!("http://{addr}/api/helper/command"))
            .json(&serde_json::json!({ "command": "get_processes" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["processes"][0]["name"], "steam.exe");
    }

    #[tokio::test]
    async fn unknown_helper_command_is_rejected() {
        let (addr, _rx, _tmp) = start().await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{addr}/api/helper/command"))
            .json(&serde_json::json!({ "command": "format_disk" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    }

    #[test]
    fn loopback_classification() {
        assert!(is_loopback("127.0.0.1".parse().unwrap()));
        assert!(is_loopback("::1".parse().unwrap()));
        assert!(!is_loopback("192.168.1.20".parse().unwrap()));
        assert!(!is_loopback("10.0.0.1".parse().unwrap()));
    }
}
