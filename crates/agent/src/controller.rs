//! Outbound HTTP client for the controller.
//!
//! All controller traffic originates here: handshake, policy sync,
//! heartbeat, plugin-data upload, command poll, and violation reports.
//! Every request carries the standard header set; every response is
//! scanned for credential-upgrade headers so a first contact under the
//! machine id is promoted to a real agent identity.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;

use pw_discovery::Endpoint;
use pw_domain::command::{Command, CommandResult};
use pw_domain::connection::OfflineModeSettings;
use pw_domain::policy::Policy;
use pw_domain::violation::Violation;
use pw_domain::{Error, Result, VerifyDenied};
use pw_trust::{HandshakePayload, TrustVerifier, VERIFICATION_VALIDITY_SECS};

use crate::config_store::ConfigStore;
use crate::monitor::ViolationSink;

/// Per-request timeout for all controller calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Response headers that upgrade our credentials when present.
const UPGRADE_TOKEN_HEADER: &str = "x-agent-token";
const UPGRADE_ID_HEADER: &str = "x-agent-id";

/// Result of one policy sync.
#[derive(Debug)]
pub struct SyncOutcome {
    pub policies: Vec<Policy>,
    pub offline_mode_settings: Option<OfflineModeSettings>,
}

/// `GET /api/agent/policies` returns either a bare array or an object
/// carrying `policies`; accept both.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PoliciesBody {
    Wrapped {
        policies: Vec<Policy>,
        #[serde(default)]
        offline_mode_settings: Option<OfflineModeSettings>,
    },
    Bare(Vec<Policy>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CommandsBody {
    Wrapped {
        commands: Vec<Command>,
    },
    Bare(Vec<Command>),
}

pub struct ControllerClient {
    http: reqwest::Client,
    store: Arc<ConfigStore>,
    endpoint: RwLock<Option<Endpoint>>,
    last_verification: Mutex<Option<chrono::DateTime<Utc>>>,
    agent_version: &'static str,
    hostname: String,
}

impl ControllerClient {
    pub fn new(store: Arc<ConfigStore>, agent_version: &'static str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self {
            http,
            store,
            endpoint: RwLock::new(None),
            last_verification: Mutex::new(None),
            agent_version,
            hostname: pw_os::host::hostname(),
        })
    }

    // ── Endpoint management ──────────────────────────────────────────

    pub fn set_endpoint(&self, endpoint: Endpoint) {
        *self.endpoint.write() = Some(endpoint);
    }

    pub fn clear_endpoint(&self) {
        *self.endpoint.write() = None;
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint.read().clone()
    }

    fn base_url(&self) -> Result<String> {
        let endpoint = self
            .endpoint()
            .ok_or_else(|| Error::Transport("no controller endpoint resolved".into()))?;
        Ok(format!("http://{}:{}", endpoint.host, endpoint.port))
    }

    // ── Request plumbing ─────────────────────────────────────────────

    /// Attach the standard header set from the current config snapshot.
    fn with_headers(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let config = self.store.snapshot();
        let mut req = req
            .header("Content-Type", "application/json")
            .header("X-Agent-Version", self.agent_version)
            .header("X-Agent-Platform", pw_os::host::platform())
            .header("X-Hostname", &self.hostname);
        if let Some(machine_id) = &config.machine_id {
            req = req.header("X-Machine-Id", machine_id);
        }
        if let Some(agent_id) = &config.agent_id {
            req = req.header("X-Agent-Id", agent_id);
        }
        if let Some(token) = &config.auth_token {
            req = req.bearer_auth(token);
        }
        req
    }

    /// Persist credential upgrades delivered in response headers. This is
    /// the first-contact registration path: the controller answers a
    /// machine-id-only request with a minted token and agent id.
    fn absorb_upgrades(&self, response: &reqwest::Response) -> Result<()> {
        let token = header_value(response, UPGRADE_TOKEN_HEADER);
        let agent_id = header_value(response, UPGRADE_ID_HEADER);
        if token.is_none() && agent_id.is_none() {
            return Ok(());
        }
        self.store.update(|c| {
            if let Some(token) = token {
                c.auth_token = Some(token);
            }
            if let Some(agent_id) = agent_id {
                if c.agent_id.as_deref() != Some(agent_id.as_str()) {
                    tracing::info!(agent_id = %agent_id, "agent id assigned by controller");
                }
                c.agent_id = Some(agent_id);
            }
        })?;
        Ok(())
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = req
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        self.absorb_upgrades(&response)?;
        if !response.status().is_success() {
            return Err(Error::Protocol(format!(
                "controller returned {}",
                response.status()
            )));
        }
        Ok(response)
    }

    // ── Trust ────────────────────────────────────────────────────────

    /// Fetch and verify a handshake unless a verification newer than 24 h
    /// is on record. Failures never mutate policy state; the caller feeds
    /// them to the connection machine.
    pub async fn ensure_verified(&self) -> Result<()> {
        {
            let last = self.last_verification.lock();
            if let Some(at) = *last {
                if (Utc::now() - at).num_seconds() < VERIFICATION_VALIDITY_SECS {
                    return Ok(());
                }
            }
        }

        let config = self.store.snapshot();
        let verifier = TrustVerifier::from_config(config.pinned_public_key.as_deref())?;
        let payload = self.handshake().await?;
        verifier.verify(&payload, Utc::now().timestamp_millis())?;
        *self.last_verification.lock() = Some(Utc::now());
        tracing::info!(controller_version = %payload.version, "controller verified");
        Ok(())
    }

    /// Drop the cached verification (e.g. after the endpoint changes).
    pub fn invalidate_verification(&self) {
        *self.last_verification.lock() = None;
    }

    pub async fn handshake(&self) -> Result<HandshakePayload> {
        let url = format!("{}/api/agent/handshake", self.base_url()?);
        let response = self
            .with_headers(self.http.get(&url))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "handshake request failed");
                Error::ParentUnverified(VerifyDenied::NetworkError)
            })?;
        self.absorb_upgrades(&response)?;
        if !response.status().is_success() {
            tracing::error!(status = %response.status(), "handshake rejected");
            return Err(Error::ParentUnverified(VerifyDenied::NetworkError));
        }
        response
            .json::<HandshakePayload>()
            .await
            .map_err(|_| Error::ParentUnverified(VerifyDenied::MalformedResponse))
    }

    // ── Operations ───────────────────────────────────────────────────

    pub async fn sync_policies(&self) -> Result<SyncOutcome> {
        self.ensure_verified().await?;
        let url = format!("{}/api/agent/policies", self.base_url()?);
        let response = self.send(self.with_headers(self.http.get(&url))).await?;
        let body: PoliciesBody = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("policy response: {e}")))?;
        let outcome = match body {
            PoliciesBody::Wrapped {
                policies,
                offline_mode_settings,
            } => SyncOutcome {
                policies,
                offline_mode_settings,
            },
            PoliciesBody::Bare(policies) => SyncOutcome {
                policies,
                offline_mode_settings: None,
            },
        };
        Ok(outcome)
    }

    pub async fn heartbeat(&self, metadata: serde_json::Value) -> Result<()> {
        self.ensure_verified().await?;
        let url = format!("{}/api/agent/heartbeat", self.base_url()?);
        let body = serde_json::json!({ "metadata": metadata });
        self.send(self.with_headers(self.http.post(&url)).json(&body))
            .await?;
        Ok(())
    }

    /// Ship queued telemetry and action responses in one batch.
    pub async fn upload_plugin_data(
        &self,
        plugin_data: serde_json::Value,
        action_responses: &[pw_domain::plugin_data::ActionResponse],
    ) -> Result<()> {
        self.ensure_verified().await?;
        let url = format!("{}/api/agent/plugin-data", self.base_url()?);
        let config = self.store.snapshot();
        let body = serde_json::json!({
            "agent_id": config.agent_id,
            "plugin_data": plugin_data,
            "action_responses": action_responses,
            "timestamp": Utc::now().timestamp_millis(),
        });
        self.send(self.with_headers(self.http.post(&url)).json(&body))
            .await?;
        Ok(())
    }

    /// Pull pending commands, acknowledging the previous batch's results.
    /// A plain pull is a GET; carrying results upgrades it to a POST.
    pub async fn poll_commands(&self, results: &[CommandResult]) -> Result<Vec<Command>> {
        self.ensure_verified().await?;
        let url = format!("{}/api/agent/commands", self.base_url()?);
        let request = if results.is_empty() {
            self.with_headers(self.http.get(&url))
        } else {
            self.with_headers(self.http.post(&url))
                .json(&serde_json::json!({ "results": results }))
        };
        let response = self.send(request).await?;
        let body: CommandsBody = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("commands response: {e}")))?;
        Ok(match body {
            CommandsBody::Wrapped { commands } => commands,
            CommandsBody::Bare(commands) => commands,
        })
    }
}

#[async_trait]
impl ViolationSink for ControllerClient {
    async fn report_violation(&self, violation: &Violation) -> Result<()> {
        self.ensure_verified().await?;
        let url = format!("{}/api/agent/violations", self.base_url()?);
        self.send(self.with_headers(self.http.post(&url)).json(violation))
            .await?;
        Ok(())
    }
}

fn header_value(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}
