//! HTTP clients for the two external collaborators named in §1: the agent
//! process and the sandbox provisioner. Authentication and the collaborators'
//! own wire formats are out of scope (§1 Non-goals); this module only needs
//! a contract to drive `AgentRunnerFactory`/`SandboxService` against, so it
//! defines the smallest one that fits: JSON request/response bodies for the
//! control calls, newline-delimited JSON for the agent's event stream.
//!
//! Modeled on the teacher's `reqwest::Client` provider pattern (a client plus
//! a base URL, auth applied per-request) rather than inventing a new style.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::warn;

use conduit_core::collab::{AgentEvent, AgentRunner, AgentRunnerFactory, AgentSpawnRequest, SandboxService};
use conduit_core::error::{CoreError, Result};

#[derive(Serialize)]
struct CreateSandboxRequest<'a> {
    user_id: &'a str,
}

#[derive(Deserialize)]
struct CreateSandboxResponse {
    sandbox_id: String,
}

#[derive(Serialize)]
struct CheckpointRequest<'a> {
    message_id: &'a str,
}

#[derive(Deserialize)]
struct CheckpointResponse {
    checkpoint_id: Option<String>,
}

pub struct HttpSandboxService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSandboxService {
    pub fn new(base_url: String, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder().timeout(timeout).build().unwrap_or_default(),
            base_url,
        }
    }
}

#[async_trait]
impl SandboxService for HttpSandboxService {
    async fn create(&self, user_id: &str) -> Result<String> {
        let resp = self
            .client
            .post(format!("{}/sandboxes", self.base_url))
            .json(&CreateSandboxRequest { user_id })
            .send()
            .await
            .map_err(|e| CoreError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CoreError::Unavailable(format!("sandbox create returned {}", resp.status())));
        }
        let body: CreateSandboxResponse = resp.json().await.map_err(|e| CoreError::Internal(e.to_string()))?;
        Ok(body.sandbox_id)
    }

    async fn attach(&self, sandbox_id: &str) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/sandboxes/{}/attach", self.base_url, sandbox_id))
            .send()
            .await
            .map_err(|e| CoreError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CoreError::Unavailable(format!("sandbox attach returned {}", resp.status())));
        }
        Ok(())
    }

    async fn create_checkpoint(&self, sandbox_id: &str, message_id: &str) -> Result<Option<String>> {
        let resp = self
            .client
            .post(format!("{}/sandboxes/{}/checkpoints", self.base_url, sandbox_id))
            .json(&CheckpointRequest { message_id })
            .send()
            .await
            .map_err(|e| CoreError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CoreError::Unavailable(format!("sandbox checkpoint returned {}", resp.status())));
        }
        let body: CheckpointResponse = resp.json().await.map_err(|e| CoreError::Internal(e.to_string()))?;
        Ok(body.checkpoint_id)
    }

    async fn delete(&self, sandbox_id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(format!("{}/sandboxes/{}", self.base_url, sandbox_id))
            .send()
            .await
            .map_err(|e| CoreError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            return Err(CoreError::Unavailable(format!("sandbox delete returned {}", resp.status())));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct SpawnResponse {
    run_id: String,
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RunFrame {
    Event { event: AgentEvent },
    SessionId { session_id: String },
    Cost { total_cost_usd: f64 },
}

pub struct HttpAgentRunnerFactory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAgentRunnerFactory {
    pub fn new(base_url: String, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder().timeout(timeout).build().unwrap_or_default(),
            base_url,
        }
    }
}

#[async_trait]
impl AgentRunnerFactory for HttpAgentRunnerFactory {
    async fn spawn(&self, req: AgentSpawnRequest) -> Result<Box<dyn AgentRunner>> {
        let resp = self
            .client
            .post(format!("{}/runs", self.base_url))
            .json(&req)
            .send()
            .await
            .map_err(|e| CoreError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CoreError::Unavailable(format!("agent spawn returned {}", resp.status())));
        }
        let spawned: SpawnResponse = resp.json().await.map_err(|e| CoreError::Internal(e.to_string()))?;

        let stream_resp = self
            .client
            .get(format!("{}/runs/{}/events", self.base_url, spawned.run_id))
            .send()
            .await
            .map_err(|e| CoreError::Unavailable(e.to_string()))?;
        let body_stream: BoxStream<'static, reqwest::Result<Bytes>> = stream_resp.bytes_stream().boxed();

        Ok(Box::new(HttpAgentRunner {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            run_id: spawned.run_id,
            body_stream,
            buffer: String::new(),
            session_id: std::sync::Mutex::new(None),
            total_cost_usd: std::sync::Mutex::new(0.0),
        }))
    }
}

/// Single-use consumer of one run's NDJSON event stream. `session_id` and
/// `total_cost_usd` are updated in place as their respective frames arrive,
/// guarded by a plain mutex since `AgentRunner::session_id`/`total_cost_usd`
/// are read from outside the `&mut self` event-pulling path.
pub struct HttpAgentRunner {
    client: reqwest::Client,
    base_url: String,
    run_id: String,
    body_stream: BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: String,
    session_id: std::sync::Mutex<Option<String>>,
    total_cost_usd: std::sync::Mutex<f64>,
}

#[async_trait]
impl AgentRunner for HttpAgentRunner {
    async fn next_event(&mut self) -> Result<Option<AgentEvent>> {
        loop {
            if let Some(pos) = self.buffer.find('\n') {
                let line: String = self.buffer.drain(..=pos).collect();
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let frame: RunFrame = serde_json::from_str(line).map_err(|e| CoreError::Internal(e.to_string()))?;
                match frame {
                    RunFrame::Event { event } => return Ok(Some(event)),
                    RunFrame::SessionId { session_id } => {
                        *self.session_id.lock().unwrap() = Some(session_id);
                    }
                    RunFrame::Cost { total_cost_usd } => {
                        *self.total_cost_usd.lock().unwrap() = total_cost_usd;
                    }
                }
                continue;
            }

            match self.body_stream.next().await {
                Some(Ok(bytes)) => self.buffer.push_str(&String::from_utf8_lossy(&bytes)),
                Some(Err(e)) => return Err(CoreError::Unavailable(e.to_string())),
                None => return Ok(None),
            }
        }
    }

    async fn cancel(&self) {
        let url = format!("{}/runs/{}/cancel", self.base_url, self.run_id);
        if let Err(e) = self.client.post(&url).send().await {
            warn!(run_id = %self.run_id, error = %e, "agent cancel request failed");
        }
    }

    async fn total_cost_usd(&self) -> f64 {
        *self.total_cost_usd.lock().unwrap()
    }

    async fn context_token_usage(&self, session_id: &str) -> Option<u64> {
        #[derive(Deserialize)]
        struct ContextResponse {
            tokens_used: u64,
        }
        let resp = self
            .client
            .get(format!("{}/sessions/{}/context", self.base_url, session_id))
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.json::<ContextResponse>().await.ok().map(|r| r.tokens_used)
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.lock().unwrap().clone()
    }
}
