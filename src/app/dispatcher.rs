use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::Instrument as _;

use crate::app::queue::InProcessQueue;
use crate::app::runner::{CurationRunner, RunOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    InProcess,
    Worker,
}

impl ExecutionMode {
    pub fn from_env() -> anyhow::Result<Self> {
        let raw =
            std::env::var("SOURCEGATE_EXECUTION_MODE").unwrap_or_else(|_| "inprocess".to_string());
        Self::parse(&raw).with_context(|| {
            format!("invalid SOURCEGATE_EXECUTION_MODE={raw:?}. expected one of: inprocess, worker")
        })
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "inprocess" => Ok(Self::InProcess),
            "worker" => Ok(Self::Worker),
            other => anyhow::bail!("unsupported execution mode: {other}"),
        }
    }
}

/// Shared secret guarding `POST /internal/attempts/:id/run`, read from
/// `SOURCEGATE_WORKER_AUTH_TOKEN`. Blank values count as unset.
pub fn worker_token_from_env() -> Option<String> {
    normalize_token(std::env::var("SOURCEGATE_WORKER_AUTH_TOKEN").ok())
}

fn normalize_token(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_owned()).filter(|v| !v.is_empty())
}

/// Hands an attempt to whatever executes curation runs.
#[async_trait]
pub trait AttemptDispatcher: Send + Sync {
    async fn dispatch(&self, attempt_id: &str) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct InProcessDispatcher {
    queue: InProcessQueue,
    runner: Arc<CurationRunner>,
}

impl InProcessDispatcher {
    pub fn new(queue: InProcessQueue, runner: Arc<CurationRunner>) -> Self {
        Self { queue, runner }
    }
}

#[async_trait]
impl AttemptDispatcher for InProcessDispatcher {
    async fn dispatch(&self, attempt_id: &str) -> anyhow::Result<()> {
        let runner = Arc::clone(&self.runner);
        let id = attempt_id.to_string();
        let span = tracing::info_span!("curation_run", attempt_id = %id);
        let run = async move {
            if let RunOutcome::Failed(message) = runner.run_attempt(&id).await {
                tracing::debug!(%message, "run recorded as failed");
            }
        };
        if !self.queue.spawn(attempt_id, run.instrument(span)) {
            tracing::info!(attempt_id, "curation run already queued");
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct WorkerDispatcher {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl WorkerDispatcher {
    pub fn new(base_url: &str, auth_token: Option<String>) -> anyhow::Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            anyhow::bail!("worker base url is empty");
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            auth_token,
        })
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let base_url = std::env::var("SOURCEGATE_WORKER_URL")
            .context("SOURCEGATE_WORKER_URL is required for worker execution mode")?;
        if base_url.trim().is_empty() {
            anyhow::bail!("SOURCEGATE_WORKER_URL is empty");
        }
        let auth_token = worker_token_from_env().context(
            "SOURCEGATE_WORKER_AUTH_TOKEN must be set and non-empty for worker execution mode",
        )?;
        Self::new(&base_url, Some(auth_token))
    }
}

#[async_trait]
impl AttemptDispatcher for WorkerDispatcher {
    #[tracing::instrument(skip(self), fields(worker = %self.base_url))]
    async fn dispatch(&self, attempt_id: &str) -> anyhow::Result<()> {
        let url = format!("{}/internal/attempts/{attempt_id}/run", self.base_url);
        let mut req = self.client.post(url);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.context("send worker dispatch request")?;
        if resp.status().is_success() || resp.status() == StatusCode::ACCEPTED {
            return Ok(());
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("worker dispatch failed ({status}): {body}");
    }
}
