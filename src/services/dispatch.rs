use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::core::config::Settings;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::tasks::processing::{self, ClaimError, RunMode};

pub(crate) const SERVICE_TOKEN_HEADER: &str = "x-service-token";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DispatchRequest {
    pub(crate) upload_id: String,
    pub(crate) force_reprocess: bool,
    pub(crate) rerun_detection: bool,
}

impl DispatchRequest {
    pub(crate) fn normal(upload_id: &str) -> Self {
        Self { upload_id: upload_id.to_string(), force_reprocess: false, rerun_detection: false }
    }

    pub(crate) fn forced(upload_id: &str, rerun_detection: bool) -> Self {
        Self { upload_id: upload_id.to_string(), force_reprocess: true, rerun_detection }
    }

    pub(crate) fn mode(&self) -> RunMode {
        if self.force_reprocess {
            RunMode::Forced { rerun_detection: self.rerun_detection }
        } else {
            RunMode::Normal
        }
    }
}

/// Hands an upload to the processing orchestrator. Success means the signal was delivered,
/// not that grading finished.
#[async_trait]
pub(crate) trait Dispatcher: Send + Sync {
    async fn dispatch(&self, state: &AppState, request: DispatchRequest) -> anyhow::Result<()>;
}

/// Posts to the processing trigger of a separate deployment.
#[derive(Debug, Clone)]
pub(crate) struct HttpDispatcher {
    client: Client,
    url: String,
    service_token: String,
}

impl HttpDispatcher {
    pub(crate) fn from_settings(settings: &Settings) -> anyhow::Result<Option<Self>> {
        let Some(url) = settings.pipeline().trigger_url.clone().filter(|url| !url.is_empty())
        else {
            return Ok(None);
        };

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Some(Self { client, url, service_token: settings.pipeline().service_token.clone() }))
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(&self, _state: &AppState, request: DispatchRequest) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.url)
            .header(SERVICE_TOKEN_HEADER, &self.service_token)
            .json(&request)
            .send()
            .await
            .context("trigger unreachable")?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => {
                tracing::debug!(upload_id = %request.upload_id, "Upload already claimed");
                Ok(())
            }
            status => anyhow::bail!("trigger returned HTTP {}", status.as_u16()),
        }
    }
}

/// Claims and runs uploads inside the current process.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LocalDispatcher;

#[async_trait]
impl Dispatcher for LocalDispatcher {
    async fn dispatch(&self, state: &AppState, request: DispatchRequest) -> anyhow::Result<()> {
        match processing::claim(state, &request.upload_id, request.mode()).await {
            Ok(run) => {
                processing::spawn_run(state.clone(), run);
                Ok(())
            }
            Err(ClaimError::AlreadyClaimed(upload_id)) => {
                tracing::debug!(upload_id = %upload_id, "Upload already claimed");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Delivers the signal or parks the upload in `error` so it never sits unseen.
/// The error write only lands while `generation` is still current.
pub(crate) async fn dispatch_or_fail(
    state: &AppState,
    request: DispatchRequest,
    generation: i64,
) -> bool {
    let upload_id = request.upload_id.clone();
    let Err(err) = state.dispatcher().dispatch(state, request).await else {
        return true;
    };

    metrics::counter!("print_dispatch_failures_total").increment(1);
    let message = format!("processing trigger failed: {err:#}");
    tracing::error!(upload_id = %upload_id, generation, error = %message, "Dispatch failed");

    match state
        .store()
        .mark_dispatch_failed(&upload_id, generation, &message, primitive_now_utc())
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            tracing::info!(upload_id = %upload_id, "Upload moved on before dispatch failure was recorded")
        }
        Err(store_err) => {
            tracing::error!(upload_id = %upload_id, error = %store_err, "Failed to record dispatch failure")
        }
    }

    false
}
