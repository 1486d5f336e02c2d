// Driftlab Engine — Model Gateway
//
// Uniform call contract to an external OpenAI-compatible chat model and
// embedding model. The agent and judge roles carry independent endpoints,
// temperatures, and timeouts (the judge is colder). Transient failures are
// retried with capped exponential backoff; terminal failures degrade to
// well-defined sentinels instead of aborting the episode.

use crate::atoms::config::{GatewayConfig, GatewayRole, RoleConfig};
use crate::atoms::error::{EngineError, EngineResult};
use async_trait::async_trait;
use log::{error, info, warn};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

// ── Retry policy ───────────────────────────────────────────────────────────

/// Total attempts per call (1 initial + 2 retries).
pub const MAX_ATTEMPTS: u32 = 3;

/// Initial backoff delay in milliseconds (doubles each retry).
const INITIAL_BACKOFF_MS: u64 = 200;

/// Check if an HTTP status code represents a transient/retryable error.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504 | 529)
}

/// Backoff before retry `attempt` (1-based): 200 ms, 400 ms, …
async fn backoff(attempt: u32) {
    let delay = INITIAL_BACKOFF_MS * 2u64.pow(attempt.saturating_sub(1));
    tokio::time::sleep(Duration::from_millis(delay)).await;
}

// ── Call contract ──────────────────────────────────────────────────────────

/// Uniform seam over the external chat + embedding models. Safe for
/// concurrent use from many experiment workers.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// One-shot completion for the given caller role.
    async fn complete(
        &self,
        role: GatewayRole,
        system_prompt: &str,
        user_prompt: &str,
    ) -> EngineResult<String>;

    /// Dense vector for a text. Errors surface as `ModelUnavailable`.
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>>;
}

/// Result of a completion threaded through the episode procedure.
/// Gateway degradation is data, not an exception: only genuinely fatal
/// conditions abort the experiment loop.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    Ok(String),
    /// Terminal gateway failure; carries the degradation reason. The
    /// episode records the canned fallback text, forces strategy=polite,
    /// and flags `gateway_fallback` metadata.
    Fallback(String),
}

/// Canned reply recorded when the agent model is unreachable.
pub const FALLBACK_COMPLETION: &str =
    "I'm sorry, I'm having trouble processing your request right now. \
     Please bear with me while I look into it.";

/// Complete, degrading to `Fallback` on terminal gateway failure.
pub async fn complete_or_fallback(
    model: &dyn ChatModel,
    role: GatewayRole,
    system_prompt: &str,
    user_prompt: &str,
) -> CompletionOutcome {
    match model.complete(role, system_prompt, user_prompt).await {
        Ok(text) => CompletionOutcome::Ok(text),
        Err(e) => {
            warn!("[gateway] completion degraded to fallback: {}", e);
            CompletionOutcome::Fallback(e.to_string())
        }
    }
}

/// Embed, degrading to the empty sentinel vector on terminal failure.
pub async fn embed_or_sentinel(model: &dyn ChatModel, text: &str) -> Vec<f32> {
    match model.embed(text).await {
        Ok(v) => v,
        Err(e) => {
            warn!("[gateway] embedding degraded to sentinel: {}", e);
            Vec::new()
        }
    }
}

// ── OpenAI-compatible implementation ───────────────────────────────────────

/// Gateway to any OpenAI-compatible REST API (chat completions and
/// embeddings), with per-role endpoint/model/temperature settings.
pub struct OpenAiGateway {
    client: Client,
    config: GatewayConfig,
}

impl OpenAiGateway {
    pub fn new(config: GatewayConfig) -> Self {
        OpenAiGateway {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            config,
        }
    }

    fn role_config(&self, role: GatewayRole) -> &RoleConfig {
        match role {
            GatewayRole::Agent => &self.config.agent,
            GatewayRole::Judge => &self.config.judge,
        }
    }

    /// Map a reqwest error to the gateway error taxonomy.
    fn classify(e: reqwest::Error, timeout_secs: u64) -> EngineError {
        if e.is_timeout() {
            EngineError::ModelTimeout(timeout_secs * 1000)
        } else {
            EngineError::ModelUnavailable(format!("HTTP request failed: {e}"))
        }
    }

    async fn post_with_retry(
        &self,
        url: &str,
        api_key: &str,
        body: &Value,
        timeout_secs: u64,
        what: &str,
    ) -> EngineResult<Value> {
        let mut last_err = EngineError::ModelUnavailable("no attempt made".into());

        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                backoff(attempt - 1).await;
                warn!("[gateway] {} retry {}/{}", what, attempt, MAX_ATTEMPTS);
            }

            let mut req = self
                .client
                .post(url)
                .header("Content-Type", "application/json")
                .timeout(Duration::from_secs(timeout_secs));
            if !api_key.is_empty() {
                req = req.header("Authorization", format!("Bearer {api_key}"));
            }

            let response = match req.json(body).send().await {
                Ok(r) => r,
                Err(e) => {
                    last_err = Self::classify(e, timeout_secs);
                    // Timeouts consume the whole budget; do not retry them.
                    if matches!(last_err, EngineError::ModelTimeout(_)) {
                        return Err(last_err);
                    }
                    continue;
                }
            };

            let status = response.status().as_u16();
            if !response.status().is_success() {
                let body_text = response.text().await.unwrap_or_default();
                let detail = body_text.chars().take(200).collect::<String>();
                error!("[gateway] {} error {}: {}", what, status, detail);

                // Auth errors are never retried.
                if status == 401 || status == 403 {
                    return Err(EngineError::ModelUnavailable(format!(
                        "auth rejected ({status})"
                    )));
                }
                last_err = EngineError::ModelUnavailable(format!("API error {status}: {detail}"));
                if is_retryable_status(status) && attempt < MAX_ATTEMPTS {
                    continue;
                }
                return Err(last_err);
            }

            return response
                .json::<Value>()
                .await
                .map_err(|e| EngineError::ModelUnavailable(format!("bad {what} body: {e}")));
        }

        Err(last_err)
    }
}

#[async_trait]
impl ChatModel for OpenAiGateway {
    async fn complete(
        &self,
        role: GatewayRole,
        system_prompt: &str,
        user_prompt: &str,
    ) -> EngineResult<String> {
        let rc = self.role_config(role);
        let url = format!("{}/chat/completions", rc.base_url.trim_end_matches('/'));

        let body = json!({
            "model": rc.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "temperature": rc.temperature,
            "max_tokens": rc.max_tokens,
        });

        info!("[gateway] {:?} completion via {} model={}", role, url, rc.model);

        let v = self
            .post_with_retry(&url, &rc.api_key, &body, rc.timeout_secs, "completion")
            .await?;

        v["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                EngineError::ModelUnavailable("no completion content in response".into())
            })
    }

    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        let ec = &self.config.embedding;
        let url = format!("{}/embeddings", ec.base_url.trim_end_matches('/'));

        let body = json!({
            "model": ec.model,
            "input": text,
        });

        let v = self
            .post_with_retry(&url, &ec.api_key, &body, ec.timeout_secs, "embedding")
            .await?;

        let embedding = v["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| {
                EngineError::ModelUnavailable("no 'data[0].embedding' array in response".into())
            })?
            .iter()
            .filter_map(|x| x.as_f64().map(|f| f as f32))
            .collect::<Vec<f32>>();

        if embedding.is_empty() {
            return Err(EngineError::ModelUnavailable(
                "empty embedding vector in response".into(),
            ));
        }

        Ok(embedding)
    }
}
