//! Saptiva chat-completions client (OpenAI-compatible, SSE streaming).
//!
//! Responses are requested with `stream: true` and accumulated delta by
//! delta. Timeout layers protect against distinct failure modes:
//! - Connect (client-level): dead endpoints, DNS hangs
//! - Headers (scoped around send()): server hangs on response
//! - First-byte: model queued but not generating
//! - Stall: model stopped mid-stream
//! - Generation (read timeout): slow model
//!
//! Transient failures (transport, 5xx, 429) retry with exponential backoff;
//! exhausted retries surface as `ProviderUnavailable`.

use std::time::{Duration, Instant};

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;

use super::{CompletionRequest, CompletionResponse};
use crate::error::ResearchError;

pub const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// Retry attempts for transient transport/5xx failures.
const MAX_RETRIES: u32 = 3;

/// Base backoff between retries; doubles per attempt.
const RETRY_BASE: Duration = Duration::from_secs(1);

/// Duration without any SSE chunk before giving up on the stream.
const STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum time to wait for response headers after sending the request.
const HEADERS_TIMEOUT: Duration = Duration::from_secs(60);

pub struct SaptivaClient {
    client: Client,
    base_url: String,
    api_key: String,
    read_timeout: Duration,
}

/// SSE streaming chunk from the chat completions API.
#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// Result of parsing a single SSE event.
enum ParsedChunk {
    Text(String),
    Done,
    /// Non-content event (keepalive, metadata) — still proves liveness.
    Skip,
}

impl SaptivaClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            read_timeout,
        }
    }

    /// Run a chat completion, retrying transient failures with backoff.
    pub async fn complete(
        &self,
        req: &CompletionRequest,
    ) -> Result<CompletionResponse, ResearchError> {
        let mut last_err = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = RETRY_BASE * 2u32.pow(attempt - 1);
                tracing::warn!(
                    model = req.model,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "retrying saptiva request"
                );
                tokio::time::sleep(delay).await;
            }

            match self.attempt(req).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_transient() => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(
            model = req.model,
            "saptiva unavailable after {MAX_RETRIES} attempts: {}",
            last_err
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default()
        );
        Err(ResearchError::ProviderUnavailable {
            provider: "saptiva".to_string(),
        })
    }

    async fn attempt(
        &self,
        req: &CompletionRequest,
    ) -> Result<CompletionResponse, ResearchError> {
        let start = Instant::now();

        let mut body = serde_json::json!({
            "model": req.model,
            "messages": req.messages,
            "stream": true,
        });
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(top_p) = req.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }

        let send_future = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send();

        let response = tokio::time::timeout(HEADERS_TIMEOUT, send_future)
            .await
            .map_err(|_| ResearchError::Timeout(start.elapsed().as_millis() as u64))?
            .map_err(ResearchError::from)?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ResearchError::RateLimited {
                provider: "saptiva".to_string(),
            });
        }
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(ResearchError::AuthFailed {
                provider: "saptiva".to_string(),
                message: format!("{status}"),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let truncated: String = body.chars().take(500).collect();
            return Err(ResearchError::Upstream {
                provider: "saptiva".to_string(),
                message: format!("{status}: {truncated}"),
                status: Some(status.as_u16()),
            });
        }

        self.read_sse_stream(response, req, start).await
    }

    /// Read the SSE streaming response, accumulating content deltas.
    async fn read_sse_stream(
        &self,
        response: reqwest::Response,
        req: &CompletionRequest,
        start: Instant,
    ) -> Result<CompletionResponse, ResearchError> {
        let mut stream = response.bytes_stream().eventsource();
        let mut accumulated = String::new();

        let generation_deadline = tokio::time::Instant::now() + self.read_timeout;
        let stall_timeout = STALL_TIMEOUT.min(self.read_timeout);
        let mut last_chunk_at = tokio::time::Instant::now();

        // Pin the deadline sleep outside the loop — reset() reuses the timer
        // entry instead of allocating a new Sleep future every iteration.
        let deadline_sleep = tokio::time::sleep_until(generation_deadline);
        tokio::pin!(deadline_sleep);

        loop {
            let effective_deadline = generation_deadline.min(last_chunk_at + stall_timeout);
            deadline_sleep.as_mut().reset(effective_deadline);

            tokio::select! {
                _ = &mut deadline_sleep => {
                    return Err(ResearchError::Timeout(start.elapsed().as_millis() as u64));
                }
                event = stream.next() => match event {
                    Some(Ok(ev)) => {
                        match parse_sse_event(&ev.data) {
                            ParsedChunk::Done => break,
                            ParsedChunk::Text(text) => {
                                last_chunk_at = tokio::time::Instant::now();
                                if accumulated.len() + text.len() > MAX_RESPONSE_BYTES {
                                    return Err(ResearchError::Upstream {
                                        provider: "saptiva".to_string(),
                                        message: format!(
                                            "streaming response too large: >{MAX_RESPONSE_BYTES}B"
                                        ),
                                        status: None,
                                    });
                                }
                                accumulated.push_str(&text);
                            }
                            ParsedChunk::Skip => {
                                last_chunk_at = tokio::time::Instant::now();
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(model = req.model, "SSE stream error: {e}");
                        return Err(ResearchError::Upstream {
                            provider: "saptiva".to_string(),
                            message: "SSE stream error".to_string(),
                            status: None,
                        });
                    }
                    None => {
                        // Stream ended without [DONE] — incomplete response.
                        if accumulated.is_empty() {
                            return Err(ResearchError::Upstream {
                                provider: "saptiva".to_string(),
                                message: "stream ended without [DONE] marker".to_string(),
                                status: None,
                            });
                        }
                        tracing::warn!(
                            model = req.model,
                            bytes = accumulated.len(),
                            "SSE stream ended without [DONE] marker"
                        );
                        break;
                    }
                },
            }
        }

        if accumulated.is_empty() {
            return Err(ResearchError::Upstream {
                provider: "saptiva".to_string(),
                message: "empty streaming response".to_string(),
                status: None,
            });
        }

        tracing::debug!(
            model = req.model,
            bytes = accumulated.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "saptiva completion finished"
        );

        Ok(CompletionResponse {
            raw: serde_json::json!({
                "model": req.model,
                "streamed": true,
                "bytes": accumulated.len(),
            }),
            content: accumulated,
            model: req.model.clone(),
        })
    }

    /// Probe `GET {base}/models`. Returns false on any failure.
    pub async fn health(&self) -> bool {
        let probe = self
            .client
            .get(format!("{}/models", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send();

        match tokio::time::timeout(Duration::from_secs(30), probe).await {
            Ok(Ok(resp)) => resp.status().is_success(),
            _ => false,
        }
    }
}

/// Parse a single chat-completions SSE event.
fn parse_sse_event(data: &str) -> ParsedChunk {
    if data.trim() == "[DONE]" {
        return ParsedChunk::Done;
    }

    let Ok(chunk) = serde_json::from_str::<StreamChunk>(data) else {
        return ParsedChunk::Skip;
    };
    let Some(choice) = chunk.choices.first() else {
        return ParsedChunk::Skip;
    };

    match &choice.delta.content {
        Some(text) if !text.is_empty() => ParsedChunk::Text(text.clone()),
        _ => ParsedChunk::Skip,
    }
}
