pub mod mock;
pub mod saptiva;

use serde::{Deserialize, Serialize};

use crate::error::ResearchError;
use mock::MockModel;
use saptiva::SaptivaClient;

/// One message in a chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

/// Internal request type — every model backend accepts this.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![ChatMessage::user(prompt)],
            max_tokens: None,
            temperature: None,
            top_p: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// The last user message — what prompt-classification keys off.
    pub fn last_user_content(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or_default()
    }
}

/// Internal result type — all model backends return this.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    /// Raw provider payload (or a synthetic one in mock mode).
    pub raw: serde_json::Value,
}

/// Model names per agent role. The planner runs on the operations tier,
/// evaluation and writing on the analytical tier.
#[derive(Debug, Clone)]
pub struct ModelTiers {
    pub planner: String,
    pub analyst: String,
    pub writer: String,
}

impl Default for ModelTiers {
    fn default() -> Self {
        Self {
            planner: "Saptiva Ops".to_string(),
            analyst: "Saptiva Cortex".to_string(),
            writer: "Saptiva Cortex".to_string(),
        }
    }
}

/// Model backend, selected once at process init. Prevents per-call
/// mock-mode branches inside the agents — they only ever see this enum.
pub enum ModelBackend {
    Saptiva(SaptivaClient),
    Mock(MockModel),
}

impl ModelBackend {
    pub async fn complete(
        &self,
        req: &CompletionRequest,
    ) -> Result<CompletionResponse, ResearchError> {
        match self {
            Self::Saptiva(client) => client.complete(req).await,
            Self::Mock(mock) => mock.complete(req).await,
        }
    }

    /// Lightweight availability probe. Never errors.
    pub async fn health(&self) -> bool {
        match self {
            Self::Saptiva(client) => client.health().await,
            Self::Mock(_) => true,
        }
    }

    /// Known model catalog for the backend.
    pub fn list_models(&self) -> Vec<&'static str> {
        match self {
            Self::Saptiva(_) => vec![
                "Saptiva Ops",
                "Saptiva Cortex",
                "Saptiva Turbo",
                "Saptiva Legacy",
                "Saptiva Coder",
            ],
            Self::Mock(_) => vec!["mock"],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Saptiva(_) => "saptiva",
            Self::Mock(_) => "mock",
        }
    }
}

impl std::fmt::Debug for ModelBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelBackend")
            .field("backend", &self.name())
            .finish()
    }
}

/// Extract the JSON payload from model output that may wrap it in prose
/// or a fenced code block. Returns the innermost candidate slice.
pub fn extract_json(content: &str) -> &str {
    let trimmed = content.trim();

    // Fenced block: ```json ... ``` or plain ``` ... ```
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }

    // Otherwise slice from the first bracket to the matching last one.
    let open = trimmed.find(['{', '[']);
    let close = trimmed.rfind(['}', ']']);
    if let (Some(a), Some(b)) = (open, close)
        && a < b
    {
        return trimmed[a..=b].trim();
    }

    trimmed
}
