use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::error::{ConsistencyError, Result};
use crate::llm::generator::{GenerationRequest, TextGenerator};

/// OpenAI-compatible chat-completions client that asks for a JSON object
/// matching the request schema.
pub struct HttpTextGenerator {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    default_temperature: f64,
    default_max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl HttpTextGenerator {
    pub fn new(base_url: String, api_key: String, model: String, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ConsistencyError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            default_temperature: 0.0,
            default_max_tokens: None,
        })
    }

    pub fn with_defaults(mut self, temperature: f64, max_tokens: Option<u32>) -> Self {
        self.default_temperature = temperature;
        self.default_max_tokens = max_tokens;
        self
    }

    fn build_messages(&self, request: &GenerationRequest) -> Vec<Value> {
        let mut system = request.preface.clone().unwrap_or_default();
        if !system.is_empty() {
            system.push_str("\n\n");
        }
        system.push_str(&format!(
            "Respond with a single JSON object matching this schema:\n{}",
            request.schema.json_schema()
        ));

        let mut messages = vec![json!({"role": "system", "content": system})];
        for example in &request.examples {
            messages.push(json!({"role": "user", "content": example.user}));
            messages.push(json!({"role": "assistant", "content": example.assistant.to_string()}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));
        messages
    }

    fn build_body(&self, request: &GenerationRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": self.build_messages(request),
            "response_format": {"type": "json_object"},
            "temperature": request.params.temperature.unwrap_or(self.default_temperature),
        });
        if let Some(max_tokens) = request.params.max_tokens.or(self.default_max_tokens) {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(seed) = request.params.seed {
            body["seed"] = json!(seed);
        }
        body
    }
}

/// Pull the JSON object out of a completion, tolerating prose or code fences
/// around it.
pub fn parse_structured(content: &str) -> Result<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(content.trim()) {
        return Ok(value);
    }
    let re = regex::Regex::new(r"(?s)\{.*\}")
        .map_err(|e| ConsistencyError::Schema(e.to_string()))?;
    let candidate = re
        .find(content)
        .ok_or_else(|| ConsistencyError::Schema(format!("no JSON object in response: {}", content)))?;
    serde_json::from_str(candidate.as_str())
        .map_err(|e| ConsistencyError::Schema(format!("malformed JSON object: {}", e)))
}

#[async_trait]
impl TextGenerator for HttpTextGenerator {
    fn model(&self) -> &str {
        &self.model
    }

    async fn answer(&self, request: &GenerationRequest) -> Result<Value> {
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.build_body(request))
            .send()
            .await
            .map_err(|e| ConsistencyError::Generator(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ConsistencyError::Generator(format!("HTTP {}: {}", status, text)));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| ConsistencyError::Generator(format!("unreadable response: {}", e)))?;

        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ConsistencyError::Generator("empty completion".to_string()))?;

        let value = parse_structured(&content)?;
        request.schema.validate(&value)?;
        Ok(value)
    }
}
