//! The extraction capability: a chat-completion call that turns a system
//! instruction plus a text body into free-form text.
//!
//! Every request/response pair is appended to a JSONL audit file.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::LlmSettings;
use crate::error::{HunterError, Result};
use crate::store::append_jsonl;

#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Serialize)]
struct AuditEntry<'a> {
    time: String,
    model: &'a str,
    system: &'a str,
    user: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// OpenAI-compatible `/chat/completions` client.
pub struct ChatClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    audit_log: PathBuf,
}

impl ChatClient {
    pub fn new(cfg: &LlmSettings, audit_log: PathBuf) -> Result<Self> {
        let api_key = cfg
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var(&cfg.api_key_env).ok());
        if api_key.is_none() {
            warn!("No API key configured; set llm.api_key or ${}", cfg.api_key_env);
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(ChatClient {
            http,
            endpoint: format!("{}/chat/completions", cfg.base_url.trim_end_matches('/')),
            api_key,
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            audit_log,
        })
    }

    async fn request(&self, system: &str, user: &str) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            messages: [
                ChatMessage { role: "system", content: system },
                ChatMessage { role: "user", content: user },
            ],
        };
        let mut req = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(HunterError::Completion(format!("{}: {}", status, text)));
        }
        let parsed: ChatResponse = resp.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| HunterError::Completion("response has no content".into()))
    }

    fn audit(&self, system: &str, user: &str, outcome: &Result<String>) {
        let entry = AuditEntry {
            time: Utc::now().to_rfc3339(),
            model: &self.model,
            system,
            user,
            response: outcome.as_ref().ok().map(String::as_str),
            error: outcome.as_ref().err().map(|e| e.to_string()),
        };
        if let Err(e) = append_jsonl(&self.audit_log, &entry) {
            warn!("Failed to write audit log {}: {}", self.audit_log.display(), e);
        }
    }
}

#[async_trait]
impl Completion for ChatClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        debug!("completion request: {} chars", user.len());
        let outcome = self.request(system, user).await;
        self.audit(system, user, &outcome);
        outcome
    }
}
