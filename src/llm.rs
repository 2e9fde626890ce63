//! Reqwest-based client for an OpenAI-compatible Chat Completions endpoint,
//! plus the prompt assembly for the dataset context.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::errors::AppError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Compose the augmented prompt sent to the model: dataset context first,
/// then the user's free-text question.
pub fn build_prompt(csv_name: &str, dataset_description: &str, user_prompt: &str) -> String {
    format!(
        "You have a pandas DataFrame called 'data' loaded from '{csv_name}'. \
         Here is the structure of the DataFrame:\n\n\
         {dataset_description}\n\n\
         Please write Python code that works with this DataFrame.\n\n\
         User Prompt: {user_prompt}"
    )
}

#[derive(Debug, Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl ChatClient {
    /// Build a client from the application config.
    ///
    /// Fails with [`AppError::MissingApiKey`] when no credential is
    /// configured; the caller reports that per request rather than aborting
    /// at startup.
    pub fn from_config(cfg: &AppConfig) -> Result<Self, AppError> {
        let api_key = cfg.api_key.clone().ok_or(AppError::MissingApiKey)?;

        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .map_err(|e| AppError::Service(e.to_string()))?;

        Ok(Self {
            http,
            base_url: cfg.api_base_url.trim_end_matches('/').to_string(),
            api_key,
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
        })
    }

    /// Send one message list and return the generated text of the first
    /// choice. Network faults, non-2xx statuses and empty replies all map to
    /// [`AppError::Service`].
    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<String, AppError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| AppError::Service(e.to_string()))?;
        headers.insert(AUTHORIZATION, bearer);

        let body = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
        };

        let resp = self
            .http
            .post(&url)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Service(format!("failed to send chat request: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            let detail = detail.trim();
            return Err(AppError::Service(if detail.is_empty() {
                status.to_string()
            } else {
                format!("{status}: {detail}")
            }));
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| AppError::Service(format!("malformed chat response: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AppError::Service("chat response contained no choices".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_embeds_description_and_user_text() {
        let prompt = build_prompt(
            "autoscout24_data.csv",
            "Columns: ['make', 'price']",
            "average price per make",
        );
        assert!(prompt.starts_with("You have a pandas DataFrame called 'data'"));
        assert!(prompt.contains("loaded from 'autoscout24_data.csv'"));
        assert!(prompt.contains("Columns: ['make', 'price']"));
        assert!(prompt.ends_with("User Prompt: average price per make"));
    }

    #[test]
    fn response_parsing_takes_first_choice() {
        let raw = r#"{
            "id": "chatcmpl-1",
            "choices": [
                {"index": 0, "message": {"role": "assistant", "content": "```python\nprint(1)\n```"}},
                {"index": 1, "message": {"role": "assistant", "content": "ignored"}}
            ]
        }"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap();
        assert_eq!(content, "```python\nprint(1)\n```");
    }

    #[test]
    fn missing_key_is_a_configuration_error() {
        let cfg = AppConfig::default();
        assert!(matches!(
            ChatClient::from_config(&cfg),
            Err(AppError::MissingApiKey)
        ));
    }

    #[test]
    fn chat_request_serializes_expected_contract() {
        let messages = vec![ChatMessage::user("hello")];
        let req = ChatRequest {
            model: "gpt-4.1-mini",
            messages: &messages,
            max_tokens: 300,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["model"], "gpt-4.1-mini");
        assert_eq!(v["max_tokens"], 300);
        assert_eq!(v["messages"][0]["role"], "user");
        assert_eq!(v["messages"][0]["content"], "hello");
    }
}
