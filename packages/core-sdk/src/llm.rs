use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::models::Role;
use crate::payload::{ContentPart, PayloadContent, PayloadMessage};
use crate::providers::CallParameters;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_DEFAULT_MAX_TOKENS: u64 = 1024;

/**
 * \brief 模型服务协议类型。
 */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    #[serde(alias = "openai-compatible")]
    OpenAI,
    #[serde(alias = "anthropic")]
    Claude,
    #[serde(alias = "google")]
    Gemini,
}

impl ProviderKind {
    pub fn default_api_base(self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "https://api.openai.com",
            ProviderKind::Claude => "https://api.anthropic.com",
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com",
        }
    }
}

/**
 * \brief 已就绪的模型服务客户端：一次调用要么返回完整文本，要么失败。
 */
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        messages: &[PayloadMessage],
        params: &CallParameters,
    ) -> Result<String>;
}

/**
 * \brief 基于 reqwest 的 HTTP 客户端，按协议类型分派请求。
 */
pub struct HttpChatClient {
    kind: ProviderKind,
    api_base: String,
    api_key: String,
    http: reqwest::Client,
}

impl HttpChatClient {
    pub fn new(
        kind: ProviderKind,
        api_base: Option<&str>,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let api_base = api_base
            .unwrap_or_else(|| kind.default_api_base())
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            kind,
            api_base,
            api_key: api_key.to_string(),
            http,
        })
    }

    async fn chat_once_openai(
        &self,
        model: &str,
        messages: &[PayloadMessage],
        params: &CallParameters,
    ) -> Result<String> {
        let url = format!("{}/v1/chat/completions", normalize_openai_base(&self.api_base));
        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": false
        });
        merge_params(&mut body, params, &[]);

        let resp = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("request failed: {} -> {}", status, text));
        }
        let v: Value = resp.json().await?;
        extract_openai_content(&v).ok_or_else(|| anyhow!("unexpected completion payload: {}", v))
    }

    async fn chat_once_claude(
        &self,
        model: &str,
        messages: &[PayloadMessage],
        params: &CallParameters,
    ) -> Result<String> {
        let url = format!("{}/v1/messages", self.api_base);
        let mut body = json!({
            "model": model,
            "max_tokens": params.max_tokens().unwrap_or(ANTHROPIC_DEFAULT_MAX_TOKENS),
            "messages": anthropic_payload(messages),
        });
        merge_params(&mut body, params, &["max_tokens"]);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("x-api-key", HeaderValue::from_str(&self.api_key)?);
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );

        let resp = self.http.post(url).headers(headers).json(&body).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("claude request failed: {} -> {}", status, text));
        }
        let v: Value = resp.json().await?;
        extract_anthropic_content(&v).ok_or_else(|| anyhow!("unexpected claude payload: {}", v))
    }

    async fn chat_once_gemini(
        &self,
        model: &str,
        messages: &[PayloadMessage],
        params: &CallParameters,
    ) -> Result<String> {
        let base = normalize_gemini_base(&self.api_base);
        let url = format!("{}/models/{}:generateContent", base, model);
        let body = json!({
            "contents": gemini_payload(messages),
            "generationConfig": gemini_generation_config(params),
        });

        let resp = self
            .http
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("gemini request failed: {} -> {}", status, text));
        }
        let v: Value = resp.json().await?;
        extract_gemini_content(&v).ok_or_else(|| anyhow!("unexpected gemini payload: {}", v))
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn complete(
        &self,
        model: &str,
        messages: &[PayloadMessage],
        params: &CallParameters,
    ) -> Result<String> {
        match self.kind {
            ProviderKind::OpenAI => self.chat_once_openai(model, messages, params).await,
            ProviderKind::Claude => self.chat_once_claude(model, messages, params).await,
            ProviderKind::Gemini => self.chat_once_gemini(model, messages, params).await,
        }
    }
}

fn merge_params(body: &mut Value, params: &CallParameters, skip: &[&str]) {
    if let Some(obj) = body.as_object_mut() {
        for (key, value) in params.iter() {
            if !skip.contains(&key.as_str()) {
                obj.insert(key.clone(), value.clone());
            }
        }
    }
}

fn extract_openai_content(v: &Value) -> Option<String> {
    v.get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

fn extract_anthropic_content(v: &Value) -> Option<String> {
    v.get("content").and_then(|arr| arr.as_array()).map(|arr| {
        arr.iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("")
    })
}

fn extract_gemini_content(v: &Value) -> Option<String> {
    let first = v.get("candidates")?.as_array()?.first()?;
    if let Some(parts) = first
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
    {
        return Some(
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join(""),
        );
    }
    first
        .get("output")
        .and_then(|t| t.as_str())
        .map(|s| s.to_string())
}

/**
 * \brief 拆分 `data:<mime>;base64,<data>` 形式的内联图片。
 */
fn split_data_uri(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64")?;
    Some((mime, data))
}

fn anthropic_payload(messages: &[PayloadMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| {
            let blocks: Vec<Value> = match &msg.content {
                PayloadContent::Text(text) => vec![json!({"type": "text", "text": text})],
                PayloadContent::Parts(parts) => parts
                    .iter()
                    .map(|part| match part {
                        ContentPart::Text { text } => json!({"type": "text", "text": text}),
                        ContentPart::ImageUrl { image_url } => match split_data_uri(&image_url.url) {
                            Some((mime, data)) => json!({
                                "type": "image",
                                "source": {"type": "base64", "media_type": mime, "data": data}
                            }),
                            None => json!({
                                "type": "image",
                                "source": {"type": "url", "url": image_url.url}
                            }),
                        },
                    })
                    .collect(),
            };
            json!({"role": msg.role.as_str(), "content": blocks})
        })
        .collect()
}

fn gemini_payload(messages: &[PayloadMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| {
            let role = match msg.role {
                Role::Assistant => "model",
                Role::User => "user",
            };
            let parts: Vec<Value> = match &msg.content {
                PayloadContent::Text(text) => vec![json!({"text": text})],
                PayloadContent::Parts(parts) => parts
                    .iter()
                    .map(|part| match part {
                        ContentPart::Text { text } => json!({"text": text}),
                        ContentPart::ImageUrl { image_url } => match split_data_uri(&image_url.url) {
                            Some((mime, data)) => json!({
                                "inline_data": {"mime_type": mime, "data": data}
                            }),
                            None => json!({
                                "file_data": {"file_uri": image_url.url}
                            }),
                        },
                    })
                    .collect(),
            };
            json!({"role": role, "parts": parts})
        })
        .collect()
}

fn gemini_generation_config(params: &CallParameters) -> Value {
    let mut config = Map::new();
    for (key, value) in params.iter() {
        let mapped = match key.as_str() {
            "max_tokens" | "max_output_tokens" => "maxOutputTokens",
            "top_p" => "topP",
            "top_k" => "topK",
            "temperature" => "temperature",
            _ => continue,
        };
        config.insert(mapped.to_string(), value.clone());
    }
    Value::Object(config)
}

fn normalize_openai_base(api_base: &str) -> &str {
    api_base.strip_suffix("/v1").unwrap_or(api_base)
}

fn normalize_gemini_base(api_base: &str) -> String {
    let trimmed = api_base.trim_end_matches('/');
    if trimmed.ends_with("/v1")
        || trimmed.ends_with("/v1beta")
        || trimmed.contains("/v1/")
        || trimmed.contains("/v1beta/")
    {
        trimmed.to_string()
    } else {
        format!("{}/v1beta", trimmed)
    }
}
