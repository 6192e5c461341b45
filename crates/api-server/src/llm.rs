//! Chat model client. `OpenAiChatModel` speaks the OpenAI-compatible
//! `/chat/completions` streaming protocol (server-sent events).

use std::collections::VecDeque;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use taskflow_core::config::LlmConfig;
use taskflow_core::types::ChatRole;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: ChatRole,
    pub content: String,
}

/// Text deltas in arrival order.
pub type TokenStream = BoxStream<'static, anyhow::Result<String>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Start a completion. Errors before the first token are returned here;
    /// later failures arrive through the stream.
    async fn stream_chat(&self, messages: &[PromptMessage]) -> anyhow::Result<TokenStream>;
}

/// Used when no provider key is configured. Every call fails.
pub struct UnconfiguredModel;

#[async_trait]
impl ChatModel for UnconfiguredModel {
    fn model_name(&self) -> &str {
        "unconfigured"
    }

    async fn stream_chat(&self, _messages: &[PromptMessage]) -> anyhow::Result<TokenStream> {
        Err(anyhow!("LLM provider is not configured"))
    }
}

pub struct OpenAiChatModel {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiChatModel {
    /// `None` when no API key is configured.
    pub fn from_config(config: &LlmConfig) -> Option<Self> {
        let api_key = config.api_key.as_deref().filter(|k| !k.is_empty())?;
        info!(model = %config.model, base_url = %config.base_url, "LLM client configured");
        Some(Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            model: config.model.clone(),
        })
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    stream: bool,
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_chat(&self, messages: &[PromptMessage]) -> anyhow::Result<TokenStream> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&CompletionRequest {
                model: &self.model,
                messages,
                stream: true,
            })
            .send()
            .await
            .context("LLM request failed")?
            .error_for_status()
            .context("LLM provider rejected the request")?;

        debug!(model = %self.model, "LLM stream opened");
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(anyhow::Error::from))
            .boxed();
        Ok(sse_deltas(body))
    }
}

struct SseState {
    body: BoxStream<'static, anyhow::Result<Bytes>>,
    buf: Vec<u8>,
    pending: VecDeque<String>,
    done: bool,
}

impl SseState {
    /// Parse every complete line in the buffer.
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.parse_line(&String::from_utf8_lossy(&line));
        }
    }

    fn parse_line(&mut self, line: &str) {
        let Some(data) = line.trim().strip_prefix("data:") else {
            return;
        };
        let data = data.trim();
        if data == "[DONE]" {
            self.done = true;
            return;
        }
        if let Ok(event) = serde_json::from_str::<serde_json::Value>(data) {
            if let Some(text) = event["choices"][0]["delta"]["content"].as_str() {
                if !text.is_empty() {
                    self.pending.push_back(text.to_string());
                }
            }
        }
    }
}

/// Turn a raw SSE byte stream into content deltas.
pub fn sse_deltas(body: BoxStream<'static, anyhow::Result<Bytes>>) -> TokenStream {
    let state = SseState {
        body,
        buf: Vec::new(),
        pending: VecDeque::new(),
        done: false,
    };
    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(text) = st.pending.pop_front() {
                return Some((Ok(text), st));
            }
            if st.done {
                return None;
            }
            match st.body.next().await {
                Some(Ok(chunk)) => {
                    st.buf.extend_from_slice(&chunk);
                    st.drain_lines();
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(e), st));
                }
                None => {
                    let rest = std::mem::take(&mut st.buf);
                    st.parse_line(&String::from_utf8_lossy(&rest));
                    st.done = true;
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&'static str]) -> BoxStream<'static, anyhow::Result<Bytes>> {
        futures::stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    #[tokio::test]
    async fn test_sse_deltas_across_chunks() {
        let body = chunks(&[
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel",
            "lo\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n",
            ": keep-alive\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        ]);
        let out: Vec<String> = sse_deltas(body)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(out, vec!["Hello".to_string(), " world".to_string()]);
    }

    #[tokio::test]
    async fn test_sse_error_ends_stream() {
        let body = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n")),
            Err(anyhow!("connection reset")),
        ])
        .boxed();
        let out: Vec<anyhow::Result<String>> = sse_deltas(body).collect().await;
        assert_eq!(out.len(), 2);
        assert!(out[1].is_err());
    }

    #[tokio::test]
    async fn test_unconfigured_model_fails() {
        assert!(UnconfiguredModel.stream_chat(&[]).await.is_err());
        assert!(OpenAiChatModel::from_config(&LlmConfig::default()).is_none());
    }
}
