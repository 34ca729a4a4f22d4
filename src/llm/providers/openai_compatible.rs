use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::errors::{WebClawError, WebClawResult};
use crate::llm::provider::LlmProvider;
use crate::llm::sse_parser;
use crate::llm::types::{
    CallConfig, ChatMessage, FunctionCall, LlmResponse, StreamChunk, StreamChunkKind, ToolCall,
    ToolDef,
};

/// Tool call accumulator entry: (id, type, name, accumulated_arguments).
type ToolCallBuilder = (String, String, String, String);

pub struct OpenAiCompatibleProvider {
    id: String,
    api_base: String,
    api_key: String,
    client: reqwest::Client,
    chunk_tx: Option<mpsc::UnboundedSender<StreamChunk>>,
}

impl OpenAiCompatibleProvider {
    pub fn new(id: String, api_base: String, api_key: String) -> Self {
        Self {
            id,
            api_base,
            api_key,
            client: reqwest::Client::new(),
            chunk_tx: None,
        }
    }

    /// Forward every parsed chunk to `tx` as it arrives (for live display).
    pub fn with_chunk_sink(mut self, tx: mpsc::UnboundedSender<StreamChunk>) -> Self {
        self.chunk_tx = Some(tx);
        self
    }

    fn forward(&self, chunk: &StreamChunk) {
        if let Some(tx) = &self.chunk_tx {
            let _ = tx.send(chunk.clone());
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.id
    }

    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDef>,
        cfg: &CallConfig,
    ) -> WebClawResult<LlmResponse> {
        let mut body = serde_json::json!({
            "model": cfg.model,
            "messages": &messages,
            "stream": cfg.stream,
            "temperature": cfg.temperature,
        });

        if !tools.is_empty() {
            body["tools"] = serde_json::to_value(&tools)?;
            body["tool_choice"] = serde_json::json!("auto");
        }

        tracing::debug!(
            provider = %self.id,
            model = %cfg.model,
            stream = cfg.stream,
            messages = messages.len(),
            "sending LLM request"
        );
        tracing::debug!(body = %sanitized_body(&body), "request body (base64 omitted)");

        let response = self
            .client
            .post(&self.api_base)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let err_body = response.text().await.unwrap_or_default();
            return Err(WebClawError::LlmProvider(format!("{}: {}", status, err_body)));
        }

        if cfg.stream {
            self.handle_stream(response).await
        } else {
            self.handle_json(response).await
        }
    }
}

impl OpenAiCompatibleProvider {
    /// Accumulates an SSE stream into one response, forwarding chunks as they arrive.
    async fn handle_stream(&self, response: reqwest::Response) -> WebClawResult<LlmResponse> {
        let mut byte_stream = response.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();

        let mut resp_content = String::new();
        let mut resp_reasoning = String::new();
        let mut tc_builders: BTreeMap<usize, ToolCallBuilder> = BTreeMap::new();

        'stream: while let Some(result) = byte_stream.next().await {
            pending.extend_from_slice(&result?);

            // Only split on complete lines so multi-byte characters survive chunk boundaries.
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let chunk = match sse_parser::parse_sse_line(line) {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::debug!("SSE parse skipped: {e}");
                        continue;
                    }
                };
                self.forward(&chunk);

                match chunk.kind {
                    StreamChunkKind::Reasoning => resp_reasoning.push_str(&chunk.content),
                    StreamChunkKind::Content => resp_content.push_str(&chunk.content),
                    StreamChunkKind::ToolCall => {
                        merge_tool_call_deltas(&chunk.content, &mut tc_builders)
                    }
                    StreamChunkKind::Error => {
                        return Err(WebClawError::LlmProvider(chunk.content));
                    }
                    StreamChunkKind::Done => break 'stream,
                }
            }
        }

        let tool_calls = build_tool_calls(tc_builders);

        tracing::info!(
            content_len = resp_content.len(),
            reasoning_len = resp_reasoning.len(),
            tool_calls = tool_calls.len(),
            tools = ?tool_calls.iter().map(|tc| tc.function.name.as_str()).collect::<Vec<_>>(),
            "LLM stream complete"
        );

        Ok(LlmResponse {
            content: resp_content,
            reasoning: resp_reasoning,
            tool_calls,
        })
    }

    async fn handle_json(&self, response: reqwest::Response) -> WebClawResult<LlmResponse> {
        let json: serde_json::Value = response.json().await?;
        let parsed = parse_completion(&json)?;

        tracing::info!(
            content_len = parsed.content.len(),
            tool_calls = parsed.tool_calls.len(),
            "LLM JSON response received"
        );

        if !parsed.content.is_empty() {
            self.forward(&StreamChunk {
                kind: StreamChunkKind::Content,
                content: parsed.content.clone(),
            });
        }
        self.forward(&StreamChunk {
            kind: StreamChunkKind::Done,
            content: String::new(),
        });

        Ok(parsed)
    }
}

/// Extracts content and tool calls from a non-streaming completion body.
fn parse_completion(json: &serde_json::Value) -> WebClawResult<LlmResponse> {
    if let Some(message) = json["error"]["message"].as_str() {
        return Err(WebClawError::LlmProvider(message.to_string()));
    }
    let message = &json["choices"][0]["message"];
    if message.is_null() {
        return Err(WebClawError::LlmProvider(
            "completion has no choices[0].message".into(),
        ));
    }

    let content = message["content"].as_str().unwrap_or("").to_string();
    let reasoning = message["reasoning_content"].as_str().unwrap_or("").to_string();

    let tool_calls: Vec<ToolCall> = message["tool_calls"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .map(|tc| ToolCall {
                    id: tc["id"].as_str().unwrap_or("").to_string(),
                    call_type: tc["type"].as_str().unwrap_or("function").to_string(),
                    function: FunctionCall {
                        name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                        arguments: tc["function"]["arguments"]
                            .as_str()
                            .unwrap_or("{}")
                            .to_string(),
                    },
                })
                .filter(|tc| !tc.function.name.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Ok(LlmResponse {
        content,
        reasoning,
        tool_calls,
    })
}

/// Clone of the request body with image payloads replaced, for logging only.
fn sanitized_body(body: &serde_json::Value) -> String {
    let mut log_body = body.clone();
    if let Some(msgs) = log_body.get_mut("messages").and_then(|m| m.as_array_mut()) {
        for msg in msgs {
            let Some(parts) = msg.get_mut("content").and_then(|c| c.as_array_mut()) else {
                continue;
            };
            for part in parts {
                if part.get("type").and_then(|t| t.as_str()) == Some("image_url") {
                    if let Some(url) = part.get_mut("image_url").and_then(|i| i.get_mut("url")) {
                        *url = serde_json::Value::String("<omitted_base64_image>".to_string());
                    }
                }
            }
        }
    }
    serde_json::to_string(&log_body).unwrap_or_default()
}

/// Merge streaming tool-call delta fragments into the accumulator map (keyed by delta index).
fn merge_tool_call_deltas(chunk_content: &str, builders: &mut BTreeMap<usize, ToolCallBuilder>) {
    let Ok(deltas) = serde_json::from_str::<Vec<serde_json::Value>>(chunk_content) else {
        return;
    };
    for delta in deltas {
        let idx = delta["index"].as_u64().unwrap_or(0) as usize;
        let entry = builders.entry(idx).or_default();

        if let Some(id) = delta["id"].as_str().filter(|s| !s.is_empty()) {
            entry.0 = id.to_string();
        }
        if let Some(t) = delta["type"].as_str().filter(|s| !s.is_empty()) {
            entry.1 = t.to_string();
        }
        if let Some(name) = delta["function"]["name"].as_str() {
            entry.2.push_str(name);
        }
        if let Some(args) = delta["function"]["arguments"].as_str() {
            entry.3.push_str(args);
        }
    }
}

/// Convert accumulated tool-call builders into typed `ToolCall` structs.
/// Calls that arrived without an id get a positional one so results can be paired.
fn build_tool_calls(builders: BTreeMap<usize, ToolCallBuilder>) -> Vec<ToolCall> {
    builders
        .into_iter()
        .filter(|(_, (_, _, name, _))| !name.is_empty())
        .map(|(idx, (id, call_type, name, arguments))| ToolCall {
            id: if id.is_empty() { format!("call_{idx}") } else { id },
            call_type: if call_type.is_empty() {
                "function".to_string()
            } else {
                call_type
            },
            function: FunctionCall { name, arguments },
        })
        .collect()
}
