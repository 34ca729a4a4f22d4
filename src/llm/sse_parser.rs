use crate::errors::{WebClawError, WebClawResult};
use crate::llm::types::{StreamChunk, StreamChunkKind};

/// Parses one SSE line of an OpenAI-compatible stream.
/// Keep-alives, comments and non-data fields yield `None`.
pub fn parse_sse_line(line: &str) -> WebClawResult<Option<StreamChunk>> {
    let line = line.trim_end_matches('\r');
    if line.is_empty() || line.starts_with(':') {
        return Ok(None);
    }

    // The space after the colon is optional in the SSE grammar.
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();

    if data == "[DONE]" {
        return Ok(Some(done()));
    }

    let json: serde_json::Value =
        serde_json::from_str(data).map_err(|e| WebClawError::SseParsing(e.to_string()))?;

    if let Some(message) = json["error"]["message"].as_str() {
        return Ok(Some(StreamChunk {
            kind: StreamChunkKind::Error,
            content: message.to_string(),
        }));
    }

    let Some(first) = json["choices"].as_array().and_then(|c| c.first()) else {
        return Ok(None);
    };
    let delta = &first["delta"];

    if let Some(reasoning) = non_empty(&delta["reasoning_content"]) {
        return Ok(Some(chunk(StreamChunkKind::Reasoning, reasoning)));
    }

    if let Some(tool_calls) = delta["tool_calls"].as_array().filter(|tc| !tc.is_empty()) {
        let content = serde_json::to_string(tool_calls)
            .map_err(|e| WebClawError::SseParsing(e.to_string()))?;
        return Ok(Some(StreamChunk {
            kind: StreamChunkKind::ToolCall,
            content,
        }));
    }

    if let Some(content) = non_empty(&delta["content"]) {
        return Ok(Some(chunk(StreamChunkKind::Content, content)));
    }

    if first["finish_reason"].as_str().is_some() {
        return Ok(Some(done()));
    }

    Ok(None)
}

fn non_empty(value: &serde_json::Value) -> Option<&str> {
    value.as_str().filter(|s| !s.is_empty())
}

fn chunk(kind: StreamChunkKind, content: &str) -> StreamChunk {
    StreamChunk {
        kind,
        content: content.to_string(),
    }
}

fn done() -> StreamChunk {
    StreamChunk {
        kind: StreamChunkKind::Done,
        content: String::new(),
    }
}
