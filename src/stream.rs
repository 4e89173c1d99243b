use crate::error::{AppError, AppResult};
use crate::parser::{EventStreamParser, FinishReason, StreamEvent};
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Assumed context window when the upstream only reports a usage percentage.
const DEFAULT_MAX_INPUT_TOKENS: f64 = 200_000.0;

pub fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

/// Usage bookkeeping across a response. The upstream's own numbers win when
/// present; otherwise token counts are reconstructed from emitted characters
/// and the reported context-window percentage.
#[derive(Default)]
struct UsageTracker {
    upstream_usage: Option<Value>,
    context_percentage: Option<f64>,
    output_chars: usize,
}

impl UsageTracker {
    fn note_output(&mut self, text: &str) {
        self.output_chars += text.len();
    }

    fn finalize(&self) -> Value {
        let upstream = self.upstream_usage.as_ref();
        let completion_tokens = upstream
            .and_then(|u| u.get("outputTokens"))
            .and_then(|v| v.as_i64())
            .unwrap_or_else(|| (self.output_chars as i64) / 4 + 1);
        let prompt_tokens = upstream
            .and_then(|u| u.get("inputTokens"))
            .and_then(|v| v.as_i64())
            .or_else(|| {
                self.context_percentage.filter(|p| *p > 0.0).map(|percent| {
                    let total = (percent / 100.0 * DEFAULT_MAX_INPUT_TOKENS) as i64;
                    (total - completion_tokens).max(0)
                })
            })
            .unwrap_or(0);
        let mut usage = json!({
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        });
        if let Some(raw) = upstream {
            usage["credits_used"] = raw.clone();
        }
        usage
    }
}

struct ChunkWriter {
    completion_id: String,
    created: i64,
    model: String,
    first: bool,
}

impl ChunkWriter {
    fn new(model: String) -> Self {
        Self {
            completion_id: completion_id(),
            created: Utc::now().timestamp(),
            model,
            first: true,
        }
    }

    fn delta(&mut self, mut delta: Value) -> Value {
        if self.first {
            delta["role"] = json!("assistant");
            self.first = false;
        }
        json!({
            "id": self.completion_id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{ "index": 0, "delta": delta, "finish_reason": Value::Null }],
        })
    }

    fn terminal(&self, finish: FinishReason, usage: Value) -> Value {
        json!({
            "id": self.completion_id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{ "index": 0, "delta": {}, "finish_reason": finish.as_str() }],
            "usage": usage,
        })
    }
}

/// Streaming translation task: pulls the upstream body, feeds the parser,
/// and pushes OpenAI chunks into the channel backing the client's SSE
/// stream. Pull-driven end to end — the upstream is only read when the
/// channel has room, and a dropped receiver (client gone) ends the task,
/// which drops the upstream response with it.
/// Each item sent is one SSE `data:` payload; the handler wraps them into
/// `Event`s as the client drains the stream.
pub async fn stream_completion(
    response: reqwest::Response,
    model: String,
    tx: mpsc::Sender<String>,
) {
    let mut parser = EventStreamParser::new();
    let mut writer = ChunkWriter::new(model);
    let mut usage = UsageTracker::default();
    let mut tool_indices: HashMap<String, u64> = HashMap::new();
    let mut finish: Option<FinishReason> = None;
    let mut transport_failed = false;

    let mut body = response.bytes_stream();
    loop {
        // A closed channel means the client went away; returning here drops
        // the upstream response and with it the connection.
        let chunk = tokio::select! {
            _ = tx.closed() => return,
            chunk = body.next() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        match chunk {
            Ok(bytes) => {
                for event in parser.feed(&bytes) {
                    if !emit_event(event, &mut writer, &mut usage, &mut tool_indices, &mut finish, &tx)
                        .await
                    {
                        return;
                    }
                }
            }
            Err(err) => {
                tracing::warn!("upstream body failed mid-stream: {err}");
                transport_failed = true;
                break;
            }
        }
    }

    for event in parser.finish() {
        if !emit_event(event, &mut writer, &mut usage, &mut tool_indices, &mut finish, &tx).await {
            return;
        }
    }
    if let Some(diagnostic) = parser.diagnostic() {
        tracing::warn!("upstream stream was malformed: {diagnostic}");
    }

    let finish = if transport_failed {
        FinishReason::Error
    } else {
        finish.unwrap_or(FinishReason::Stop)
    };
    let terminal = writer.terminal(finish, usage.finalize());
    if tx.send(terminal.to_string()).await.is_err() {
        return;
    }
    let _ = tx.send("[DONE]".to_string()).await;
}

/// Render one parser event as an outbound chunk. Returns false once the
/// client has gone away.
async fn emit_event(
    event: StreamEvent,
    writer: &mut ChunkWriter,
    usage: &mut UsageTracker,
    tool_indices: &mut HashMap<String, u64>,
    finish: &mut Option<FinishReason>,
    tx: &mpsc::Sender<String>,
) -> bool {
    let chunk = match event {
        StreamEvent::TextDelta(text) => {
            usage.note_output(&text);
            Some(writer.delta(json!({ "content": text })))
        }
        StreamEvent::ToolCallStart { id, name } => {
            let index = tool_indices.len() as u64;
            tool_indices.insert(id.clone(), index);
            Some(writer.delta(json!({
                "tool_calls": [{
                    "index": index,
                    "id": id,
                    "type": "function",
                    "function": { "name": name, "arguments": "" },
                }]
            })))
        }
        StreamEvent::ToolCallInputDelta { id, fragment } => {
            usage.note_output(&fragment);
            let index = tool_indices.get(&id).copied().unwrap_or(0);
            Some(writer.delta(json!({
                "tool_calls": [{
                    "index": index,
                    "function": { "arguments": fragment },
                }]
            })))
        }
        StreamEvent::ToolCallStop { .. } => None,
        StreamEvent::Usage(raw) => {
            usage.upstream_usage = Some(raw);
            None
        }
        StreamEvent::ContextUsage(percent) => {
            usage.context_percentage = Some(percent);
            None
        }
        StreamEvent::StreamEnd { finish: reason } => {
            *finish = Some(reason);
            None
        }
    };
    match chunk {
        Some(chunk) => tx.send(chunk.to_string()).await.is_ok(),
        None => true,
    }
}

#[derive(Default)]
struct ToolCallBuffer {
    id: String,
    name: String,
    arguments: String,
}

/// Non-streaming mode: drain the whole upstream stream, then shape a single
/// `chat.completion` object.
pub async fn collect_completion(response: reqwest::Response, model: &str) -> AppResult<Value> {
    let mut parser = EventStreamParser::new();
    let mut events: Vec<StreamEvent> = Vec::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let bytes = chunk.map_err(|err| {
            AppError::upstream_unavailable(format!("upstream body failed: {err}"))
        })?;
        events.extend(parser.feed(&bytes));
    }
    events.extend(parser.finish());

    let mut content = String::new();
    let mut tool_calls: Vec<ToolCallBuffer> = Vec::new();
    let mut open: HashMap<String, usize> = HashMap::new();
    let mut usage = UsageTracker::default();
    let mut finish = FinishReason::Stop;
    for event in events {
        match event {
            StreamEvent::TextDelta(text) => {
                usage.note_output(&text);
                content.push_str(&text);
            }
            StreamEvent::ToolCallStart { id, name } => {
                open.insert(id.clone(), tool_calls.len());
                tool_calls.push(ToolCallBuffer {
                    id,
                    name,
                    arguments: String::new(),
                });
            }
            StreamEvent::ToolCallInputDelta { id, fragment } => {
                usage.note_output(&fragment);
                if let Some(&slot) = open.get(&id) {
                    tool_calls[slot].arguments.push_str(&fragment);
                }
            }
            StreamEvent::ToolCallStop { .. } => {}
            StreamEvent::Usage(raw) => usage.upstream_usage = Some(raw),
            StreamEvent::ContextUsage(percent) => usage.context_percentage = Some(percent),
            StreamEvent::StreamEnd { finish: reason } => finish = reason,
        }
    }

    if finish == FinishReason::Error {
        let diagnostic = parser.diagnostic().unwrap_or("malformed upstream stream");
        return Err(AppError::parse_error(diagnostic));
    }

    let mut message = json!({ "role": "assistant", "content": content });
    if !tool_calls.is_empty() {
        let calls: Vec<Value> = tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": if call.arguments.is_empty() {
                            "{}".to_string()
                        } else {
                            call.arguments.clone()
                        },
                    },
                })
            })
            .collect();
        message["tool_calls"] = Value::Array(calls);
    }

    Ok(json!({
        "id": completion_id(),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [{ "index": 0, "message": message, "finish_reason": finish.as_str() }],
        "usage": usage.finalize(),
    }))
}
