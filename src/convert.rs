use crate::error::{AppError, AppResult};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

const MAX_TOOL_NAME_LEN: usize = 64;

/// Inbound OpenAI chat-completions request. Unknown fields are ignored;
/// message content stays a raw `Value` because clients send both plain
/// strings and part arrays.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub tools: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub tool_calls: Option<Vec<Value>>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone)]
struct Turn {
    role: Role,
    text: String,
    tool_calls: Vec<Value>,
    tool_results: Vec<Value>,
}

/// Translate an inbound chat request into the upstream `conversationState`
/// payload. Pure: equal inputs produce byte-equal payloads.
pub fn build_payload(
    req: &ChatCompletionRequest,
    model_id: &str,
    profile_arn: Option<&str>,
) -> AppResult<Value> {
    let (system_prompt, turns) = flatten_messages(&req.messages);
    let mut turns = merge_adjacent(turns);

    let tools = convert_tools(req.tools.as_deref())?;

    let current = turns.pop();
    let mut history_turns = turns;

    // The upstream has no dedicated system slot; the prompt rides on the
    // earliest user turn.
    let mut current_prefix: Option<String> = None;
    if !system_prompt.is_empty() {
        match history_turns.first_mut() {
            Some(first) if first.role == Role::User => {
                first.text = prefix_text(&system_prompt, &first.text);
            }
            _ => current_prefix = Some(system_prompt.clone()),
        }
    }

    let mut history: Vec<Value> = history_turns
        .iter()
        .map(|turn| history_entry(turn, model_id))
        .collect();

    let current_message = match current {
        Some(turn) if turn.role == Role::Assistant => {
            history.push(history_entry(&turn, model_id));
            build_user_input("Continue".to_string(), Vec::new(), tools, model_id)
        }
        Some(turn) => {
            let mut text = turn.text.clone();
            if let Some(prefix) = current_prefix {
                text = prefix_text(&prefix, &text);
            }
            if text.is_empty() && !turn.tool_results.is_empty() {
                text = "Continue".to_string();
            }
            build_user_input(text, turn.tool_results.clone(), tools, model_id)
        }
        None => build_user_input(current_prefix.unwrap_or_default(), Vec::new(), tools, model_id),
    };

    let mut conversation_state = Map::new();
    conversation_state.insert("chatTriggerType".to_string(), json!("MANUAL"));
    conversation_state.insert(
        "conversationId".to_string(),
        json!(conversation_id(&req.messages)),
    );
    conversation_state.insert("currentMessage".to_string(), current_message);
    if !history.is_empty() {
        conversation_state.insert("history".to_string(), Value::Array(history));
    }

    let mut payload = Map::new();
    payload.insert(
        "conversationState".to_string(),
        Value::Object(conversation_state),
    );
    if let Some(arn) = profile_arn {
        if !arn.is_empty() {
            payload.insert("profileArn".to_string(), json!(arn));
        }
    }
    Ok(Value::Object(payload))
}

/// Drop system messages into a single prompt, rewrite tool results as
/// synthetic user turns, and normalize the rest into typed turns.
fn flatten_messages(messages: &[ChatMessage]) -> (String, Vec<Turn>) {
    let mut system_parts: Vec<String> = Vec::new();
    let mut turns: Vec<Turn> = Vec::new();
    let mut pending_results: Vec<Value> = Vec::new();

    for message in messages {
        match message.role.as_str() {
            "system" => {
                let text = extract_text(&message.content);
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            "tool" => {
                pending_results.push(tool_result_entry(
                    message.tool_call_id.as_deref().unwrap_or(""),
                    &message.content,
                ));
            }
            role => {
                if !pending_results.is_empty() {
                    turns.push(Turn {
                        role: Role::User,
                        text: String::new(),
                        tool_calls: Vec::new(),
                        tool_results: std::mem::take(&mut pending_results),
                    });
                }
                let role = if role == "assistant" {
                    Role::Assistant
                } else {
                    Role::User
                };
                turns.push(Turn {
                    role,
                    text: extract_text(&message.content),
                    tool_calls: message.tool_calls.clone().unwrap_or_default(),
                    tool_results: Vec::new(),
                });
            }
        }
    }
    if !pending_results.is_empty() {
        turns.push(Turn {
            role: Role::User,
            text: String::new(),
            tool_calls: Vec::new(),
            tool_results: pending_results,
        });
    }

    (system_parts.join("\n"), turns)
}

/// Consecutive turns with the same role collapse into one; texts join with a
/// newline, tool call and result lists concatenate.
fn merge_adjacent(turns: Vec<Turn>) -> Vec<Turn> {
    let mut merged: Vec<Turn> = Vec::new();
    for turn in turns {
        match merged.last_mut() {
            Some(last) if last.role == turn.role => {
                if !turn.text.is_empty() {
                    if last.text.is_empty() {
                        last.text = turn.text;
                    } else {
                        last.text.push('\n');
                        last.text.push_str(&turn.text);
                    }
                }
                last.tool_calls.extend(turn.tool_calls);
                last.tool_results.extend(turn.tool_results);
            }
            _ => merged.push(turn),
        }
    }
    merged
}

fn history_entry(turn: &Turn, model_id: &str) -> Value {
    match turn.role {
        Role::User => {
            let mut user_input = Map::new();
            user_input.insert("content".to_string(), json!(non_empty(&turn.text, "(empty)")));
            user_input.insert("modelId".to_string(), json!(model_id));
            user_input.insert("origin".to_string(), json!("AI_EDITOR"));
            if !turn.tool_results.is_empty() {
                user_input.insert(
                    "userInputMessageContext".to_string(),
                    json!({ "toolResults": turn.tool_results }),
                );
            }
            json!({ "userInputMessage": user_input })
        }
        Role::Assistant => {
            let mut response = Map::new();
            response.insert("content".to_string(), json!(non_empty(&turn.text, "(empty)")));
            let tool_uses: Vec<Value> = turn.tool_calls.iter().map(tool_use_entry).collect();
            if !tool_uses.is_empty() {
                response.insert("toolUses".to_string(), Value::Array(tool_uses));
            }
            json!({ "assistantResponseMessage": response })
        }
    }
}

fn build_user_input(
    text: String,
    tool_results: Vec<Value>,
    tools: Vec<Value>,
    model_id: &str,
) -> Value {
    let mut user_input = Map::new();
    user_input.insert("content".to_string(), json!(text));
    user_input.insert("modelId".to_string(), json!(model_id));
    user_input.insert("origin".to_string(), json!("AI_EDITOR"));
    let mut context = Map::new();
    if !tools.is_empty() {
        context.insert("tools".to_string(), Value::Array(tools));
    }
    if !tool_results.is_empty() {
        context.insert("toolResults".to_string(), Value::Array(tool_results));
    }
    if !context.is_empty() {
        user_input.insert("userInputMessageContext".to_string(), Value::Object(context));
    }
    json!({ "userInputMessage": user_input })
}

fn tool_result_entry(tool_use_id: &str, content: &Value) -> Value {
    let text = extract_text(content);
    json!({
        "content": [{ "text": non_empty(&text, "(empty result)") }],
        "status": "success",
        "toolUseId": tool_use_id,
    })
}

fn tool_use_entry(tool_call: &Value) -> Value {
    let function = tool_call.get("function").cloned().unwrap_or(Value::Null);
    let arguments = function.get("arguments").cloned().unwrap_or(Value::Null);
    let input = match &arguments {
        Value::String(raw) => serde_json::from_str::<Value>(raw).unwrap_or_else(|_| json!({})),
        Value::Object(_) | Value::Array(_) => arguments.clone(),
        _ => json!({}),
    };
    json!({
        "name": function.get("name").and_then(|v| v.as_str()).unwrap_or(""),
        "input": input,
        "toolUseId": tool_call.get("id").and_then(|v| v.as_str()).unwrap_or(""),
    })
}

fn convert_tools(tools: Option<&[Value]>) -> AppResult<Vec<Value>> {
    let Some(tools) = tools else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for tool in tools {
        if tool.get("type").and_then(|v| v.as_str()).unwrap_or("function") != "function" {
            continue;
        }
        let Some(function) = tool.get("function") else {
            continue;
        };
        let name = function
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        if name.is_empty() {
            continue;
        }
        if name.len() > MAX_TOOL_NAME_LEN {
            return Err(AppError::invalid_request(format!(
                "tool name exceeds {MAX_TOOL_NAME_LEN} characters: {name}"
            ))
            .with_param("tools"));
        }
        let description = function
            .get("description")
            .and_then(|v| v.as_str())
            .filter(|d| !d.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Tool: {name}"));
        let schema = sanitize_schema(function.get("parameters").unwrap_or(&json!({})));
        out.push(json!({
            "toolSpecification": {
                "name": name,
                "description": description,
                "inputSchema": { "json": schema },
            }
        }));
    }
    Ok(out)
}

/// The upstream schema validator rejects `additionalProperties` and empty
/// `required` arrays; strip both, recursively.
fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                if key == "additionalProperties" {
                    continue;
                }
                if key == "required" && value.as_array().map(|a| a.is_empty()).unwrap_or(false) {
                    continue;
                }
                out.insert(key.clone(), sanitize_schema(value));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        _ => schema.clone(),
    }
}

/// Text view of a message content value. Part arrays concatenate their text
/// parts in order; anything else in the array is dropped.
fn extract_text(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Array(parts) => {
            let mut out = String::new();
            let mut dropped = 0usize;
            for part in parts {
                match part {
                    Value::String(text) => out.push_str(text),
                    Value::Object(obj) => {
                        if let Some(text) = obj.get("text").and_then(|v| v.as_str()) {
                            out.push_str(text);
                        } else {
                            dropped += 1;
                        }
                    }
                    _ => dropped += 1,
                }
            }
            if dropped > 0 {
                tracing::debug!(dropped, "dropped non-text content parts");
            }
            out
        }
        other => other.to_string(),
    }
}

fn prefix_text(prefix: &str, text: &str) -> String {
    if text.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}\n\n{text}")
    }
}

fn non_empty(text: &str, placeholder: &str) -> String {
    if text.is_empty() {
        placeholder.to_string()
    } else {
        text.to_string()
    }
}

/// Stable conversation id derived from the shape of the request, so a
/// resubmitted conversation keeps its id.
fn conversation_id(messages: &[ChatMessage]) -> String {
    let mut hasher = Sha256::new();
    let picked: Vec<&ChatMessage> = if messages.len() <= 3 {
        messages.iter().collect()
    } else {
        messages
            .iter()
            .take(3)
            .chain(messages.last())
            .collect()
    };
    for message in picked {
        hasher.update(message.role.as_bytes());
        hasher.update([0]);
        let text: String = extract_text(&message.content).chars().take(100).collect();
        hasher.update(text.as_bytes());
        hasher.update([0]);
    }
    let digest = format!("{:x}", hasher.finalize());
    digest.chars().take(16).collect()
}
