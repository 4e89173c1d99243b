use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};

/// Number of recent text fragments remembered for redelivery suppression.
const DEDUP_WINDOW: usize = 32;
/// Literal prefix that switches the text channel into tool-call capture.
const BRACKET_PREFIX: &str = "[Called ";
/// Bail out of name capture if no opening paren shows up within this many
/// characters; the text was not a tool call after all.
const MAX_TOOL_NAME_CAPTURE: usize = 128;

/// Semantic event decoded from the upstream framed stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ToolCallStart { id: String, name: String },
    ToolCallInputDelta { id: String, fragment: String },
    ToolCallStop { id: String },
    Usage(Value),
    ContextUsage(f64),
    StreamEnd { finish: FinishReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Error,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PayloadKind {
    Content,
    ToolStart,
    ToolInput,
    ToolStop,
    Usage,
    ContextUsage,
}

const PAYLOAD_PATTERNS: &[(&str, PayloadKind)] = &[
    ("{\"content\":", PayloadKind::Content),
    ("{\"followupPrompt\":", PayloadKind::Content),
    ("{\"name\":", PayloadKind::ToolStart),
    ("{\"input\":", PayloadKind::ToolInput),
    ("{\"stop\":", PayloadKind::ToolStop),
    ("{\"usage\":", PayloadKind::Usage),
    ("{\"contextUsagePercentage\":", PayloadKind::ContextUsage),
];

/// Incremental parser over the upstream framed byte stream.
///
/// Frames are length-prefixed binary envelopes around JSON payloads; rather
/// than decode the envelope the parser scans the accumulated bytes for the
/// known payload shapes and walks each one to its matching brace, which makes
/// it indifferent to how the transport slices its chunks. Payloads that have
/// not fully arrived stay buffered.
pub struct EventStreamParser {
    buffer: String,
    recent_fragments: VecDeque<u64>,
    current_tool: Option<String>,
    finished_tools: HashSet<String>,
    saw_tool_call: bool,
    capture: Option<BracketCapture>,
    text_hold: String,
    synthetic_seq: u32,
    diagnostic: Option<String>,
}

impl Default for EventStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            recent_fragments: VecDeque::with_capacity(DEDUP_WINDOW),
            current_tool: None,
            finished_tools: HashSet::new(),
            saw_tool_call: false,
            capture: None,
            text_hold: String::new(),
            synthetic_seq: 0,
            diagnostic: None,
        }
    }

    /// Feed a transport chunk, returning every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();
        while let Some((pos, kind)) = find_next_payload(&self.buffer) {
            let Some(end) = find_matching_brace(&self.buffer, pos) else {
                break;
            };
            let raw: String = self.buffer[pos..=end].to_string();
            self.buffer.drain(..=end);
            match serde_json::from_str::<Value>(&raw) {
                Ok(payload) => self.dispatch(payload, kind, &mut events),
                Err(err) => {
                    tracing::debug!("skipping undecodable payload: {err}");
                }
            }
        }
        events
    }

    /// Signal end of the upstream body. Flushes held text, closes any open
    /// tool call, and emits the terminal event.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.diagnostic.is_none() && find_next_payload(&self.buffer).is_some() {
            self.diagnostic = Some("stream ended inside a frame payload".to_string());
        }
        if let Some(capture) = self.capture.take() {
            // A capture that never closed was not a tool call; give the
            // characters back to the text channel.
            let literal = capture.into_literal();
            if !literal.is_empty() {
                events.push(StreamEvent::TextDelta(literal));
            }
        }
        if !self.text_hold.is_empty() {
            events.push(StreamEvent::TextDelta(std::mem::take(&mut self.text_hold)));
        }
        if let Some(id) = self.current_tool.take() {
            self.finished_tools.insert(id.clone());
            events.push(StreamEvent::ToolCallStop { id });
        }
        let finish = if self.diagnostic.is_some() {
            FinishReason::Error
        } else if self.saw_tool_call {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        };
        events.push(StreamEvent::StreamEnd { finish });
        events
    }

    pub fn diagnostic(&self) -> Option<&str> {
        self.diagnostic.as_deref()
    }

    fn dispatch(&mut self, payload: Value, kind: PayloadKind, events: &mut Vec<StreamEvent>) {
        match kind {
            PayloadKind::Content => {
                if payload.get("followupPrompt").is_some() {
                    return;
                }
                let content = payload.get("content").and_then(|v| v.as_str()).unwrap_or("");
                if content.is_empty() {
                    return;
                }
                if let Some(id) = &self.current_tool {
                    // Inside an open tool call the text channel carries
                    // argument bytes, not assistant prose.
                    events.push(StreamEvent::ToolCallInputDelta {
                        id: id.clone(),
                        fragment: content.to_string(),
                    });
                    return;
                }
                if self.is_redelivery(content) {
                    return;
                }
                self.route_text(content, events);
            }
            PayloadKind::ToolStart => {
                let id = payload
                    .get("toolUseId")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| self.next_synthetic_id());
                if self.finished_tools.contains(&id) {
                    return;
                }
                self.close_current_tool(events);
                let name = payload
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                self.saw_tool_call = true;
                self.current_tool = Some(id.clone());
                events.push(StreamEvent::ToolCallStart { id: id.clone(), name });
                if let Some(input) = payload.get("input") {
                    let fragment = stringify_input(input);
                    if !fragment.is_empty() {
                        events.push(StreamEvent::ToolCallInputDelta {
                            id: id.clone(),
                            fragment,
                        });
                    }
                }
                if payload.get("stop").and_then(|v| v.as_bool()).unwrap_or(false) {
                    self.close_current_tool(events);
                }
            }
            PayloadKind::ToolInput => {
                if let Some(id) = &self.current_tool {
                    let fragment =
                        stringify_input(payload.get("input").unwrap_or(&Value::Null));
                    if !fragment.is_empty() {
                        events.push(StreamEvent::ToolCallInputDelta {
                            id: id.clone(),
                            fragment,
                        });
                    }
                }
            }
            PayloadKind::ToolStop => {
                if payload.get("stop").and_then(|v| v.as_bool()).unwrap_or(false) {
                    self.close_current_tool(events);
                }
            }
            PayloadKind::Usage => {
                if let Some(usage) = payload.get("usage") {
                    events.push(StreamEvent::Usage(usage.clone()));
                }
            }
            PayloadKind::ContextUsage => {
                if let Some(percent) = payload
                    .get("contextUsagePercentage")
                    .and_then(|v| v.as_f64())
                {
                    events.push(StreamEvent::ContextUsage(percent));
                }
            }
        }
    }

    fn close_current_tool(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(id) = self.current_tool.take() {
            self.finished_tools.insert(id.clone());
            events.push(StreamEvent::ToolCallStop { id });
        }
    }

    /// Sliding-window redelivery check over the raw text fragments.
    fn is_redelivery(&mut self, fragment: &str) -> bool {
        let mut hasher = DefaultHasher::new();
        fragment.hash(&mut hasher);
        let fingerprint = hasher.finish();
        if self.recent_fragments.contains(&fingerprint) {
            return true;
        }
        if self.recent_fragments.len() == DEDUP_WINDOW {
            self.recent_fragments.pop_front();
        }
        self.recent_fragments.push_back(fingerprint);
        false
    }

    /// Text channel routing: plain text passes through, `[Called name(...)]`
    /// blocks are captured and re-emitted as a synthetic tool-call triple.
    fn route_text(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        let mut input = std::mem::take(&mut self.text_hold);
        input.push_str(text);

        loop {
            if let Some(capture) = self.capture.as_mut() {
                match capture.consume(&input) {
                    CaptureStep::NeedMore => return,
                    CaptureStep::NotACall(literal) => {
                        self.capture = None;
                        // The reclaimed text starts with the trigger prefix
                        // that proved false. Emit the prefix as text and
                        // rescan the remainder, which may hold a real call.
                        events.push(StreamEvent::TextDelta(BRACKET_PREFIX.to_string()));
                        input = literal[BRACKET_PREFIX.len()..].to_string();
                        continue;
                    }
                    CaptureStep::Complete { name, args, rest } => {
                        self.capture = None;
                        let id = self.next_synthetic_id();
                        self.saw_tool_call = true;
                        self.finished_tools.insert(id.clone());
                        events.push(StreamEvent::ToolCallStart {
                            id: id.clone(),
                            name,
                        });
                        events.push(StreamEvent::ToolCallInputDelta {
                            id: id.clone(),
                            fragment: args,
                        });
                        events.push(StreamEvent::ToolCallStop { id });
                        input = rest;
                        continue;
                    }
                }
            }

            match input.find(BRACKET_PREFIX) {
                Some(idx) => {
                    let before = &input[..idx];
                    if !before.is_empty() {
                        events.push(StreamEvent::TextDelta(before.to_string()));
                    }
                    input = input[idx + BRACKET_PREFIX.len()..].to_string();
                    self.capture = Some(BracketCapture::new());
                }
                None => {
                    self.emit_plain(&mut input, events, true);
                    return;
                }
            }
        }
    }

    /// Emit text, optionally holding back a tail that could still grow into
    /// the capture prefix on the next chunk.
    fn emit_plain(&mut self, input: &mut String, events: &mut Vec<StreamEvent>, hold_tail: bool) {
        let hold = if hold_tail {
            partial_prefix_len(input)
        } else {
            0
        };
        let emit_to = input.len() - hold;
        if emit_to > 0 {
            events.push(StreamEvent::TextDelta(input[..emit_to].to_string()));
        }
        self.text_hold = input[emit_to..].to_string();
        input.clear();
    }

    fn next_synthetic_id(&mut self) -> String {
        self.synthetic_seq += 1;
        format!("call_br_{}", self.synthetic_seq)
    }
}

enum CaptureStep {
    /// The block is still open; all input was absorbed.
    NeedMore,
    /// The captured text turned out not to be a call; hand it back.
    NotACall(String),
    Complete {
        name: String,
        args: String,
        rest: String,
    },
}

/// Capture state for one bracketed tool-call block, resumable across chunk
/// boundaries. Depth counts `[ { (` against their closers, ignoring anything
/// inside string literals.
struct BracketCapture {
    name: String,
    args: String,
    in_args: bool,
    depth: i32,
    in_string: bool,
    escaped: bool,
    args_done: bool,
}

impl BracketCapture {
    fn new() -> Self {
        Self {
            name: String::new(),
            args: String::new(),
            in_args: false,
            depth: 0,
            in_string: false,
            escaped: false,
            args_done: false,
        }
    }

    fn consume(&mut self, input: &str) -> CaptureStep {
        let mut chars = input.char_indices();
        while let Some((idx, ch)) = chars.next() {
            if self.args_done {
                // Expect the closing `]`; anything else stays text.
                let rest_start = if ch == ']' { idx + ch.len_utf8() } else { idx };
                return CaptureStep::Complete {
                    name: std::mem::take(&mut self.name),
                    args: std::mem::take(&mut self.args),
                    rest: input[rest_start..].to_string(),
                };
            }
            if !self.in_args {
                if ch == '(' {
                    self.in_args = true;
                    self.depth = 1;
                    continue;
                }
                if ch == ']' || ch == '\n' || self.name.len() >= MAX_TOOL_NAME_CAPTURE {
                    return CaptureStep::NotACall(self.reclaim(&input[idx..]));
                }
                self.name.push(ch);
                continue;
            }
            // Inside the argument block.
            if self.escaped {
                self.escaped = false;
                self.args.push(ch);
                continue;
            }
            if self.in_string {
                match ch {
                    '\\' => {
                        self.escaped = true;
                        self.args.push(ch);
                    }
                    '"' => {
                        self.in_string = false;
                        self.args.push(ch);
                    }
                    _ => self.args.push(ch),
                }
                continue;
            }
            match ch {
                '"' => {
                    self.in_string = true;
                    self.args.push(ch);
                }
                '(' | '{' | '[' => {
                    self.depth += 1;
                    self.args.push(ch);
                }
                ')' | '}' | ']' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        self.args_done = true;
                    } else {
                        self.args.push(ch);
                    }
                }
                _ => self.args.push(ch),
            }
        }
        if self.args_done {
            // Closing `]` not seen yet; finish on the next chunk.
            return CaptureStep::NeedMore;
        }
        CaptureStep::NeedMore
    }

    /// Reassemble the literal text this capture swallowed.
    fn reclaim(&self, rest: &str) -> String {
        let mut out = String::from(BRACKET_PREFIX);
        out.push_str(&self.name);
        if self.in_args {
            out.push('(');
            out.push_str(&self.args);
        }
        out.push_str(rest);
        out
    }

    fn into_literal(self) -> String {
        self.reclaim("")
    }
}

fn find_next_payload(buffer: &str) -> Option<(usize, PayloadKind)> {
    let mut earliest: Option<(usize, PayloadKind)> = None;
    for (pattern, kind) in PAYLOAD_PATTERNS {
        if let Some(pos) = buffer.find(pattern) {
            if earliest.map(|(p, _)| pos < p).unwrap_or(true) {
                earliest = Some((pos, *kind));
            }
        }
    }
    earliest
}

/// Index of the brace closing the object that opens at `start`, or None if
/// the object is still incomplete. String-aware.
fn find_matching_brace(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Longest tail of `text` that is a proper prefix of the capture trigger.
fn partial_prefix_len(text: &str) -> usize {
    let max = BRACKET_PREFIX.len().min(text.len());
    for len in (1..=max).rev() {
        if !text.is_char_boundary(text.len() - len) {
            continue;
        }
        let tail = &text[text.len() - len..];
        if BRACKET_PREFIX.starts_with(tail) && tail.len() < BRACKET_PREFIX.len() {
            return len;
        }
    }
    0
}

fn stringify_input(input: &Value) -> String {
    match input {
        Value::String(raw) => raw.clone(),
        Value::Null => String::new(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
