//! Detection of tool calls embedded in streamed answer text
//!
//! Calls look like `[[tool:NAME(ARGS)]]`. Text that might be the start of a
//! call is held back until it either completes or provably is not a call;
//! anything malformed ends up as literal text.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::tool::ToolSpec;

const CALL_OPEN: &str = "[[tool:";
const CALL_CLOSE: &str = ")]]";

/// Upper bound on held-back text; beyond it the text is released as literal
pub const MAX_HOLDBACK_BYTES: usize = 8 * 1024;

static TOOL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.-]*$").expect("valid tool name regex"));

static ARG_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid argument key regex"));

/// A complete, parsed tool call
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// The call exactly as it appeared in the answer
    pub raw_text: String,
    /// Detection order within the turn
    pub index: usize,
    pub tool_name: String,
    pub arguments: Value,
}

/// One piece of scanned answer text
#[derive(Debug, Clone, PartialEq)]
pub enum Scan {
    Text(String),
    Call(ToolCall),
}

enum Candidate {
    /// A full call spanning this many bytes
    Complete(usize),
    /// Could still become a call
    Incomplete,
    /// Provably not a call
    Invalid,
}

/// Incremental tool-call scanner for one segment
#[derive(Debug)]
pub struct ToolCallInterpreter {
    enabled: bool,
    next_index: usize,
    pending: String,
}

impl ToolCallInterpreter {
    /// `first_index` continues the turn-wide call numbering
    pub fn new(enabled: bool, first_index: usize) -> Self {
        Self {
            enabled,
            next_index: first_index,
            pending: String::new(),
        }
    }

    /// A scanner that treats everything as literal text
    pub fn disabled() -> Self {
        Self::new(false, 0)
    }

    /// Stop detecting calls; held-back text comes out as literal with the next push
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Index the next detected call will get
    pub fn next_index(&self) -> usize {
        self.next_index
    }

    /// Feed answer text; returns what can be decided so far, in order
    pub fn push(&mut self, text: &str) -> Vec<Scan> {
        self.pending.push_str(text);
        let mut out = Vec::new();

        if !self.enabled {
            self.release(self.pending.len(), &mut out);
            return out;
        }

        loop {
            let Some(start) = self.pending.find(CALL_OPEN) else {
                let hold = partial_open_suffix(&self.pending);
                self.release(self.pending.len() - hold, &mut out);
                break;
            };
            self.release(start, &mut out);

            match scan_candidate(&self.pending) {
                Candidate::Complete(len) => {
                    let raw: String = self.pending.drain(..len).collect();
                    match parse_call(&raw) {
                        Some((tool_name, arguments)) => {
                            let index = self.next_index;
                            self.next_index += 1;
                            out.push(Scan::Call(ToolCall {
                                raw_text: raw,
                                index,
                                tool_name,
                                arguments,
                            }));
                        }
                        None => {
                            tracing::debug!("Malformed tool call left as text: {}", raw);
                            push_text(&mut out, raw);
                        }
                    }
                }
                Candidate::Invalid => self.release(CALL_OPEN.len(), &mut out),
                Candidate::Incomplete => {
                    if self.pending.len() > MAX_HOLDBACK_BYTES {
                        tracing::debug!(
                            "Unterminated tool call exceeded {} bytes, releasing as text",
                            MAX_HOLDBACK_BYTES
                        );
                        let next = self.pending[1..]
                            .find(CALL_OPEN)
                            .map(|p| p + 1)
                            .unwrap_or(self.pending.len());
                        self.release(next, &mut out);
                        continue;
                    }
                    break;
                }
            }
        }
        out
    }

    /// End of segment: everything still held back is literal text
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    fn release(&mut self, len: usize, out: &mut Vec<Scan>) {
        if len == 0 {
            return;
        }
        let text: String = self.pending.drain(..len).collect();
        push_text(out, text);
    }
}

/// Append text, merging with a preceding text piece
fn push_text(out: &mut Vec<Scan>, text: String) {
    if let Some(Scan::Text(prev)) = out.last_mut() {
        prev.push_str(&text);
    } else {
        out.push(Scan::Text(text));
    }
}

/// Length of the longest suffix that is a proper prefix of the call opener
fn partial_open_suffix(text: &str) -> usize {
    (1..CALL_OPEN.len())
        .rev()
        .find(|&k| text.ends_with(&CALL_OPEN[..k]))
        .unwrap_or(0)
}

/// Classify text starting with the call opener
fn scan_candidate(text: &str) -> Candidate {
    let rest = &text[CALL_OPEN.len()..];
    let mut chars = rest.char_indices().peekable();

    // NAME
    let mut name_len = 0;
    while let Some(&(i, c)) = chars.peek() {
        let ok = if i == 0 {
            c.is_ascii_alphabetic() || c == '_'
        } else {
            c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
        };
        if !ok {
            break;
        }
        name_len = i + c.len_utf8();
        chars.next();
    }
    match chars.next() {
        None => return Candidate::Incomplete,
        Some((_, '(')) if name_len > 0 => {}
        Some(_) => return Candidate::Invalid,
    }

    // ARGS up to the first closer outside a quoted string
    let args_start = CALL_OPEN.len() + name_len + 1;
    let body = &text[args_start..];
    let mut quotes = QuoteTracker::new(Some('('));
    for (i, c) in body.char_indices() {
        if !quotes.step(c) {
            continue;
        }
        if c == ')' && body[i..].starts_with(CALL_CLOSE) {
            return Candidate::Complete(args_start + i + CALL_CLOSE.len());
        }
    }
    Candidate::Incomplete
}

/// Split a complete call into its name and parsed arguments
fn parse_call(raw: &str) -> Option<(String, Value)> {
    let inner = raw.strip_prefix(CALL_OPEN)?.strip_suffix(CALL_CLOSE)?;
    let (name, args) = inner.split_once('(')?;
    if !TOOL_NAME.is_match(name) {
        return None;
    }
    match parse_arguments(args) {
        Ok(arguments) => Some((name.to_string(), arguments)),
        Err(e) => {
            tracing::debug!("Unparseable arguments for tool '{}': {}", name, e);
            None
        }
    }
}

/// Parse ARGS: empty, a JSON object, or `key=value` pairs.
///
/// A value is a JSON literal when it parses as one and a string otherwise;
/// quoted values may contain commas.
pub fn parse_arguments(args: &str) -> Result<Value, String> {
    let args = args.trim();
    if args.is_empty() {
        return Ok(Value::Object(Map::new()));
    }

    if args.starts_with('{') {
        return match serde_json::from_str::<Value>(args) {
            Ok(value @ Value::Object(_)) => Ok(value),
            Ok(_) => Err("arguments must be a JSON object".to_string()),
            Err(e) => Err(format!("invalid JSON arguments: {}", e)),
        };
    }

    let mut map = Map::new();
    for pair in split_top_level(args) {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got '{}'", pair))?;
        let key = key.trim();
        if !ARG_KEY.is_match(key) {
            return Err(format!("invalid argument name '{}'", key));
        }
        map.insert(key.to_string(), parse_value(value.trim()));
    }
    Ok(Value::Object(map))
}

fn parse_value(raw: &str) -> Value {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return value;
    }
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    Value::String(raw.to_string())
}

/// Split on commas that are outside quotes and brackets
fn split_top_level(args: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quotes = QuoteTracker::new(None);
    let mut start = 0;

    for (i, c) in args.char_indices() {
        if !quotes.step(c) {
            continue;
        }
        match c {
            '[' | '{' => depth += 1,
            ']' | '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&args[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&args[start..]);
    parts
}

/// Tracks quoted strings while scanning arguments. A single quote only opens
/// a string at the start of a value, so apostrophes in bare words stay literal.
struct QuoteTracker {
    quote: Option<char>,
    escaped: bool,
    prev: Option<char>,
}

impl QuoteTracker {
    fn new(prev: Option<char>) -> Self {
        Self {
            quote: None,
            escaped: false,
            prev,
        }
    }

    /// Returns true when `c` is outside any string and is not a delimiter
    fn step(&mut self, c: char) -> bool {
        if let Some(q) = self.quote {
            if self.escaped {
                self.escaped = false;
            } else if c == '\\' {
                self.escaped = true;
            } else if c == q {
                self.quote = None;
                self.prev = Some(c);
            }
            return false;
        }
        let value_start = matches!(self.prev, None | Some('=' | ',' | '(' | '[' | '{' | ':'));
        if c == '"' || (c == '\'' && value_start) {
            self.quote = Some(c);
            return false;
        }
        if !c.is_whitespace() {
            self.prev = Some(c);
        }
        true
    }
}

/// System-prompt section describing the call syntax and the available tools
pub fn tool_instructions(tools: &[ToolSpec]) -> String {
    let mut out = String::from(
        "You can call tools by writing a call directly in your answer:\n\
         [[tool:NAME(key=value, ...)]]\n\
         Arguments may also be a single JSON object: [[tool:NAME({\"key\": \"value\"})]].\n\
         String values containing commas must be quoted. Each result is returned to you \
         as a [[tool_result:NAME ok|error]] block, after which you continue your answer.\n\n\
         Available tools:\n",
    );
    for tool in tools {
        out.push_str(&format!("- {}: {}\n", tool.name, tool.description));
        if let Some(props) = tool.parameters.get("properties").and_then(|p| p.as_object()) {
            if !props.is_empty() {
                out.push_str(&format!("  parameters: {}\n", Value::Object(props.clone())));
            }
        }
    }
    out
}
