//! Turn parsing: raw model text → thought / proposed actions / answer.
//!
//! The textual protocol is fixed:
//!
//! ```text
//! Thought: <free text>
//! Actions: [ {"tag": "...", "name": "...", "path": "...", "input": {...}}, ... ]
//! Answer: <free text>
//! ```
//!
//! [`parse_turn`] is pure and total: malformed input never fails the
//! call, it degrades into a single synthetic error action (array-level
//! fail-fast) that the execution stage short-circuits on.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::action::Action;

static THOUGHT_ANCHOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Thought:\s*").expect("static regex"));
static ACTIONS_ANCHOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Actions:\s*").expect("static regex"));
static ANSWER_ANCHOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Answer:\s*").expect("static regex"));

/// Structured view of one model turn.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedTurn {
    pub thought: Option<String>,
    pub actions: Vec<Action>,
    pub answer: Option<String>,
}

impl ParsedTurn {
    /// True when the turn proposed no tool work at all.
    pub fn is_terminal(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Parses one complete turn of model output.
///
/// Each anchor keyword takes its *last* occurrence — a model may
/// restate `Thought:` or `Answer:` mid-turn and the final statement
/// wins. The actions capture starts at the first `[` after the last
/// `Actions:` anchor and runs through the matching `]`, crossing lines
/// and ignoring brackets inside string literals.
pub fn parse_turn(text: &str) -> ParsedTurn {
    let thought = capture_thought(text);
    let answer = capture_answer(text);
    let actions = match capture_actions_source(text) {
        Some(raw) => decode_actions(raw),
        None => Vec::new(),
    };

    ParsedTurn {
        thought,
        actions,
        answer,
    }
}

fn last_anchor_end(anchor: &Regex, text: &str) -> Option<usize> {
    anchor.find_iter(text).last().map(|m| m.end())
}

fn capture_thought(text: &str) -> Option<String> {
    let start = last_anchor_end(&THOUGHT_ANCHOR, text)?;
    let rest = &text[start..];

    // The thought runs until the next protocol keyword or end of turn.
    let mut end = rest.len();
    for anchor in [&*ACTIONS_ANCHOR, &*ANSWER_ANCHOR] {
        if let Some(m) = anchor.find(rest) {
            end = end.min(m.start());
        }
    }

    let thought = rest[..end].trim();
    (!thought.is_empty()).then(|| thought.to_string())
}

fn capture_answer(text: &str) -> Option<String> {
    let start = last_anchor_end(&ANSWER_ANCHOR, text)?;
    let answer = text[start..].trim();
    (!answer.is_empty()).then(|| answer.to_string())
}

/// Locates the raw `[...]` source of the actions array, if any.
fn capture_actions_source(text: &str) -> Option<&str> {
    let anchor_end = last_anchor_end(&ACTIONS_ANCHOR, text)?;
    let rest = &text[anchor_end..];
    let open = rest.find('[')?;
    Some(&rest[open..])
}

/// Scans from the leading `[` through its matching `]`, tracking string
/// literals and escapes so embedded brackets don't end the span early.
/// Returns `None` for an unterminated array.
fn balanced_array_span(raw: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (pos, ch) in raw.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[..pos + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Escapes raw control characters inside string literals so that a
/// model emitting literal newlines or tabs mid-string still decodes.
fn escape_control_chars(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_string = false;
    let mut escaped = false;

    for ch in raw.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(ch);
                continue;
            }
            match ch {
                '\\' => {
                    escaped = true;
                    out.push(ch);
                }
                '"' => {
                    in_string = false;
                    out.push(ch);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if (c as u32) < 0x20 => {
                    out.push_str(&format!("\\u{:04x}", c as u32));
                }
                c => out.push(c),
            }
        } else {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
        }
    }
    out
}

/// Decodes and shape-checks the actions array. Any failure yields
/// exactly one synthetic error action and drops everything else.
fn decode_actions(raw: &str) -> Vec<Action> {
    let Some(span) = balanced_array_span(raw) else {
        return vec![Action::error("actions array is unterminated")];
    };

    let value: Value = match serde_json::from_str(&escape_control_chars(span)) {
        Ok(value) => value,
        Err(err) => {
            return vec![Action::error(format!(
                "actions array is not valid JSON: syntax error: {err}"
            ))];
        }
    };

    match actions_from_value(value) {
        Ok(actions) => actions,
        Err(message) => vec![Action::error(message)],
    }
}

fn actions_from_value(value: Value) -> Result<Vec<Action>, String> {
    let Value::Array(entries) = value else {
        return Err("actions must be a JSON array".to_string());
    };

    let mut actions = Vec::with_capacity(entries.len());
    for (position, entry) in entries.into_iter().enumerate() {
        let Value::Object(mut fields) = entry else {
            return Err(format!("action {position} must be a JSON object"));
        };

        let tag = match fields.remove("tag") {
            Some(Value::String(tag)) => tag,
            _ => return Err(format!("action {position} requires a string 'tag'")),
        };
        let name = match fields.remove("name") {
            Some(Value::String(name)) => name,
            _ => return Err(format!("action {position} ('{tag}') requires a string 'name'")),
        };
        let path = match fields.remove("path") {
            None | Some(Value::Null) => None,
            Some(Value::String(path)) => Some(path),
            Some(_) => return Err(format!("action '{tag}' has a non-string 'path'")),
        };
        let input = match fields.remove("input") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(input)) => strip_null_entries(input),
            Some(_) => return Err(format!("action '{tag}' has a non-object 'input'")),
        };

        let mut action = Action::new(tag, name).with_input(input);
        action.path = path;
        actions.push(action);
    }
    Ok(actions)
}

/// Drops keys whose value is explicitly `null`, recursively. Upstream
/// schema generation still emits optional fields as `null`; a tool's
/// schema treats an absent key and a null key differently.
fn strip_null_entries(input: Map<String, Value>) -> Map<String, Value> {
    input
        .into_iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| (key, strip_nulls(value)))
        .collect()
}

fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(strip_null_entries(map)),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nulls).collect()),
        other => other,
    }
}
