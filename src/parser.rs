//! Record parser for Claude Code session logs.
//!
//! Turns one JSONL line into zero or more [`StreamEvent`]s. Pure: no I/O, no state.
//!
//! Only `assistant` and `user` records produce events; every other record type is
//! skipped so new record kinds written by newer CLI versions don't break the stream.

use crate::error::ParseError;
use crate::event::{StreamEvent, StreamKind};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(rename = "agentId", default)]
    agent_id: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    message: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Message<B> {
    #[serde(default = "MessageContent::empty")]
    content: MessageContent<B>,
}

/// Message content is usually an array of blocks; prompts are plain strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessageContent<B> {
    Blocks(Vec<B>),
    Text(String),
}

impl<B> MessageContent<B> {
    fn empty() -> Self {
        Self::Blocks(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AssistantBlock {
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum UserBlock {
    ToolResult {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default)]
        content: Option<ToolResultContent>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

/// Tool output is either a plain string or an array of typed sub-blocks.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ToolResultContent {
    Text(String),
    Blocks(Vec<ResultBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResultBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    #[serde(other)]
    Other,
}

impl ToolResultContent {
    fn into_text(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Blocks(blocks) => blocks
                .into_iter()
                .filter_map(|b| match b {
                    ResultBlock::Text { text } => Some(text),
                    ResultBlock::Other => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Tool arguments the formatter knows how to render.
#[derive(Debug, Default, Deserialize)]
struct ToolInput {
    command: Option<String>,
    description: Option<String>,
    file_path: Option<String>,
    content: Option<String>,
    pattern: Option<String>,
    path: Option<String>,
    prompt: Option<String>,
    query: Option<String>,
}

/// Parse a single log line.
///
/// Blank lines yield no events. Malformed JSON is an error; the caller reports it
/// and moves on to the next line.
pub fn parse_line(line: &str) -> Result<Vec<StreamEvent>, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Vec::new());
    }

    let record: RawRecord = serde_json::from_str(line)?;
    let Some(message) = record.message else {
        return Ok(Vec::new());
    };
    let agent_id = record.agent_id.unwrap_or_default();
    let timestamp = parse_timestamp(record.timestamp.as_deref());

    match record.kind.as_str() {
        "assistant" => parse_assistant(message, &agent_id, timestamp),
        "user" => parse_user(message, &agent_id, timestamp),
        _ => Ok(Vec::new()),
    }
}

/// RFC 3339, falling back to now so one odd timestamp doesn't cost the line.
fn parse_timestamp(ts: Option<&str>) -> DateTime<Utc> {
    ts.and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn parse_assistant(
    message: Value,
    agent_id: &str,
    timestamp: DateTime<Utc>,
) -> Result<Vec<StreamEvent>, ParseError> {
    let message: Message<AssistantBlock> =
        serde_json::from_value(message).map_err(|source| ParseError::Message {
            kind: "assistant",
            source,
        })?;

    let blocks = match message.content {
        MessageContent::Blocks(blocks) => blocks,
        MessageContent::Text(text) => vec![AssistantBlock::Text { text }],
    };

    let mut events = Vec::new();
    for block in blocks {
        match block {
            AssistantBlock::Thinking { thinking } if !thinking.is_empty() => {
                events.push(StreamEvent::new(
                    StreamKind::Thinking,
                    agent_id,
                    timestamp,
                    thinking,
                ));
            }
            AssistantBlock::Text { text } if !text.is_empty() => {
                events.push(StreamEvent::new(StreamKind::Text, agent_id, timestamp, text));
            }
            AssistantBlock::ToolUse { id, name, input } => {
                let content = format_tool_input(&name, &input);
                let mut event =
                    StreamEvent::new(StreamKind::ToolInput, agent_id, timestamp, content);
                event.tool_name = name;
                event.tool_id = id;
                events.push(event);
            }
            _ => {}
        }
    }
    Ok(events)
}

fn parse_user(
    message: Value,
    agent_id: &str,
    timestamp: DateTime<Utc>,
) -> Result<Vec<StreamEvent>, ParseError> {
    let message: Message<UserBlock> =
        serde_json::from_value(message).map_err(|source| ParseError::Message {
            kind: "user",
            source,
        })?;

    // Plain-string content is a human prompt, not tool output.
    let MessageContent::Blocks(blocks) = message.content else {
        return Ok(Vec::new());
    };

    let mut events = Vec::new();
    for block in blocks {
        let UserBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } = block
        else {
            continue;
        };
        let content = content.map(ToolResultContent::into_text).unwrap_or_default();
        let mut event = StreamEvent::new(StreamKind::ToolOutput, agent_id, timestamp, content);
        event.tool_id = tool_use_id;
        event.is_error = is_error;
        events.push(event);
    }
    Ok(events)
}

/// Render tool arguments for display.
///
/// Known tools get a compact rendering; unknown tools, or input that doesn't have
/// the expected shape, fall back to the raw JSON.
pub fn format_tool_input(tool_name: &str, input: &Value) -> String {
    let raw = || input.to_string();
    if !input.is_object() {
        return raw();
    }
    let Ok(args) = serde_json::from_value::<ToolInput>(input.clone()) else {
        return raw();
    };

    let field = |v: Option<String>| v.unwrap_or_default();
    match tool_name {
        "Bash" => {
            let command = field(args.command);
            match args.description.filter(|d| !d.is_empty()) {
                Some(desc) => format!("{command}\n  # {desc}"),
                None => command,
            }
        }
        "Read" | "Edit" => field(args.file_path),
        "Write" => {
            let len = args.content.as_deref().map_or(0, str::len);
            format!("{} ({len} bytes)", field(args.file_path))
        }
        "Glob" => with_search_path(field(args.pattern), args.path),
        "Grep" => with_search_path(format!("/{}/", field(args.pattern)), args.path),
        "WebFetch" | "Task" => field(args.prompt),
        "WebSearch" => field(args.query),
        _ => raw(),
    }
}

fn with_search_path(pattern: String, path: Option<String>) -> String {
    match path.filter(|p| !p.is_empty()) {
        Some(path) => format!("{pattern} in {path}"),
        None => pattern,
    }
}
