//! Application message format: what a reassembled message means.
//!
//! Every message starts with a 4-character tag:
//!
//! ```text
//! cmd:<keyword>        command (disconnect, get_all_currencies)
//! txt:<text>           free text, echoed back
//! jsn:<json object>    structured request or response
//! err:<text>           error response
//! ```
//!
//! Messages carried over the older stream transport ended with `\r\n\r\n`.
//! The datagram transport frames by chunk count instead, but text echoes
//! still carry the delimiter and a trailing one on input is tolerated.

use serde::{Deserialize, Serialize};

pub const MESSAGE_END: &str = "\r\n\r\n";
pub const TAG_LEN: usize = 4;

pub const CMD_PREFIX: &str = "cmd:";
pub const TXT_PREFIX: &str = "txt:";
pub const JSON_PREFIX: &str = "jsn:";
pub const ERROR_PREFIX: &str = "err:";

/// Command keyword that ends the session.
pub const CMD_DISCONNECT: &str = "disconnect";
/// Command keyword that lists every series.
pub const CMD_LIST_ALL: &str = "get_all_currencies";

// ── Tags ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Command,
    Text,
    Json,
    Error,
}

impl Tag {
    pub fn prefix(self) -> &'static str {
        match self {
            Tag::Command => CMD_PREFIX,
            Tag::Text => TXT_PREFIX,
            Tag::Json => JSON_PREFIX,
            Tag::Error => ERROR_PREFIX,
        }
    }

    pub fn from_prefix(prefix: &[u8]) -> Option<Tag> {
        match prefix {
            b"cmd:" => Some(Tag::Command),
            b"txt:" => Some(Tag::Text),
            b"jsn:" => Some(Tag::Json),
            b"err:" => Some(Tag::Error),
            _ => None,
        }
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// A tagged application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tag: Tag,
    pub body: String,
}

impl Message {
    pub fn new(tag: Tag, body: impl Into<String>) -> Self {
        Self {
            tag,
            body: body.into(),
        }
    }

    pub fn command(keyword: impl Into<String>) -> Self {
        Self::new(Tag::Command, keyword)
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Tag::Text, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(Tag::Error, text)
    }

    /// Serialize a value as a `jsn:` message.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(Tag::Json, serde_json::to_string(value)?))
    }

    /// Parse a reassembled message. A single trailing `\r\n\r\n` is dropped.
    pub fn parse(raw: &[u8]) -> Result<Message, MessageError> {
        let raw = raw.strip_suffix(MESSAGE_END.as_bytes()).unwrap_or(raw);
        if raw.len() < TAG_LEN {
            return Err(MessageError::MissingTag);
        }
        let (prefix, body) = raw.split_at(TAG_LEN);
        let tag = Tag::from_prefix(prefix)
            .ok_or_else(|| MessageError::UnknownTag(String::from_utf8_lossy(prefix).into()))?;
        let body = std::str::from_utf8(body).map_err(|_| MessageError::InvalidUtf8)?;
        Ok(Message::new(tag, body))
    }

    /// Wire form: tag followed by body.
    pub fn render(&self) -> String {
        format!("{}{}", self.tag.prefix(), self.body)
    }
}

/// Strip the stream-era delimiter from a response, if present.
pub fn strip_delimiter(text: &str) -> &str {
    text.strip_suffix(MESSAGE_END).unwrap_or(text)
}

// ── Commands ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Disconnect,
    ListAll,
    Unknown(String),
}

impl Command {
    pub fn parse(keyword: &str) -> Command {
        match keyword.trim() {
            CMD_DISCONNECT => Command::Disconnect,
            CMD_LIST_ALL => Command::ListAll,
            other => Command::Unknown(other.to_string()),
        }
    }
}

// ── Structured requests ───────────────────────────────────────────────────────

/// Body of a `jsn:` request. `type` selects the operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    AddCurrency { currency: String },
    AddCurrencyValue { currency: String, value: f64 },
    DelCurrency { currency: String },
    GetCurrencyHistory { currency: String },
}

impl Request {
    pub fn currency(&self) -> &str {
        match self {
            Request::AddCurrency { currency }
            | Request::AddCurrencyValue { currency, .. }
            | Request::DelCurrency { currency }
            | Request::GetCurrencyHistory { currency } => currency,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("message shorter than its {}-byte tag", TAG_LEN)]
    MissingTag,

    #[error("Unknown message type: {0:?}")]
    UnknownTag(String),

    #[error("message body is not valid UTF-8")]
    InvalidUtf8,
}
