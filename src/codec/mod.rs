//! Frame codecs: per-device-family wire formats.
//!
//! A [`FrameCodec`] turns a command code plus arguments into the exact bytes a
//! device expects, and decides which incoming lines complete that command.
//! The session is written once against this trait; each device family only
//! supplies its framing quirks.
//!
//! Two families are provided:
//!
//! - [`AddressFramedCodec`]: `"{channel}{code}{args}º\r"` (pipette pump, balance)
//! - [`TemplateCodec`]: `"DMA,SN{channel},{code},{args},END"` (DMA instrument)

mod address;
mod template;

pub use address::AddressFramedCodec;
pub use template::TemplateCodec;

use crate::error::{SessionError, SessionResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the session treats a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Reads device state; never waits on motion. Used by the feedback poller.
    StatusQuery,
    /// Triggers motion or changes state; pauses feedback and marks the session busy.
    ActuationCommand,
    /// Like an actuation, but the read loop never gives up on elapsed time.
    NoTimeout,
}

impl Classification {
    /// Whether the command pauses feedback and sets `busy`.
    pub fn is_exclusive(self) -> bool {
        !matches!(self, Classification::StatusQuery)
    }

    /// Whether the command's timeout budget applies.
    pub fn honours_timeout(self) -> bool {
        !matches!(self, Classification::NoTimeout)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Classification::StatusQuery => "status_query",
            Classification::ActuationCommand => "actuation",
            Classification::NoTimeout => "no_timeout",
        };
        f.write_str(label)
    }
}

/// A command argument as rendered on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Integer argument (steps, codes, flags)
    Int(i64),
    /// Floating point argument, rendered with Rust's shortest round-trip form
    Float(f64),
    /// Literal text
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl Value {
    /// Parse a CLI-style token: integers first, then floats, else text.
    pub fn parse_token(token: &str) -> Self {
        if let Ok(v) = token.parse::<i64>() {
            Value::Int(v)
        } else if let Ok(v) = token.parse::<f64>() {
            Value::Float(v)
        } else {
            Value::Text(token.to_string())
        }
    }
}

/// A validated, classified command. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    code: String,
    args: Vec<Value>,
    classification: Classification,
}

impl Command {
    /// Command code (e.g. `RI`, `CLR`).
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Arguments in wire order.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// How the session must treat this command.
    pub fn classification(&self) -> Classification {
        self.classification
    }
}

/// Known fault token and its meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorToken {
    /// Literal token as sent by the device
    pub token: &'static str,
    /// Human-readable description
    pub description: &'static str,
}

/// One incoming line as interpreted for a pending command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Line as read, delimiter excluded
    pub raw: Vec<u8>,
    /// Whether the line completes the command
    pub matched: bool,
    /// Payload with protocol framing removed
    pub payload: String,
    /// Fault token, if the line is one
    pub error_token: Option<String>,
}

/// Wire format of one device family.
pub trait FrameCodec: Send + Sync {
    /// Short family name used in logs.
    fn family(&self) -> &'static str;

    /// Classify a command code.
    fn classify(&self, code: &str) -> Classification;

    /// Reject codes this family cannot encode.
    fn validate(&self, code: &str) -> SessionResult<()>;

    /// Produce the exact wire frame for `code` and `args`.
    fn encode(&self, code: &str, args: &[Value]) -> Vec<u8>;

    /// Strip line terminators and framing noise from a raw line.
    fn normalize(&self, raw: &[u8]) -> String;

    /// True if `response` is a fault token or a valid completion for `code`.
    fn is_expected_reply(&self, code: &str, response: &[u8]) -> bool;

    /// Strip protocol framing from a matched reply; identity for acknowledgements.
    fn extract_payload(&self, code: &str, response: &[u8]) -> String;

    /// Fault tokens this family can emit.
    fn error_tokens(&self) -> &'static [ErrorToken];

    /// Whether `code` returns a multi-line body ahead of its completion line.
    ///
    /// The session collects every non-progress line it reads before the
    /// completion and returns them newline-joined as the payload.
    fn accumulates(&self, _code: &str) -> bool {
        false
    }

    /// True for intermediate acknowledgements that neither complete a
    /// command nor carry data (e.g. "received").
    fn is_progress(&self, _response: &[u8]) -> bool {
        false
    }

    /// Tokens that warrant one automatic resend (e.g. "drive busy").
    fn retry_tokens(&self) -> &'static [&'static str] {
        &[]
    }

    /// Description of `token`, if it is a known fault.
    fn describe_error(&self, token: &str) -> Option<&'static str> {
        self.error_tokens()
            .iter()
            .find(|t| t.token == token)
            .map(|t| t.description)
    }

    /// Interpret `raw` as a reply to `code`.
    fn interpret(&self, code: &str, raw: &[u8]) -> Response {
        let normalized = self.normalize(raw);
        let error_token = self.describe_error(&normalized).map(|_| normalized);
        Response {
            raw: raw.to_vec(),
            matched: self.is_expected_reply(code, raw),
            payload: self.extract_payload(code, raw),
            error_token,
        }
    }

    /// Validate and classify a command.
    fn command(&self, code: &str, args: Vec<Value>) -> SessionResult<Command> {
        self.validate(code)?;
        Ok(Command {
            code: code.to_string(),
            args,
            classification: self.classify(code),
        })
    }
}

/// Serializable selection of a codec, used in session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum CodecKind {
    /// `"{channel}{code}{args}º\r"`
    Address {
        /// Device channel (1-9)
        #[serde(default = "default_channel")]
        channel: u8,
    },
    /// `"DMA,SN{channel},{code},{args},END"`
    Template {
        /// Device serial-number slot
        #[serde(default = "default_channel")]
        channel: u8,
    },
}

fn default_channel() -> u8 {
    1
}

impl Default for CodecKind {
    fn default() -> Self {
        CodecKind::Address { channel: 1 }
    }
}

impl CodecKind {
    /// Instantiate the codec.
    pub fn build(&self) -> SessionResult<Box<dyn FrameCodec>> {
        match *self {
            CodecKind::Address { channel } => Ok(Box::new(AddressFramedCodec::new(channel)?)),
            CodecKind::Template { channel } => Ok(Box::new(TemplateCodec::new(channel))),
        }
    }
}

pub(crate) fn invalid(code: &str, reason: impl Into<String>) -> SessionError {
    SessionError::InvalidCommand {
        code: code.to_string(),
        reason: reason.into(),
    }
}
