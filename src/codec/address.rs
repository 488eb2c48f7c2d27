//! Address-framed codec (rLine pipette pump and balance family).
//!
//! Protocol overview:
//! - Frame: `{channel}{code}{args}º\r`, e.g. `"1RI100º\r"` (channel 1, run inwards 100 steps)
//! - Actuations are acknowledged with `ok`
//! - Queries answer with the lower-cased code followed by data: `DP` -> `dp0123`
//! - Faults are the literal tokens `er1`..`er4`
//! - Replies may carry the channel digit in front (`1ok`) and trailing `º`/CR

use super::{invalid, Classification, ErrorToken, FrameCodec, Value};
use crate::error::{SessionError, SessionResult};

/// Queries the feedback poller may issue while the drive is moving.
pub const STATUS_QUERIES: &[&str] = &["DS", "DE", "DP", "DN"];

/// Queries for fixed device information.
pub const STATIC_QUERIES: &[&str] = &["DV", "DM", "DX", "DI", "DO", "DR"];

/// Acknowledgement for actuation commands.
pub const ACK: &str = "ok";

const FRAME_SUFFIX: &str = "º\r";

static ERROR_TOKENS: &[ErrorToken] = &[
    ErrorToken {
        token: "er1",
        description: "The command has not been understood by the module",
    },
    ErrorToken {
        token: "er2",
        description: "The command has been understood but would result in out-of-bounds state",
    },
    ErrorToken {
        token: "er3",
        description: "LRC is configured to be used and the checksum does not match",
    },
    ErrorToken {
        token: "er4",
        description: "The drive is on and the command or query cannot be answered",
    },
];

/// Codec for `{channel}{code}{args}º\r` devices.
#[derive(Debug, Clone)]
pub struct AddressFramedCodec {
    channel: u8,
}

impl AddressFramedCodec {
    /// Create a codec for `channel` (1-9).
    pub fn new(channel: u8) -> SessionResult<Self> {
        if !(1..=9).contains(&channel) {
            return Err(SessionError::Config(format!(
                "address-framed channel must be 1-9, got {}",
                channel
            )));
        }
        Ok(Self { channel })
    }

    /// Device channel.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    fn is_query(code: &str) -> bool {
        STATUS_QUERIES.contains(&code) || STATIC_QUERIES.contains(&code)
    }

    fn is_error_token(&self, reply: &str) -> bool {
        ERROR_TOKENS.iter().any(|t| t.token == reply)
    }
}

impl FrameCodec for AddressFramedCodec {
    fn family(&self) -> &'static str {
        "address"
    }

    fn classify(&self, code: &str) -> Classification {
        if STATUS_QUERIES.contains(&code) {
            Classification::StatusQuery
        } else {
            Classification::ActuationCommand
        }
    }

    fn validate(&self, code: &str) -> SessionResult<()> {
        if code.len() != 2 {
            return Err(invalid(code, "address-framed codes are two characters"));
        }
        if !code.chars().all(|c| c.is_ascii_graphic()) {
            return Err(invalid(code, "code must be printable ASCII"));
        }
        Ok(())
    }

    fn encode(&self, code: &str, args: &[Value]) -> Vec<u8> {
        let mut frame = format!("{}{}", self.channel, code);
        for arg in args {
            frame.push_str(&arg.to_string());
        }
        frame.push_str(FRAME_SUFFIX);
        frame.into_bytes()
    }

    fn normalize(&self, raw: &[u8]) -> String {
        let text = String::from_utf8_lossy(raw);
        let trimmed = text.trim_matches(|c: char| c.is_whitespace() || c == 'º' || c == '\u{FFFD}');

        let channel = char::from(b'0' + self.channel);
        match trimmed.strip_prefix(channel) {
            Some(rest) if !rest.is_empty() => rest.to_string(),
            _ => trimmed.to_string(),
        }
    }

    fn is_expected_reply(&self, code: &str, response: &[u8]) -> bool {
        let reply = self.normalize(response);
        if self.is_error_token(&reply) {
            return true;
        }
        if !Self::is_query(code) {
            return reply == ACK;
        }
        reply
            .get(..2)
            .map(|prefix| prefix == code.to_ascii_lowercase())
            .unwrap_or(false)
    }

    fn extract_payload(&self, code: &str, response: &[u8]) -> String {
        let reply = self.normalize(response);
        if Self::is_query(code) {
            let prefix = code.to_ascii_lowercase();
            if let Some(data) = reply.strip_prefix(prefix.as_str()) {
                return data.to_string();
            }
        }
        reply
    }

    fn error_tokens(&self) -> &'static [ErrorToken] {
        ERROR_TOKENS
    }

    fn retry_tokens(&self) -> &'static [&'static str] {
        &["er4"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> AddressFramedCodec {
        AddressFramedCodec::new(1).unwrap()
    }

    #[test]
    fn encodes_run_inwards_frame() {
        let frame = codec().encode("RI", &[Value::from(100)]);
        assert_eq!(frame, "1RI100º\r".as_bytes());
    }

    #[test]
    fn encodes_query_without_args() {
        let frame = AddressFramedCodec::new(3).unwrap().encode("DS", &[]);
        assert_eq!(frame, "3DSº\r".as_bytes());
    }

    #[test]
    fn classifies_status_queries() {
        let c = codec();
        for code in STATUS_QUERIES {
            assert_eq!(c.classify(code), Classification::StatusQuery);
        }
        assert_eq!(c.classify("DM"), Classification::ActuationCommand);
        assert_eq!(c.classify("RP"), Classification::ActuationCommand);
    }

    #[test]
    fn error_tokens_match_any_code() {
        let c = codec();
        for code in ["RI", "DP", "DS", "*A", "RZ"] {
            assert!(c.is_expected_reply(code, b"er2"));
        }
        assert_eq!(
            c.describe_error("er2"),
            Some("The command has been understood but would result in out-of-bounds state")
        );
    }

    #[test]
    fn query_reply_requires_lowercase_echo() {
        let c = codec();
        assert!(c.is_expected_reply("DP", b"dp0123"));
        assert!(!c.is_expected_reply("DP", b"ds0"));
        assert!(!c.is_expected_reply("DP", b"ok"));
        assert!(!c.is_expected_reply("DP", b"d"));
        assert_eq!(c.extract_payload("DP", b"dp0123"), "0123");
    }

    #[test]
    fn actuation_requires_ok() {
        let c = codec();
        assert!(c.is_expected_reply("RI", b"ok"));
        assert!(!c.is_expected_reply("RI", b"dp0123"));
        assert!(!c.is_expected_reply("RI", b""));
        assert_eq!(c.extract_payload("RI", b"ok"), "ok");
    }

    #[test]
    fn normalize_strips_channel_and_terminators() {
        let c = codec();
        assert_eq!(c.normalize("1dp0123º\r".as_bytes()), "dp0123");
        assert_eq!(c.normalize(b"1ok\r"), "ok");
        assert_eq!(c.normalize(b" er4 "), "er4");
        assert!(c.is_expected_reply("DN", "1dn276º\r".as_bytes()));
        assert_eq!(c.extract_payload("DN", "1dn276º\r".as_bytes()), "276");
    }

    #[test]
    fn rejects_bad_channels_and_codes() {
        assert!(AddressFramedCodec::new(0).is_err());
        assert!(AddressFramedCodec::new(10).is_err());

        let c = codec();
        assert!(c.validate("RI").is_ok());
        assert!(c.validate("*A").is_ok());
        assert!(c.validate("RIX").is_err());
        assert!(c.validate("").is_err());
    }

    #[test]
    fn er4_is_retryable() {
        assert_eq!(codec().retry_tokens(), &["er4"]);
    }
}
