//! Template codec (dynamic mechanical analysis instrument family).
//!
//! Protocol overview:
//! - Frame: `DMA,SN{channel},{code},{args...},END`, e.g. `"DMA,SN1,CLR,0,END"`
//! - Every command is acknowledged with `OKR` (received) and finishes with
//!   `OKC` (completed); only `OKC` or a fault token completes a command
//! - `GET` streams measurement lines between `OKR` and `OKC`
//! - `RUN` waits for the measurement to finish and never times out
//! - Faults are the literal tokens `er1`..`er4`

use super::{invalid, Classification, ErrorToken, FrameCodec, Value};
use crate::error::SessionResult;

/// Command codes understood by the instrument.
pub const COMMANDS: &[&str] = &["INIT", "RUN", "GET", "CLR", "CLAMP"];

/// Intermediate "received" acknowledgement.
pub const RECEIVED: &str = "OKR";

/// Completion acknowledgement.
pub const COMPLETED: &str = "OKC";

const PREFIX: &str = "DMA";
const SUFFIX: &str = "END";

static ERROR_TOKENS: &[ErrorToken] = &[
    ErrorToken {
        token: "er1",
        description: "The command was not recognised by the instrument",
    },
    ErrorToken {
        token: "er2",
        description: "The command options are out of range",
    },
    ErrorToken {
        token: "er3",
        description: "The instrument is not initialised for this command",
    },
    ErrorToken {
        token: "er4",
        description: "The instrument is busy and cannot answer",
    },
];

/// Codec for `DMA,SN{channel},...,END` devices.
#[derive(Debug, Clone)]
pub struct TemplateCodec {
    channel: u8,
}

impl TemplateCodec {
    /// Create a codec addressing serial-number slot `channel`.
    pub fn new(channel: u8) -> Self {
        Self { channel }
    }

    /// Device serial-number slot.
    pub fn channel(&self) -> u8 {
        self.channel
    }
}

impl FrameCodec for TemplateCodec {
    fn family(&self) -> &'static str {
        "template"
    }

    fn classify(&self, code: &str) -> Classification {
        match code {
            "RUN" => Classification::NoTimeout,
            _ => Classification::ActuationCommand,
        }
    }

    fn validate(&self, code: &str) -> SessionResult<()> {
        if COMMANDS.contains(&code) {
            Ok(())
        } else {
            Err(invalid(
                code,
                format!("expected one of: {}", COMMANDS.join(", ")),
            ))
        }
    }

    fn encode(&self, code: &str, args: &[Value]) -> Vec<u8> {
        let mut fields = vec![PREFIX.to_string(), format!("SN{}", self.channel), code.to_string()];
        fields.extend(args.iter().map(Value::to_string));
        fields.push(SUFFIX.to_string());
        fields.join(",").into_bytes()
    }

    fn normalize(&self, raw: &[u8]) -> String {
        String::from_utf8_lossy(raw).trim().to_string()
    }

    fn is_expected_reply(&self, _code: &str, response: &[u8]) -> bool {
        let reply = self.normalize(response);
        reply == COMPLETED || ERROR_TOKENS.iter().any(|t| t.token == reply)
    }

    fn accumulates(&self, code: &str) -> bool {
        code == "GET"
    }

    fn is_progress(&self, response: &[u8]) -> bool {
        self.normalize(response) == RECEIVED
    }

    fn extract_payload(&self, _code: &str, response: &[u8]) -> String {
        self.normalize(response)
    }

    fn error_tokens(&self) -> &'static [ErrorToken] {
        ERROR_TOKENS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;

    #[test]
    fn encodes_clear_frame() {
        let frame = TemplateCodec::new(1).encode("CLR", &[Value::from(0)]);
        assert_eq!(frame, b"DMA,SN1,CLR,0,END");
    }

    #[test]
    fn encodes_multiple_args_and_none() {
        let codec = TemplateCodec::new(2);
        assert_eq!(
            codec.encode("INIT", &[Value::from(3), Value::from(12)]),
            b"DMA,SN2,INIT,3,12,END"
        );
        assert_eq!(codec.encode("GET", &[]), b"DMA,SN2,GET,END");
    }

    #[test]
    fn run_never_times_out() {
        let codec = TemplateCodec::new(1);
        assert_eq!(codec.classify("RUN"), Classification::NoTimeout);
        assert_eq!(codec.classify("CLAMP"), Classification::ActuationCommand);
    }

    #[test]
    fn only_completion_or_fault_finishes_a_command() {
        let codec = TemplateCodec::new(1);
        assert!(codec.is_expected_reply("CLR", b"OKC"));
        assert!(codec.is_expected_reply("INIT", b"OKC\r\n"));
        assert!(codec.is_expected_reply("RUN", b"er2"));
        assert!(!codec.is_expected_reply("RUN", b"OKR"));
        assert!(!codec.is_expected_reply("CLR", b"High-Voltage on"));
        assert!(!codec.is_expected_reply("GET", b"1.0, 2.0, 3.0"));
        assert_eq!(codec.extract_payload("GET", b"1.0, 2.0\r\n"), "1.0, 2.0");
    }

    #[test]
    fn received_ack_is_progress_and_get_accumulates() {
        let codec = TemplateCodec::new(1);
        assert!(codec.is_progress(b"OKR\r\n"));
        assert!(!codec.is_progress(b"OKC"));
        assert!(!codec.is_progress(b"1.0, 2.0"));
        assert!(codec.accumulates("GET"));
        assert!(!codec.accumulates("RUN"));
    }

    #[test]
    fn unknown_codes_are_rejected() {
        let codec = TemplateCodec::new(1);
        assert!(codec.validate("CLR").is_ok());
        assert!(matches!(
            codec.validate("FOO"),
            Err(SessionError::InvalidCommand { .. })
        ));
    }
}
