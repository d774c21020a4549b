//! Wire codec for the line based message grammar
//!
//! A frame is `<action>[ <specifier>][ <json-data>]`. When data is present
//! but the specifier is not, the specifier field is left empty so the data
//! still lands in the third field on decode.

mod frame;

pub use frame::{SecopCodec, EOL, MAX_LINE_LENGTH};

use crate::core::errors::SecopError;
use crate::core::protocol::{Action, ERROR_PREFIX, EVENT_REPLY};
use serde_json::Value;
use std::fmt;

/// One protocol message: (action, specifier, data)
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Action keyword
    pub action: String,
    /// `module` or `module:accessible`
    pub specifier: Option<String>,
    /// JSON payload
    pub data: Option<Value>,
}

impl Message {
    /// Create a message from its three parts
    pub fn new(action: impl Into<String>, specifier: Option<String>, data: Option<Value>) -> Self {
        Self {
            action: action.into(),
            specifier,
            data,
        }
    }

    /// Create a request for a known action
    pub fn request(action: Action, specifier: Option<&str>, data: Option<Value>) -> Self {
        Self::new(action.request(), specifier.map(str::to_string), data)
    }

    /// Create a reply for a known action
    pub fn reply(action: Action, specifier: Option<&str>, data: Option<Value>) -> Self {
        Self::new(action.reply(), specifier.map(str::to_string), data)
    }

    /// Create an `update` or `error_update` event
    pub fn event(specifier: String, data: Value, is_error: bool) -> Self {
        let action = if is_error {
            format!("{ERROR_PREFIX}{EVENT_REPLY}")
        } else {
            EVENT_REPLY.to_string()
        };
        Self::new(action, Some(specifier), Some(data))
    }

    /// Create the `error_<action>` reply for a failed request
    pub fn error(request_action: &str, specifier: Option<String>, err: &SecopError, detail: Value) -> Self {
        Self::new(
            format!("{ERROR_PREFIX}{request_action}"),
            specifier,
            Some(err.report(detail)),
        )
    }

    /// Whether this is an error reply or error event
    pub fn is_error(&self) -> bool {
        self.action.starts_with(ERROR_PREFIX)
    }

    /// Whether this is a help request (empty line or `help`)
    pub fn is_help(&self) -> bool {
        self.action.is_empty() || self.action == Action::Help.request()
    }

    /// Split the specifier into module and accessible name
    pub fn split_specifier(&self) -> Option<(&str, Option<&str>)> {
        self.specifier.as_deref().map(split_specifier)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_line(self))
    }
}

/// Split `module[:name]`
pub fn split_specifier(specifier: &str) -> (&str, Option<&str>) {
    match specifier.split_once(':') {
        Some((module, name)) => (module, Some(name)),
        None => (specifier, None),
    }
}

/// Codec errors
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Data field is not valid JSON
    #[error("Invalid JSON in data field: {source}")]
    BadJson {
        /// Action field of the offending line
        action: String,
        /// Specifier field of the offending line
        specifier: Option<String>,
        /// Parse error
        #[source]
        source: serde_json::Error,
    },

    /// Line is not valid UTF-8
    #[error("Line is not valid UTF-8")]
    Encoding {
        /// Raw bytes of the line
        raw: Vec<u8>,
    },
}

impl WireError {
    /// Best effort (action, specifier) of the offending line for the error reply
    pub fn origin(&self) -> (String, Option<String>) {
        match self {
            Self::BadJson { action, specifier, .. } => (action.clone(), specifier.clone()),
            Self::Encoding { raw } => {
                // latin-1 style decoding never fails
                let text: String = raw.iter().map(|&b| b as char).collect();
                let mut parts = text.trim().splitn(3, ' ');
                let action = parts.next().unwrap_or_default().to_string();
                let specifier = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
                (action, specifier)
            }
        }
    }

    /// Protocol error reported to the client
    pub fn to_secop(&self) -> SecopError {
        match self {
            Self::BadJson { .. } => SecopError::BadJson(self.to_string()),
            Self::Encoding { .. } => SecopError::Protocol(self.to_string()),
        }
    }
}

/// Encode a message into one line without terminator
pub fn encode_line(msg: &Message) -> String {
    let specifier = msg.specifier.as_deref().unwrap_or("");
    match &msg.data {
        Some(data) => format!("{} {} {}", msg.action, specifier, data),
        None if !specifier.is_empty() => format!("{} {}", msg.action, specifier),
        None => msg.action.clone(),
    }
}

/// Encode a message into a terminated frame
pub fn encode_frame(msg: &Message) -> Vec<u8> {
    let mut out = encode_line(msg).into_bytes();
    out.extend_from_slice(EOL);
    out
}

/// Decode one line (terminator optional) into a message
///
/// Splits on the first two spaces only; an empty data field means no data.
pub fn decode_line(line: &str) -> Result<Message, WireError> {
    let line = line.trim_end_matches(['\r', '\n']).trim();
    let mut parts = line.splitn(3, ' ');
    let action = parts.next().unwrap_or_default().to_string();
    let specifier = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
    let data = match parts.next().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(serde_json::from_str(raw).map_err(|source| WireError::BadJson {
            action: action.clone(),
            specifier: specifier.clone(),
            source,
        })?),
    };
    Ok(Message {
        action,
        specifier,
        data,
    })
}

/// Decode raw bytes of one line
pub fn decode_bytes(raw: &[u8]) -> Result<Message, WireError> {
    match std::str::from_utf8(raw) {
        Ok(line) => decode_line(line),
        Err(_) => Err(WireError::Encoding { raw: raw.to_vec() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_omits_absent_fields() {
        let msg = Message::new("active", None, None);
        assert_eq!(encode_line(&msg), "active");

        let msg = Message::new("read", Some("T:value".into()), None);
        assert_eq!(encode_line(&msg), "read T:value");

        let msg = Message::new("changed", Some("T:target".into()), Some(json!([1.5, {"t": 2.0}])));
        assert_eq!(encode_line(&msg), "changed T:target [1.5,{\"t\":2.0}]");
    }

    #[test]
    fn test_data_without_specifier_round_trips() {
        let msg = Message::new("pong", None, Some(json!([null, {"t": 1.0}])));
        let line = encode_line(&msg);
        assert_eq!(line, "pong  [null,{\"t\":1.0}]");
        assert_eq!(decode_line(&line).unwrap(), msg);
    }

    #[test]
    fn test_decode_keeps_spaces_in_data() {
        let msg = decode_line("change m:p \"a b c\"\n").unwrap();
        assert_eq!(msg.action, "change");
        assert_eq!(msg.specifier.as_deref(), Some("m:p"));
        assert_eq!(msg.data, Some(json!("a b c")));
    }

    #[test]
    fn test_decode_empty_data_is_none() {
        let msg = decode_line("activate   \r\n").unwrap();
        assert_eq!(msg.action, "activate");
        assert_eq!(msg.specifier, None);
        assert_eq!(msg.data, None);
    }

    #[test]
    fn test_decode_bad_json() {
        let err = decode_line("change m:p {oops").unwrap_err();
        let (action, specifier) = err.origin();
        assert_eq!(action, "change");
        assert_eq!(specifier.as_deref(), Some("m:p"));
        assert_eq!(err.to_secop().kind(), "BadJSONError");
    }

    #[test]
    fn test_decode_invalid_utf8() {
        let err = decode_bytes(b"read \xff\xfe").unwrap_err();
        assert!(matches!(err, WireError::Encoding { .. }));
        assert_eq!(err.origin().0, "read");
    }

    #[test]
    fn test_help_detection() {
        assert!(decode_line("").unwrap().is_help());
        assert!(decode_line("help").unwrap().is_help());
        assert!(!decode_line("read x").unwrap().is_help());
    }

    #[test]
    fn test_split_specifier() {
        assert_eq!(split_specifier("mod"), ("mod", None));
        assert_eq!(split_specifier("mod:param"), ("mod", Some("param")));
    }
}
