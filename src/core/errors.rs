//! Protocol error taxonomy
//!
//! Every error a request can produce maps onto one [`SecopError`] variant,
//! and every variant has a stable wire name returned by [`SecopError::kind`].

use serde_json::{json, Value};
use thiserror::Error;

/// Errors reported to clients as `error_<action>` replies
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SecopError {
    /// Addressed module is unknown
    #[error("{0}")]
    NoSuchModule(String),

    /// Addressed parameter is unknown
    #[error("{0}")]
    NoSuchParameter(String),

    /// Addressed command is unknown
    #[error("{0}")]
    NoSuchCommand(String),

    /// Parameter is readonly or constant
    #[error("{0}")]
    ReadOnly(String),

    /// Value rejected by the datatype
    #[error("{0}")]
    BadValue(String),

    /// Malformed or unhandled request
    #[error("{0}")]
    Protocol(String),

    /// Data field is not valid JSON
    #[error("{0}")]
    BadJson(String),

    /// Request is valid but not supported here
    #[error("{0}")]
    NotImplemented(String),

    /// Communication with hardware or an upstream node failed
    #[error("{0}")]
    CommunicationFailed(String),

    /// Hardware reported a failure
    #[error("{0}")]
    Hardware(String),

    /// Module is busy
    #[error("{0}")]
    IsBusy(String),

    /// Command execution failed
    #[error("{0}")]
    CommandFailed(String),

    /// Module is disabled
    #[error("{0}")]
    Disabled(String),

    /// Anything else
    #[error("{0}")]
    Internal(String),
}

impl SecopError {
    /// Stable error kind used on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoSuchModule(_) => "NoSuchModuleError",
            Self::NoSuchParameter(_) => "NoSuchParameterError",
            Self::NoSuchCommand(_) => "NoSuchCommandError",
            Self::ReadOnly(_) => "ReadOnlyError",
            Self::BadValue(_) => "BadValueError",
            Self::Protocol(_) => "ProtocolError",
            Self::BadJson(_) => "BadJSONError",
            Self::NotImplemented(_) => "NotImplementedError",
            Self::CommunicationFailed(_) => "CommunicationFailedError",
            Self::Hardware(_) => "HardwareError",
            Self::IsBusy(_) => "IsBusyError",
            Self::CommandFailed(_) => "CommandFailedError",
            Self::Disabled(_) => "DisabledError",
            Self::Internal(_) => "InternalError",
        }
    }

    /// Rebuild an error from a wire error report
    ///
    /// Accepts both the `...Error` kinds used here and the bare names other
    /// nodes send (`NoSuchModule`, `ReadOnly`, ...). Unknown kinds become
    /// [`SecopError::Internal`].
    pub fn from_report(kind: &str, text: impl Into<String>) -> Self {
        let text = text.into();
        let base = kind.strip_suffix("Error").unwrap_or(kind);
        match base {
            "NoSuchModule" => Self::NoSuchModule(text),
            "NoSuchParameter" => Self::NoSuchParameter(text),
            "NoSuchCommand" => Self::NoSuchCommand(text),
            "ReadOnly" => Self::ReadOnly(text),
            "BadValue" | "Range" | "WrongType" | "OutOfRange" => Self::BadValue(text),
            "Protocol" => Self::Protocol(text),
            "BadJSON" => Self::BadJson(text),
            "NotImplemented" => Self::NotImplemented(text),
            "CommunicationFailed" | "Timeout" => Self::CommunicationFailed(text),
            "Hardware" => Self::Hardware(text),
            "IsBusy" => Self::IsBusy(text),
            "CommandFailed" => Self::CommandFailed(text),
            "Disabled" | "disabled" => Self::Disabled(text),
            _ => Self::Internal(text),
        }
    }

    /// Build the `[kind, text, qualifiers]` error report
    pub fn report(&self, qualifiers: Value) -> Value {
        json!([self.kind(), self.to_string(), qualifiers])
    }

    /// Shorthand for a missing module
    pub fn no_such_module(module: &str) -> Self {
        Self::NoSuchModule(format!("Module '{module}' does not exist"))
    }

    /// Shorthand for a missing parameter
    pub fn no_such_parameter(module: &str, param: &str) -> Self {
        Self::NoSuchParameter(format!("Module '{module}' has no parameter '{param}'"))
    }

    /// Shorthand for a missing command
    pub fn no_such_command(module: &str, command: &str) -> Self {
        Self::NoSuchCommand(format!("Module '{module}' has no command '{command}'"))
    }
}

impl From<serde_json::Error> for SecopError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadJson(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(SecopError::no_such_module("T").kind(), "NoSuchModuleError");
        assert_eq!(SecopError::BadJson(String::new()).kind(), "BadJSONError");
        assert_eq!(
            SecopError::no_such_module("T").to_string(),
            "Module 'T' does not exist"
        );
    }

    #[test]
    fn test_from_report_accepts_bare_names() {
        assert!(matches!(
            SecopError::from_report("NoSuchModule", "x"),
            SecopError::NoSuchModule(_)
        ));
        assert!(matches!(
            SecopError::from_report("ReadOnlyError", "x"),
            SecopError::ReadOnly(_)
        ));
        assert!(matches!(
            SecopError::from_report("Whatever", "x"),
            SecopError::Internal(_)
        ));
    }

    #[test]
    fn test_report_shape() {
        let err = SecopError::ReadOnly("nope".into());
        let report = err.report(json!({"t": 1.5}));
        assert_eq!(report, json!(["ReadOnlyError", "nope", {"t": 1.5}]));
    }
}
