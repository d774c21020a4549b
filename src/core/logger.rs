//! Remote log forwarding
//!
//! Clients request module log records with the `logging` action. Records
//! are also mirrored to the process log through `tracing`.

use crate::core::codec::Message;
use crate::core::errors::SecopError;
use crate::core::protocol::LOG_EVENT;
use serde_json::Value;
use std::collections::HashMap;

/// Remote log level, ordered from most to least verbose
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LogLevel {
    /// Debug output, also selected by `comlog`
    Debug,
    /// Informational
    Info,
    /// Warnings
    Warning,
    /// Errors
    Error,
    /// Nothing is forwarded
    #[default]
    Off,
}

impl LogLevel {
    /// Get all levels
    pub fn all() -> &'static [LogLevel] {
        &[
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warning,
            LogLevel::Error,
            LogLevel::Off,
        ]
    }

    /// Get name
    pub fn name(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Off => "off",
        }
    }

    /// Parse a level name
    pub fn from_name(name: &str) -> Option<Self> {
        if name == "comlog" {
            return Some(LogLevel::Debug);
        }
        Self::all().iter().copied().find(|l| l.name() == name)
    }

    /// Parse the data field of a `logging` request
    pub fn from_request(data: Option<&Value>) -> Result<Self, SecopError> {
        match data {
            Some(Value::String(name)) => Self::from_name(name)
                .ok_or_else(|| SecopError::BadValue(format!("unknown log level '{name}'"))),
            Some(Value::Bool(false)) => Ok(LogLevel::Off),
            Some(other) => Err(SecopError::BadValue(format!("{other} is not a log level"))),
            None => Err(SecopError::Protocol("logging needs a level".to_string())),
        }
    }

    /// Mirror a module record to the process log
    pub fn trace(&self, module: &str, text: &str) {
        match self {
            LogLevel::Debug => tracing::debug!(module, "{text}"),
            LogLevel::Info => tracing::info!(module, "{text}"),
            LogLevel::Warning => tracing::warn!(module, "{text}"),
            LogLevel::Error => tracing::error!(module, "{text}"),
            LogLevel::Off => {}
        }
    }
}

/// `log <module>:<level> "<text>"` event
pub fn log_event(module: &str, level: LogLevel, text: &str) -> Message {
    Message::new(
        LOG_EVENT,
        Some(format!("{module}:{}", level.name())),
        Some(Value::String(text.to_string())),
    )
}

/// Per connection remote log levels, keyed by module
#[derive(Debug, Clone, Default)]
pub struct LogLevels {
    levels: HashMap<String, LogLevel>,
}

impl LogLevels {
    /// Set the level for one module
    pub fn set(&mut self, module: &str, level: LogLevel) {
        if level == LogLevel::Off {
            self.levels.remove(module);
        } else {
            self.levels.insert(module.to_string(), level);
        }
    }

    /// Whether a record of `level` from `module` is wanted
    pub fn wants(&self, module: &str, level: LogLevel) -> bool {
        level != LogLevel::Off
            && self
                .levels
                .get(module)
                .is_some_and(|wanted| level >= *wanted)
    }

    /// Whether nothing is forwarded
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_level_names() {
        assert_eq!(LogLevel::from_name("comlog"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_name("warning"), Some(LogLevel::Warning));
        assert_eq!(LogLevel::from_name("verbose"), None);
        assert!(LogLevel::from_request(Some(&json!(3))).is_err());
        assert_eq!(LogLevel::from_request(Some(&json!("off"))).unwrap(), LogLevel::Off);
    }

    #[test]
    fn test_levels_filter() {
        let mut levels = LogLevels::default();
        assert!(!levels.wants("T", LogLevel::Error));
        levels.set("T", LogLevel::Info);
        assert!(levels.wants("T", LogLevel::Warning));
        assert!(!levels.wants("T", LogLevel::Debug));
        assert!(!levels.wants("other", LogLevel::Error));
        levels.set("T", LogLevel::Off);
        assert!(levels.is_empty());
    }

    #[test]
    fn test_log_event_format() {
        let msg = log_event("T", LogLevel::Error, "sensor broken");
        assert_eq!(msg.to_string(), "log T:error \"sensor broken\"");
    }
}
