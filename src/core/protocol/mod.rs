//! SECoP message vocabulary
//!
//! Request and reply keywords, the identification string and the help text.

use std::fmt;

/// Identification request literal
pub const IDENT_REQUEST: &str = "*IDN?";

/// Fixed prefix of every identification reply
pub const IDENT_PREFIX: &str = "ISSE&SINE2020,SECoP,";

/// Identification reply sent by this node
pub const IDENT_REPLY: &str = "ISSE&SINE2020,SECoP,V2019-08-20,v1.0 RC2";

/// Prefix of error replies (`error_<request>`)
pub const ERROR_PREFIX: &str = "error_";

/// Action keyword of unsolicited value updates
pub const EVENT_REPLY: &str = "update";

/// Action keyword of remote log messages
pub const LOG_EVENT: &str = "log";

/// Action keyword of the numbered help lines
pub const HELP_LINE: &str = "_";

/// Request keywords understood by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// `*IDN?`
    Identify,
    /// `describe`
    Describe,
    /// `activate`
    Activate,
    /// `deactivate`
    Deactivate,
    /// `do`
    Do,
    /// `change`
    Change,
    /// `read`
    Read,
    /// `ping`
    Ping,
    /// `help`
    Help,
    /// `logging`
    Logging,
}

impl Action {
    /// All request keywords
    pub fn all() -> &'static [Action] {
        &[
            Action::Identify,
            Action::Describe,
            Action::Activate,
            Action::Deactivate,
            Action::Do,
            Action::Change,
            Action::Read,
            Action::Ping,
            Action::Help,
            Action::Logging,
        ]
    }

    /// Parse a request keyword
    pub fn from_request(keyword: &str) -> Option<Self> {
        Self::all().iter().copied().find(|a| a.request() == keyword)
    }

    /// Parse a reply keyword back into the request it answers
    pub fn from_reply(keyword: &str) -> Option<Self> {
        if let Some(request) = keyword.strip_prefix(ERROR_PREFIX) {
            return Self::from_request(request);
        }
        if keyword.starts_with(IDENT_PREFIX) || keyword.starts_with("SECoP,") {
            return Some(Action::Identify);
        }
        Self::all()
            .iter()
            .copied()
            .find(|a| *a != Action::Identify && a.reply() == keyword)
    }

    /// Request keyword
    pub fn request(&self) -> &'static str {
        match self {
            Action::Identify => IDENT_REQUEST,
            Action::Describe => "describe",
            Action::Activate => "activate",
            Action::Deactivate => "deactivate",
            Action::Do => "do",
            Action::Change => "change",
            Action::Read => "read",
            Action::Ping => "ping",
            Action::Help => "help",
            Action::Logging => "logging",
        }
    }

    /// Reply keyword
    pub fn reply(&self) -> &'static str {
        match self {
            Action::Identify => IDENT_REPLY,
            Action::Describe => "describing",
            Action::Activate => "active",
            Action::Deactivate => "inactive",
            Action::Do => "done",
            Action::Change => "changed",
            Action::Read => "reply",
            Action::Ping => "pong",
            Action::Help => "helping",
            Action::Logging => "logging",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.request())
    }
}

/// Help text sent line by line on an empty or `help` request
pub fn help_lines() -> Vec<String> {
    vec![
        "Try one of the following:".to_string(),
        format!("'{IDENT_REQUEST}' to query protocol version"),
        "'describe' to read the description".to_string(),
        "'read <module>[:<parameter>]' to request reading a value".to_string(),
        "'change <module>[:<parameter>] value' to request changing a value".to_string(),
        "'do <module>[:<command>]' to execute a command".to_string(),
        "'ping <nonce>' to request a heartbeat response".to_string(),
        "'activate' to activate async updates".to_string(),
        "'deactivate' to deactivate updates".to_string(),
        "'logging [<module>] <loglevel>' to activate logging events".to_string(),
    ]
}
