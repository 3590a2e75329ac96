//! Wire protocol types for bridge-child communication.
//!
//! One duplex channel (child stdin/stdout):
//! - **Host → child**: `Invoke` commands, fired `Timer` tokens, `Reply` to child callbacks
//! - **Child → host**: the closed `ChildMessage` grammar; only `Ok` and `Error` end an exchange

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Caller-chosen identifier for a timer registered by the child.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimerToken {
    Int(i64),
    Name(String),
}

impl std::fmt::Display for TimerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{}", n),
            Self::Name(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for TimerToken {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<&str> for TimerToken {
    fn from(s: &str) -> Self {
        Self::Name(s.to_string())
    }
}

impl From<TimerToken> for Value {
    fn from(token: TimerToken) -> Self {
        match token {
            TimerToken::Int(n) => Value::from(n),
            TimerToken::Name(s) => Value::String(s),
        }
    }
}

/// Messages from bridge to child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Run `function` in the child. Sent for both call and cast requests.
    Invoke {
        function: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// A timer the child registered has fired.
    Timer { token: TimerToken },

    /// Result of a host callback the child asked for with `ChildMessage::Call`.
    Reply {
        #[serde(default)]
        result: Value,
    },
}

/// Messages from child to bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildMessage {
    /// Invoke a host callback and wait for a `HostMessage::Reply`.
    Call {
        function: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Invoke a host callback without waiting for its result.
    Cast {
        function: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    Info {
        #[serde(default)]
        payload: Value,
    },

    /// Register a one-shot timer.
    After { delay_ms: u64, token: TimerToken },

    /// Register a repeating timer.
    Interval { delay_ms: u64, token: TimerToken },

    Cancel { token: TimerToken },

    /// Terminal: the current exchange failed.
    Error {
        #[serde(default)]
        reason: Value,
    },

    /// Terminal: the current exchange succeeded.
    Ok {
        #[serde(default)]
        results: Value,
    },
}

impl HostMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Invoke { .. } => "invoke",
            Self::Timer { .. } => "timer",
            Self::Reply { .. } => "reply",
        }
    }
}

impl ChildMessage {
    /// Whether this message ends the current call/cast exchange.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ok { .. } | Self::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Call { .. } => "call",
            Self::Cast { .. } => "cast",
            Self::Info { .. } => "info",
            Self::After { .. } => "after",
            Self::Interval { .. } => "interval",
            Self::Cancel { .. } => "cancel",
            Self::Error { .. } => "error",
            Self::Ok { .. } => "ok",
        }
    }
}
