//! Child exit classification.
//!
//! Maps a child exit status to either a clean shutdown or a respawn reason the
//! supervising owner can act on.

use serde::Serialize;

/// Why a child (or its instance) terminated abnormally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RespawnReason {
    Segfault,
    BrokenPipe,
    /// Child read a malformed frame.
    BadReadFrame,
    /// Child failed to write a frame.
    BadWriteFrame,
    /// Child read an invalid length prefix.
    BadFrameSize,
    VersionMismatch,
    BadTuple,
    BadAtom,
    BadFunction,
    BadArgs,
    BadCall,
    BadCommand,
    /// Child failed reading the reply to one of its calls.
    CallRead,
    CallVersion,
    CallResult,
    /// Child failed after a call returned.
    PostCallRead,
    PostCallVersion,
    PostCallReference,
    /// The bridge received a frame it could not decode.
    UnsafeData,
    /// A host callback failed for a reason other than a missing function.
    CallbackFailed(String),
    /// Writing to the child failed.
    ChannelClosed,
    /// The control loop itself panicked.
    Panicked,
    /// Nonzero status with no entry in the table.
    Unknown(i32),
}

impl std::fmt::Display for RespawnReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CallbackFailed(msg) => write!(f, "callback_failed: {}", msg),
            Self::Unknown(status) => write!(f, "unknown status {}", status),
            other => {
                let tag = serde_json::to_value(other)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_owned))
                    .unwrap_or_default();
                f.write_str(&tag)
            }
        }
    }
}

/// How a bridge instance ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitOutcome {
    /// Child exited with status 0.
    CleanShutdown,
    /// Instance was stopped from the host side.
    Stopped(String),
    /// Child crashed or the channel became unusable; owner should respawn.
    Respawn(RespawnReason),
}

impl ExitOutcome {
    pub fn is_respawn(&self) -> bool {
        matches!(self, Self::Respawn(_))
    }

    pub fn respawn_reason(&self) -> Option<&RespawnReason> {
        match self {
            Self::Respawn(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Statuses with a named reason. 139/141 are 128 + SIGSEGV/SIGPIPE.
const KNOWN_STATUSES: &[(i32, RespawnReason)] = &[
    (139, RespawnReason::Segfault),
    (141, RespawnReason::BrokenPipe),
    (200, RespawnReason::BadReadFrame),
    (201, RespawnReason::BadWriteFrame),
    (202, RespawnReason::BadFrameSize),
    (203, RespawnReason::VersionMismatch),
    (204, RespawnReason::BadTuple),
    (205, RespawnReason::BadAtom),
    (206, RespawnReason::BadFunction),
    (207, RespawnReason::BadArgs),
    (208, RespawnReason::BadCall),
    (209, RespawnReason::BadCommand),
    (210, RespawnReason::CallRead),
    (211, RespawnReason::CallVersion),
    (212, RespawnReason::CallResult),
    (213, RespawnReason::PostCallRead),
    (214, RespawnReason::PostCallVersion),
    (215, RespawnReason::PostCallReference),
];

/// Classify a child exit status. Total over `i32`.
pub fn classify(status: i32) -> ExitOutcome {
    if status == 0 {
        return ExitOutcome::CleanShutdown;
    }
    let reason = KNOWN_STATUSES
        .iter()
        .find(|(code, _)| *code == status)
        .map(|(_, reason)| reason.clone())
        .unwrap_or(RespawnReason::Unknown(status));
    ExitOutcome::Respawn(reason)
}

/// Status code the classifier expects for a reaped child.
///
/// Signal deaths are reported as 128 + signal number.
pub fn status_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Signal name for statuses above 128, for logging.
#[cfg(unix)]
pub fn signal_name(status: i32) -> Option<&'static str> {
    if status <= 128 {
        return None;
    }
    nix::sys::signal::Signal::try_from(status - 128)
        .ok()
        .map(|s| s.as_str())
}

#[cfg(not(unix))]
pub fn signal_name(_status: i32) -> Option<&'static str> {
    None
}
