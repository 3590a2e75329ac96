//! Wire layer between the bridge and its child process.
//!
//! # Architecture
//!
//! - **protocol**: Message types (HostMessage, ChildMessage, TimerToken)
//! - **codec**: Length-prefixed JSON framing for AsyncRead/AsyncWrite
//! - **channel**: Child process plus its framed stdin/stdout pipe

pub mod channel;
pub mod codec;
pub mod protocol;
