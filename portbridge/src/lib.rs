//! portbridge: supervised external processes behind a framed request/response bridge.

mod portloop;

pub mod bridge;
pub mod callback;
pub mod child;
pub mod exit;
pub mod instance;
pub mod logging;
pub mod registrar;
pub mod service;
pub mod timer;

pub use bridge::channel::{ChildSpawner, CommandSpawner};
pub use bridge::protocol::{ChildMessage, HostMessage, TimerToken};
pub use callback::{CallbackError, CallbackHandler, CallbackTable};
pub use exit::{ExitOutcome, RespawnReason, classify};
pub use instance::{BridgeConfig, BridgeHandle, BridgeInstance, CallError, CallResult, SpawnError};
pub use registrar::{
    BridgeRef, GlobalRegistry, InMemoryGlobalRegistry, InstanceId, Registrar, RegistrarConfig,
    RegistrarError,
};
pub use service::{BridgeService, ExitEvent};
