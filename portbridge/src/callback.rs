//! Host-side callbacks invoked by the child.
//!
//! The child sends `call(F, Args)` / `cast(F, Args)`; the bridge runs `F` on the
//! instance's handler with `[instance ref] ++ pipe ++ Args`. A handler that has
//! no `F` of that arity yields an empty result. Any other failure is returned to
//! the caller of [`invoke`], which crashes the instance.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallbackError {
    #[error("undefined callback {function}/{arity}")]
    NotFound { function: String, arity: usize },
    #[error("callback {function} failed: {message}")]
    Failed { function: String, message: String },
}

impl CallbackError {
    pub fn not_found(function: impl Into<String>, arity: usize) -> Self {
        Self::NotFound {
            function: function.into(),
            arity,
        }
    }

    pub fn failed(function: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            function: function.into(),
            message: message.into(),
        }
    }
}

/// Host module the child calls back into.
#[async_trait]
pub trait CallbackHandler: Send + Sync + 'static {
    /// Run `function` with the full argument list.
    ///
    /// Return [`CallbackError::NotFound`] when no such function/arity exists.
    async fn handle(&self, function: &str, args: Vec<Value>) -> Result<Value, CallbackError>;
}

/// Result of a callback that does not exist.
pub fn empty_result() -> Value {
    Value::Array(Vec::new())
}

/// Argument list seen by the handler: instance ref, then pipe, then message args.
pub fn full_args(reference: &Value, pipe: &[Value], args: Vec<Value>) -> Vec<Value> {
    let mut full = Vec::with_capacity(1 + pipe.len() + args.len());
    full.push(reference.clone());
    full.extend(pipe.iter().cloned());
    full.extend(args);
    full
}

/// Dispatch a callback. Missing handler or missing function gives [`empty_result`].
pub async fn invoke(
    handler: Option<&Arc<dyn CallbackHandler>>,
    function: &str,
    args: Vec<Value>,
) -> Result<Value, CallbackError> {
    let Some(handler) = handler else {
        tracing::debug!(function, "No callback handler configured");
        return Ok(empty_result());
    };

    match handler.handle(function, args).await {
        Err(CallbackError::NotFound { function, arity }) => {
            tracing::debug!(%function, arity, "Undefined callback, returning empty result");
            Ok(empty_result())
        }
        other => other,
    }
}

type SyncCallback = dyn Fn(Vec<Value>) -> Result<Value, String> + Send + Sync;
type AsyncCallback = dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, String>> + Send + Sync;

enum Entry {
    Sync(Box<SyncCallback>),
    Async(Box<AsyncCallback>),
}

/// [`CallbackHandler`] backed by closures registered by name and arity.
///
/// The arity counts the full argument list, including the instance ref and pipe.
#[derive(Default)]
pub struct CallbackTable {
    entries: HashMap<(String, usize), Entry>,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, function: impl Into<String>, arity: usize, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.entries
            .insert((function.into(), arity), Entry::Sync(Box::new(f)));
        self
    }

    pub fn register_async<F, Fut>(mut self, function: impl Into<String>, arity: usize, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, String>> + Send + 'static,
    {
        let boxed: Box<AsyncCallback> =
            Box::new(move |args| -> BoxFuture<'static, Result<Value, String>> {
                Box::pin(f(args))
            });
        self.entries
            .insert((function.into(), arity), Entry::Async(boxed));
        self
    }

    pub fn into_handler(self) -> Arc<dyn CallbackHandler> {
        Arc::new(self)
    }
}

#[async_trait]
impl CallbackHandler for CallbackTable {
    async fn handle(&self, function: &str, args: Vec<Value>) -> Result<Value, CallbackError> {
        let arity = args.len();
        let entry = self
            .entries
            .get(&(function.to_string(), arity))
            .ok_or_else(|| CallbackError::not_found(function, arity))?;

        let result = match entry {
            Entry::Sync(f) => f(args),
            Entry::Async(f) => f(args).await,
        };
        result.map_err(|message| CallbackError::failed(function, message))
    }
}
