//! Scriptable child process for exercising the bridge.
//!
//! Every invoke is dispatched on its function name; see `Echo::invoke` for the
//! repertoire. Fired timers are reported back with a `timer_fired` cast.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use portbridge::child::{ChildContext, ChildError, ChildHandler, Invocation, run_child};
use portbridge::TimerToken;
use serde_json::{Value, json};

#[derive(Default)]
struct Echo {
    loaded: Mutex<Vec<String>>,
}

fn arg_u64(args: &[Value], index: usize) -> Result<u64, Value> {
    args.get(index)
        .and_then(Value::as_u64)
        .ok_or_else(|| json!({ "badarg": index }))
}

fn arg_token(args: &[Value], index: usize) -> Result<TimerToken, Value> {
    match args.get(index) {
        Some(Value::Number(n)) => n.as_i64().map(TimerToken::Int),
        Some(Value::String(s)) => Some(TimerToken::Name(s.clone())),
        _ => None,
    }
    .ok_or_else(|| json!({ "badarg": index }))
}

fn arg_str(args: &[Value], index: usize) -> Result<String, Value> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| json!({ "badarg": index }))
}

impl Echo {
    async fn dispatch(
        &self,
        ctx: &mut ChildContext,
        function: &str,
        mut args: Vec<Value>,
    ) -> Result<Result<Value, Value>, ChildError> {
        let result = match function {
            "echo" => Ok(Value::Array(args)),
            "sleep" => match arg_u64(&args, 0) {
                Ok(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(json!("slept"))
                }
                Err(e) => Err(e),
            },
            "callback" | "cast_back" => {
                if args.is_empty() {
                    return Ok(Err(json!({ "badarg": 0 })));
                }
                let target = match args.remove(0) {
                    Value::String(name) => name,
                    _ => return Ok(Err(json!({ "badarg": 0 }))),
                };
                if function == "callback" {
                    Ok(ctx.call(target, args).await?)
                } else {
                    ctx.cast(target, args).await?;
                    Ok(json!("cast"))
                }
            }
            "info" => {
                let payload = args.into_iter().next().unwrap_or(Value::Null);
                ctx.info(payload).await?;
                Ok(Value::Null)
            }
            "after" | "interval" => match (arg_u64(&args, 0), arg_token(&args, 1)) {
                (Ok(ms), Ok(token)) => {
                    if function == "after" {
                        ctx.after(ms, token).await?;
                    } else {
                        ctx.interval(ms, token).await?;
                    }
                    Ok(json!("armed"))
                }
                (Err(e), _) | (_, Err(e)) => Err(e),
            },
            "cancel" => match arg_token(&args, 0) {
                Ok(token) => {
                    ctx.cancel(token).await?;
                    Ok(json!("cancelled"))
                }
                Err(e) => Err(e),
            },
            "fail" => Err(args.into_iter().next().unwrap_or(Value::Null)),
            "exit" => {
                let code = arg_u64(&args, 0).unwrap_or(1);
                std::process::exit(code as i32);
            }
            "garbage" => {
                ctx.write_raw(&[0, 0, 0, 3, b'x', b'y', b'z']).await?;
                Ok(Value::Null)
            }
            "load" => match arg_str(&args, 0) {
                Ok(source) => {
                    let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
                    loaded.push(source);
                    Ok(json!({ "loaded": loaded.len() }))
                }
                Err(e) => Err(e),
            },
            "loaded" => {
                let loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
                Ok(json!(loaded.clone()))
            }
            "pwd" => match std::env::current_dir() {
                Ok(dir) => Ok(json!(dir.display().to_string())),
                Err(e) => Err(json!(e.to_string())),
            },
            other => Err(json!({ "undef": other })),
        };
        Ok(result)
    }
}

#[async_trait::async_trait]
impl ChildHandler for Echo {
    async fn invoke(
        &self,
        ctx: &mut ChildContext,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Invocation, ChildError> {
        tracing::debug!(function, "echo invoke");
        self.dispatch(ctx, function, args).await
    }

    async fn timer(&self, ctx: &mut ChildContext, token: TimerToken) -> Result<Invocation, ChildError> {
        ctx.cast("timer_fired", vec![token.into()]).await?;
        Ok(Ok(Value::Null))
    }
}

fn main() -> anyhow::Result<()> {
    portbridge::logging::init_tracing();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    if let Err(e) = runtime.block_on(run_child(Echo::default())) {
        tracing::error!(error = %e, "echo child failed");
        std::process::exit(e.exit_code());
    }
    Ok(())
}
