//! Tracing subscriber setup for binaries embedding the bridge.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Level directive derived from `PORTBRIDGE_LOG` (`debug|info|warn|error`).
fn filter_directive(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("portbridge={level},portbridge_echo={level}")
}

/// `RUST_LOG` directives when present, else the `PORTBRIDGE_LOG` level.
fn env_filter(rust_log: Option<&str>, level: Option<&str>) -> EnvFilter {
    match rust_log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::new(filter_directive(level)),
    }
}

/// Install a global subscriber writing to stderr.
///
/// `RUST_LOG` wins when set; otherwise `PORTBRIDGE_LOG` picks the level.
/// `LOG_FORMAT=json` switches to JSON lines. Calling this twice is harmless.
pub fn init_tracing() {
    let rust_log = std::env::var("RUST_LOG").ok();
    let level = std::env::var("PORTBRIDGE_LOG").ok();
    let filter = env_filter(rust_log.as_deref(), level.as_deref());

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
