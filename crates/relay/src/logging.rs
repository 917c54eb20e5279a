use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Map a `RELAY_LOG` value onto a level name. Unknown values mean info.
fn base_level(value: Option<&str>) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn default_filter(relay_log: Option<&str>) -> String {
    format!("relay={level}", level = base_level(relay_log))
}

/// Install the global subscriber. Logs always go to stderr; worker stdout
/// carries the readiness channel.
///
/// `RUST_LOG` wins when set, otherwise `RELAY_LOG` picks the level for the
/// `relay` target. `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let relay_log = std::env::var("RELAY_LOG").ok();
        EnvFilter::new(default_filter(relay_log.as_deref()))
    };

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
