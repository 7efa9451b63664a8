//! Tracing setup for binaries embedding the bridge.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a stderr subscriber.
///
/// `RUST_LOG` wins when set. Otherwise `PORTLET_LOG` picks the level for this
/// crate (default `info`). `LOG_FORMAT=json` switches to JSON lines.
/// Does nothing if a global subscriber is already installed.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_directives(
            std::env::var("PORTLET_LOG").ok().as_deref(),
        ))
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

fn default_directives(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    // Per-frame codec events only show at trace.
    let codec = if level == "trace" { "trace" } else { "off" };
    format!("portlet={level},portlet::bridge::codec={codec},portlet_call={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_map_to_directives() {
        assert_eq!(
            default_directives(None),
            "portlet=info,portlet::bridge::codec=off,portlet_call=info"
        );
        assert_eq!(
            default_directives(Some("warning")),
            "portlet=warn,portlet::bridge::codec=off,portlet_call=warn"
        );
        assert_eq!(
            default_directives(Some("trace")),
            "portlet=trace,portlet::bridge::codec=trace,portlet_call=trace"
        );
        assert_eq!(
            default_directives(Some("loud")),
            "portlet=info,portlet::bridge::codec=off,portlet_call=info"
        );
    }

    #[test]
    fn directives_parse() {
        for level in [None, Some("debug"), Some("trace")] {
            assert!(EnvFilter::try_new(default_directives(level)).is_ok());
        }
    }
}
