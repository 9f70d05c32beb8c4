//! Logging and observability
//!
//! Structured logging via `tracing`, with either human-readable text or JSON
//! output selected at runtime. All log output goes to stderr so that stdout
//! stays reserved for build output and the run summary.

use anyhow::Result;
use std::{io, sync::Once};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Environment variable selecting the log format (`json` or `text`)
pub const LOG_FORMAT_ENV: &str = "CODEBUILD_LOCAL_LOG_FORMAT";
/// Environment variable holding the log filter directive
pub const LOG_FILTER_ENV: &str = "CODEBUILD_LOCAL_LOG";
/// Environment variable overriding span lifecycle events
pub const LOG_SPAN_EVENTS_ENV: &str = "CODEBUILD_LOCAL_LOG_SPAN_EVENTS";

/// Initialize the logging system with an optional format specification
///
/// Safe to call more than once; only the first call installs a subscriber.
///
/// ## Arguments
///
/// * `format` - `None` or `"text"` for text output, `"json"` for JSON lines.
///   When `None`, `CODEBUILD_LOCAL_LOG_FORMAT` is consulted.
///
/// ## Environment Variables
///
/// * `CODEBUILD_LOCAL_LOG_FORMAT` - log output format
/// * `CODEBUILD_LOCAL_LOG` - filter directive (e.g. `debug`, `codebuild_local_core=trace`)
/// * `RUST_LOG` - fallback filter directive
///
/// ## Example
///
/// ```rust
/// use codebuild_local_core::logging;
///
/// logging::init(None).expect("Failed to initialize logging");
/// logging::init(Some("json")).expect("second call is a no-op");
/// ```
pub fn init(format: Option<&str>) -> Result<()> {
    INIT.call_once(|| {
        let filter = create_env_filter();

        let env_format = std::env::var(LOG_FORMAT_ENV).ok();
        let effective_format = format.or(env_format.as_deref()).unwrap_or("text");

        let span_events = span_events_for_format(effective_format);

        match effective_format {
            "json" => {
                tracing_subscriber::registry()
                    .with(
                        fmt::layer()
                            .json()
                            .with_target(true)
                            .with_span_events(span_events)
                            .with_writer(io::stderr),
                    )
                    .with(filter)
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(
                        fmt::layer()
                            .with_target(true)
                            .with_span_events(span_events)
                            .with_writer(io::stderr),
                    )
                    .with(filter)
                    .init();
            }
        }

        tracing::debug!("Logging initialized with format: {}", effective_format);
    });

    Ok(())
}

/// Create an EnvFilter from `CODEBUILD_LOCAL_LOG`, then `RUST_LOG`, then `info`
fn create_env_filter() -> EnvFilter {
    if let Ok(directive) = std::env::var(LOG_FILTER_ENV) {
        EnvFilter::try_new(&directive).unwrap_or_else(|_| {
            eprintln!(
                "Invalid {} specification '{}', using default 'info'",
                LOG_FILTER_ENV, directive
            );
            EnvFilter::new("info")
        })
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Span lifecycle events: env override first, then a per-format default
fn span_events_for_format(format: &str) -> fmt::format::FmtSpan {
    use fmt::format::FmtSpan;

    if let Ok(raw) = std::env::var(LOG_SPAN_EVENTS_ENV) {
        return parse_span_events(&raw);
    }

    match format {
        "json" => FmtSpan::NEW | FmtSpan::CLOSE,
        _ => FmtSpan::NONE,
    }
}

fn parse_span_events(raw: &str) -> fmt::format::FmtSpan {
    use fmt::format::FmtSpan;

    let mut acc = FmtSpan::NONE;
    for token in raw.split(&[',', '|'][..]).map(|t| t.trim().to_lowercase()) {
        acc |= match token.as_str() {
            "new" => FmtSpan::NEW,
            "close" => FmtSpan::CLOSE,
            "enter" => FmtSpan::ENTER,
            "exit" => FmtSpan::EXIT,
            "active" => FmtSpan::ACTIVE,
            "full" => FmtSpan::FULL,
            _ => FmtSpan::NONE,
        };
    }
    acc
}

/// Check if logging has been initialized
pub fn is_initialized() -> bool {
    INIT.is_completed()
}
