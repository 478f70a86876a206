use tracing_subscriber::{fmt, EnvFilter};

/// Output format of the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-field human-readable lines.
    #[default]
    Human,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Map the `general.log_json` config flag.
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            LogFormat::Json
        } else {
            LogFormat::Human
        }
    }
}

/// Install the global subscriber for `service_name`.
///
/// `RUST_LOG` wins over `default_level` (e.g. "info" or
/// "ch_intelligence=debug,warn"). Only the first call in a process installs
/// anything; later calls return `false` and leave the subscriber in place.
pub fn init(service_name: &str, default_level: &str, format: LogFormat) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    let installed = match format {
        LogFormat::Human => builder.with_thread_ids(false).try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .is_ok();

    if installed {
        tracing::info!(service = service_name, format = ?format, "logging initialised");
    }
    installed
}
