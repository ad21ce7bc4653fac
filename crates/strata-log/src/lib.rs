//! Structured logging for the strata engine.
//!
//! Span-based, filterable logging via the `tracing` ecosystem: console output
//! with uptime timestamps and module paths, plus an optional JSON file layer
//! in debug builds for post-mortem analysis of streaming sessions.

use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// `log_dir` enables JSON file logging (debug builds only); `RUST_LOG`
/// overrides the default filter.
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_env_filter());

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if debug_build
        && let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(log_dir.join("strata.log"))
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        subscriber.with(file_layer).init();
        return;
    }

    subscriber.init();
}

/// Default filter: `info` everywhere, with the chatty GPU crates turned down.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new("info,wgpu=warn,naga=warn")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_contents() {
        let filter = format!("{}", default_env_filter());
        assert!(filter.contains("info"));
        assert!(filter.contains("wgpu=warn"));
        assert!(filter.contains("naga=warn"));
    }

    #[test]
    fn test_env_filter_parsing() {
        let valid = [
            "info",
            "debug,strata_stream=trace",
            "warn,strata_gpu=debug,strata_voxel=trace",
        ];
        for f in valid {
            assert!(EnvFilter::try_new(f).is_ok(), "failed to parse {f}");
        }
    }
}
