use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/** create a non blocking tracing file appender writing `<datadir>/<who>.log` */
pub fn setup_file_appender<P: AsRef<Path>>(datadir: P, who: &str) -> (NonBlocking, WorkerGuard) {
    let file_appender = rolling::never(datadir.as_ref(), format!("{}.log", who));

    tracing_appender::non_blocking(file_appender)
}

/** create a RUST_LOG env based log filter, falling back to `level` */
pub fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::builder().with_default_directive(level.into()).from_env_lossy()
}

/// Parse a `--log-level` value.  `off` maps to `None`.
pub fn parse_level(level: &str) -> Option<Level> {
    match level {
        "off" => None,
        other => other.parse().ok().or(Some(Level::INFO)),
    }
}

/**
 * Initialize tracing-subscriber with an env filter based on the RUST_LOG env variable.
 * A compact fmt layer prints to stdout, another writes to the log file in datadir.
 * Records from the `log` facade are forwarded into tracing.
 */
pub fn init_tracing_subscriber<P: AsRef<Path>>(
    datadir: P,
    who: &str,
    log_level: &str,
) -> anyhow::Result<LogGuard> {
    let (file_writer, file_guard) = setup_file_appender(datadir, who);

    let format = fmt::format()
        .with_level(true)
        .with_ansi(true)
        .with_target(false)
        .with_source_location(true)
        .compact();

    let stdout_layer = fmt::layer().event_format(format.clone()).with_writer(std::io::stdout);
    let file_layer =
        fmt::layer().event_format(format.with_ansi(false)).with_writer(file_writer);
    let filter = match parse_level(log_level) {
        Some(level) => env_filter(level),
        None => EnvFilter::new("off"),
    };

    tracing_subscriber::registry().with(stdout_layer).with(file_layer).with(filter).try_init()?;
    Ok(LogGuard { _file_appender_guard: file_guard })
}

/// Flushes the log file when dropped
pub struct LogGuard {
    _file_appender_guard: WorkerGuard,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    #[test]
    fn parse_level_test() {
        assert_eq!(parse_level("off"), None);
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level("warn"), Some(Level::WARN));
    }

    #[tokio::test]
    async fn test_setup_file_appender() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("test.log");
        let dir = temp_dir.path().to_path_buf();

        let handle = tokio::spawn(async move {
            let (file_writer, file_guard) = setup_file_appender(dir, "test");

            let subscriber =
                tracing_subscriber::registry().with(fmt::layer().with_writer(file_writer));

            tracing::subscriber::with_default(subscriber, || {
                tracing::info!("channel 0badf00d opened");
            });
            drop(file_guard);
            sleep(Duration::from_millis(100)).await;
        });

        let _ = handle.await;

        assert!(file_path.exists());
        let contents = std::fs::read_to_string(&file_path).expect("failed to read file");
        assert!(contents.contains("channel 0badf00d opened"));
    }
}
