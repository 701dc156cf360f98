use colored::*;
use std::fmt;
use std::path::Path;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::filter::LevelFilter;

/// A custom tracing event formatter for colorizing log output based on level.
///
/// This formatter is designed to provide clean, user-facing output where the
/// entire log line is colored according to its severity level, without any
/// extra metadata like timestamps or log levels printed.
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // Buffer the formatted fields to apply color to the entire line.
        // This is necessary because the format_fields method writes directly.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        // Apply color based on the event's log level.
        let colored_output = match *event.metadata().level() {
            Level::INFO => buffer.white(),
            Level::WARN => buffer.yellow(),
            Level::ERROR => buffer.red(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };

        // Write the colored line to the actual output.
        writeln!(writer, "{}", colored_output)
    }
}

/// Guard returned by [`init`]. Dropping it stops the background flush
/// thread backing the non-blocking file writer — keep it alive for as
/// long as file logging should keep working.
pub struct LoggingGuard(#[allow(dead_code)] tracing_appender::non_blocking::WorkerGuard);

/// Installs a two-layer `tracing` subscriber: a daily-rotating file layer
/// (uncolored, for durable diagnostics) and a [`ColorizedFormatter`]
/// console layer for interactive use. `log_dir`/`log_filename` name the
/// rotating file; `level` bounds both layers; `console` toggles the
/// stdout layer off entirely (for embedding in a host process that
/// drives its own console output).
///
/// A device library has no `main()` of its own, so nothing calls this
/// automatically — a binary embedding this crate opts in by calling it
/// once at startup and holding onto the returned guard.
pub fn init(log_dir: impl AsRef<Path>, log_filename: impl AsRef<str>, level: Level, console: bool) -> LoggingGuard {
    let level_filter: LevelFilter = level.into();
    let file_appender = tracing_appender::rolling::daily(log_dir.as_ref(), log_filename.as_ref());
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_writer)
        .with_ansi(false)
        .with_filter(level_filter);

    let console_layer = if console {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(level_filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry().with(file_layer).with(console_layer).init();
    LoggingGuard(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_writes_a_daily_rotated_log_file_under_the_given_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _guard = init(dir.path(), "devicemesh.log", Level::INFO, false);
        tracing::info!("hello from the logging smoke test");
        // the non-blocking writer flushes on a background thread; give it
        // a moment before checking the directory was populated.
        std::thread::sleep(std::time::Duration::from_millis(200));
        let entries: Vec<_> = std::fs::read_dir(dir.path()).expect("read_dir").collect();
        assert!(!entries.is_empty(), "expected a rotated log file in {:?}", dir.path());
    }
}