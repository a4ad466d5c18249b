use crate::host::RunMode;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;



/*
    @@@
    @logs_tracing();
    . Creates a daily-rotating log file (<dir>/<file>) and wraps it in a non-blocking writer: the persistent operational log.
    . Interactive runs also get a compact stderr layer; child output itself goes to stdout through the Writer.
    . Keeps the appender alive by returning the guard.
*/
pub fn logs_tracing(dir: &str, file: &str, mode: RunMode) -> anyhow::Result<WorkerGuard> {
    let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, file);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_writer(non_blocking);

    let console_layer = mode.is_interactive().then(|| {
        fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
            // startup lines are already echoed by the Writer
            .with_filter(filter_fn(|meta| meta.target() != "startup"))
    });

    tracing_subscriber::registry()
        .with(LevelFilter::INFO)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to set global subscriber: {}", e))?;
    Ok(guard)
}
