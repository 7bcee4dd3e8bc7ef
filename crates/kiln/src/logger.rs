//! Logger construction.

use crate::config::LogLevel;
use slog::{Drain as _, Logger};

/// Builds the root logger: terminal decorator, full format, async drain,
/// level filter. Diagnostics go to stderr; stdout stays clean for callers
/// that parse it.
pub fn new(level: LogLevel) -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, level.as_slog_level()).fuse();
    Logger::root(drain, slog::o!())
}
