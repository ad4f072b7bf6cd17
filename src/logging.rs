//! Logger construction

use slog::{o, Drain, Logger};

/// Asynchronous terminal logger
pub fn terminal_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

pub fn discard_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}
