use slog::{Drain, Logger};

/// Root logger for a node. Components tag it with their own context, e.g.
/// `log.new(o!("role" => "leader"))`.
pub fn get_root_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}
