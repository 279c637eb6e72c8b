use std::fs::OpenOptions;
use std::sync::{Once, OnceLock};

use slog::Drain;

/// `RUST_LOG` is matched by substring, so both `debug` and
/// `tunplane=debug` select debug output.
fn parse_level(value: Option<&str>, default: log::LevelFilter) -> log::LevelFilter {
    let Some(value) = value else {
        return default;
    };
    let lower = value.to_ascii_lowercase();
    if lower.contains("trace") {
        log::LevelFilter::Trace
    } else if lower.contains("debug") {
        log::LevelFilter::Debug
    } else if lower.contains("warn") {
        log::LevelFilter::Warn
    } else if lower.contains("error") {
        log::LevelFilter::Error
    } else if lower.contains("off") {
        log::LevelFilter::Off
    } else {
        log::LevelFilter::Info
    }
}

fn level_for(verbose: bool) -> log::LevelFilter {
    let default = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    parse_level(std::env::var("RUST_LOG").ok().as_deref(), default)
}

fn install_logger(logger: slog::Logger, level: log::LevelFilter) {
    static LOGGER_GUARD: OnceLock<slog_scope::GlobalLoggerGuard> = OnceLock::new();
    static STDLOG_INIT: Once = Once::new();

    if LOGGER_GUARD.get().is_none() {
        let guard = slog_scope::set_global_logger(logger);
        let _ = LOGGER_GUARD.set(guard);
    }

    STDLOG_INIT.call_once(|| {
        let _ = slog_stdlog::init();
    });
    log::set_max_level(level);
}

/// Compact stderr logging. `tracing` events reach slog through the `log`
/// bridge.
pub fn init_terminal(verbose: bool) {
    let level = level_for(verbose);
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    let logger = slog::Logger::root(drain, slog::o!());
    install_logger(logger, level);
}

fn tracing_level(level: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    use tracing_subscriber::filter::LevelFilter;
    match level {
        log::LevelFilter::Off => LevelFilter::OFF,
        log::LevelFilter::Error => LevelFilter::ERROR,
        log::LevelFilter::Warn => LevelFilter::WARN,
        log::LevelFilter::Info => LevelFilter::INFO,
        log::LevelFilter::Debug => LevelFilter::DEBUG,
        log::LevelFilter::Trace => LevelFilter::TRACE,
    }
}

/// Append plain-text logs to `path`.
pub fn init_file(path: &str, verbose: bool) -> anyhow::Result<()> {
    let level = level_for(verbose);
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let writer = tracing_subscriber::fmt::writer::BoxMakeWriter::new(file);
    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_target(false)
        .with_ansi(false)
        .with_max_level(tracing_level(level))
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install file logger: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_log_is_matched_by_substring() {
        assert_eq!(
            parse_level(Some("tunplane=DEBUG"), log::LevelFilter::Info),
            log::LevelFilter::Debug
        );
        assert_eq!(parse_level(Some("warn"), log::LevelFilter::Info), log::LevelFilter::Warn);
        assert_eq!(parse_level(Some("bogus"), log::LevelFilter::Debug), log::LevelFilter::Info);
        assert_eq!(parse_level(None, log::LevelFilter::Debug), log::LevelFilter::Debug);
    }

    #[test]
    fn levels_map_onto_tracing() {
        assert_eq!(
            tracing_level(log::LevelFilter::Trace),
            tracing_subscriber::filter::LevelFilter::TRACE
        );
        assert_eq!(
            tracing_level(log::LevelFilter::Off),
            tracing_subscriber::filter::LevelFilter::OFF
        );
    }
}
