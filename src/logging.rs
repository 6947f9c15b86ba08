//! slog drains for the CLI. Everything in the crate logs through `tracing`,
//! which forwards to the `log` facade and from there into slog.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Once, OnceLock};

use slog::Drain;

/// Records from modules under this prefix are ours; everything else
/// (reqwest, hyper, rustls, mio) is a dependency.
const OWN_MODULES: &str = "tunsnare";

fn level_from_env_or_default(default: log::LevelFilter) -> log::LevelFilter {
    match std::env::var("RUST_LOG") {
        Ok(value) => parse_level(&value),
        Err(_) => default,
    }
}

fn parse_level(value: &str) -> log::LevelFilter {
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

fn default_level(verbose: bool) -> log::LevelFilter {
    if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    }
}

/// `--verbose` turns on per-session logging in the engine without also
/// dumping HTTP client internals from discovery. Dependencies only show
/// warnings unless trace was asked for.
fn admits(module: &str, level: slog::Level, max: log::LevelFilter) -> bool {
    module.starts_with(OWN_MODULES)
        || max == log::LevelFilter::Trace
        || level.is_at_least(slog::Level::Warning)
}

fn root_logger<D>(drain: D, max: log::LevelFilter) -> slog::Logger
where
    D: Drain<Ok = (), Err = slog::Never> + Send + 'static,
{
    let drain = drain
        .filter(move |record| admits(record.module(), record.level(), max))
        .fuse();
    // Packet bursts at trace level must not be dropped silently.
    let drain = slog_async::Async::new(drain)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    slog::Logger::root(
        drain,
        slog::o!("app" => "tunsnare", "version" => env!("CARGO_PKG_VERSION")),
    )
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

/// Log to stderr. Safe to call more than once; the first logger wins.
pub fn init_terminal(verbose: bool) {
    let level = level_from_env_or_default(default_level(verbose));
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    install_logger(root_logger(drain, level), level);
}

/// Log to an append-only file, for `run` under a supervisor with no terminal.
pub fn init_file(path: &Path, verbose: bool) -> anyhow::Result<()> {
    let level = level_from_env_or_default(default_level(verbose));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let decorator = slog_term::PlainDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    install_logger(root_logger(drain, level), level);
    Ok(())
}
