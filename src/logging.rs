use env_logger::Env;
use log::LevelFilter;
use once_cell::sync::OnceCell;

static RUST_LOG_LEVEL: OnceCell<LevelFilter> = OnceCell::new();

fn env_level() -> LevelFilter {
    std::env::var("ACME_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

/// Map a `-v` count onto a level, the way the capture tool's verbosity flag works.
pub fn verbosity_level(count: u8) -> LevelFilter {
    match count {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Initialize logging (stderr formatter) based on `ACME_LOG`/`RUST_LOG`.
///
/// Safe to call multiple times; returns the level installed by the first call.
pub fn init_logging() -> LevelFilter {
    init_logging_with(None)
}

/// Like [`init_logging`], but an explicit level wins over the environment.
pub fn init_logging_with(level: Option<LevelFilter>) -> LevelFilter {
    *RUST_LOG_LEVEL.get_or_init(|| {
        let level = level.unwrap_or_else(env_level);
        let env = Env::default().default_filter_or(level_to_str(level));
        let result = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
        if result.is_err() {
            // someone else (a test harness) installed a logger first
            log::debug!("logger already installed, keeping it");
        }
        level
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(verbosity_level(0), LevelFilter::Info);
        assert_eq!(verbosity_level(1), LevelFilter::Debug);
        assert_eq!(verbosity_level(3), LevelFilter::Trace);
    }

    #[test]
    fn init_is_idempotent() {
        let first = init_logging_with(Some(LevelFilter::Warn));
        let second = init_logging_with(Some(LevelFilter::Trace));
        assert_eq!(first, second);
    }
}
