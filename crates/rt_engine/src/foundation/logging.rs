//! Logging utilities and structured logging support

pub use log::{debug, info, warn, error, trace};

/// Initialize the logging system
///
/// Defaults to the `info` level; `RUST_LOG` overrides it.
pub fn init() {
    init_with_default_filter("info");
}

/// Initialize the logging system with a custom default filter
///
/// Calling this more than once is harmless; later calls are ignored.
pub fn init_with_default_filter(filter: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .format_timestamp_millis()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_is_ignored() {
        init();
        init_with_default_filter("debug");
        info!("logging initialized twice");
    }
}
