//! Structured logging setup shared by the daemon and tests.

use tracing_subscriber::EnvFilter;

use crate::{HlldError, Result};

/// Maps a config log level to a tracing filter directive.
pub fn parse_level(level: &str) -> Result<&'static str> {
    let filter = if level.eq_ignore_ascii_case("DEBUG") {
        "debug"
    } else if level.eq_ignore_ascii_case("INFO") {
        "info"
    } else if level.eq_ignore_ascii_case("WARN") {
        "warn"
    } else if level.eq_ignore_ascii_case("ERROR") {
        "error"
    } else if level.eq_ignore_ascii_case("CRITICAL") {
        "error"
    } else {
        return Err(HlldError::InvalidArgument(format!(
            "unknown log level: {level}"
        )));
    };
    Ok(filter)
}

/// Initialize logging with the configured level. `RUST_LOG` wins when
/// set. Call once at startup.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = parse_level(level)?;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG").unwrap(), "debug");
        assert_eq!(parse_level("info").unwrap(), "info");
        assert_eq!(parse_level("Warn").unwrap(), "warn");
        assert_eq!(parse_level("ERROR").unwrap(), "error");
        assert_eq!(parse_level("CRITICAL").unwrap(), "error");
        assert!(parse_level("NOISY").is_err());
    }
}
