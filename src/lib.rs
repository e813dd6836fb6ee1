pub mod mumble;
pub mod transport;

use tracing_subscriber::EnvFilter;

#[cfg(debug_assertions)]
fn log_level() -> log::LevelFilter {
    log::LevelFilter::Info
}

#[cfg(not(debug_assertions))]
fn log_level() -> log::LevelFilter {
    log::LevelFilter::Warn
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level().to_string().to_lowercase()))
}

/// Installs the stderr log backend. Stdout is reserved for host events.
pub fn init_logging() {
    let result = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .try_init();
    if let Err(err) = result {
        eprintln!("logging already initialised: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::{init_logging, log_level};

    #[cfg(debug_assertions)]
    #[test]
    fn log_level_matches_debug() {
        assert_eq!(log_level(), log::LevelFilter::Info);
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn log_level_matches_release() {
        assert_eq!(log_level(), log::LevelFilter::Warn);
    }

    /// Installing the backend twice does not panic.
    #[test]
    fn init_logging_is_idempotent() {
        // Arrange
        // Act
        init_logging();
        init_logging();
        // Assert
        log::info!("logging ready");
    }
}
