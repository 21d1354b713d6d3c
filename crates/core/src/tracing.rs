//! Subscriber setup for binaries embedding the admission subsystem.
//!
//! The format is picked from the environment:
//! - `ADMISSION_LOG_FORMAT=json` switches from pretty to JSON output
//! - `ADMISSION_LOG_TO_STDERR` writes to stderr instead of stdout
//! - `ADMISSION_DISABLE_LOGS` installs nothing
//!
//! `RUST_LOG` directives are honoured on top of the default level.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::level_filters::LevelFilter;

/// Installs the global subscriber once; later calls are no-ops.
pub fn set_logger(level: Option<LevelFilter>) -> anyhow::Result<()> {
    static LOGGER_SET: AtomicBool = AtomicBool::new(false);
    if LOGGER_SET
        .compare_exchange(false, true, Ordering::Release, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }
    #[cfg(feature = "trace")]
    tracer::init_tracer(level)?;
    #[cfg(not(feature = "trace"))]
    let _ = level;
    Ok(())
}

#[cfg(feature = "trace")]
pub(crate) mod tracer {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::{layer::SubscriberExt, Layer, Registry};

    pub fn init_tracer(level: Option<LevelFilter>) -> anyhow::Result<()> {
        if std::env::var("ADMISSION_DISABLE_LOGS").is_ok() {
            return Ok(());
        }

        let default_filter = if cfg!(any(test, debug_assertions)) {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let filter_layer = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(level.unwrap_or(default_filter).into())
            .from_env_lossy();

        let to_stderr = std::env::var("ADMISSION_LOG_TO_STDERR").is_ok();
        let use_json = std::env::var("ADMISSION_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let with_location = cfg!(any(test, debug_assertions));

        let fmt_layer = match (use_json, to_stderr) {
            (true, true) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .json()
                .with_file(with_location)
                .with_line_number(with_location)
                .with_writer(std::io::stderr)
                .boxed(),
            (true, false) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .json()
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed(),
            (false, true) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .pretty()
                .with_file(with_location)
                .with_line_number(with_location)
                .with_writer(std::io::stderr)
                .boxed(),
            (false, false) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .pretty()
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed(),
        };

        let subscriber = Registry::default().with(fmt_layer.with_filter(filter_layer));
        tracing::subscriber::set_global_default(subscriber)?;
        Ok(())
    }
}
