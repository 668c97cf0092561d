//! Logging initialisation for bootc-devvm.
//!
//! When the `BOOTC_DEVVM_LOG` environment variable is set to `1`, structured
//! logs are also written to `bootc-devvm.log` in the per-user log directory
//! at `info` level. Stderr output is filtered by `RUST_LOG`, defaulting to
//! `warn` (or `info` with `--verbose`), whether or not the file is enabled.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::NonBlocking;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

fn filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "info" } else { "warn" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Each layer carries its own filter so the file can record `info` while
/// stderr stays at the user's level.
fn subscriber<W>(
    verbose: bool,
    stderr: W,
    file: Option<NonBlocking>,
) -> impl Subscriber + Send + Sync
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let stderr = fmt::layer()
        .with_writer(stderr)
        .with_target(false)
        .with_filter(filter(verbose));
    let file = file.map(|writer| {
        fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(EnvFilter::new("info"))
    });
    tracing_subscriber::registry().with(stderr).with(file)
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main`, store the returned `LogGuard` in a local variable
/// for the duration of the process.
pub fn init(verbose: bool, log_dir: Option<&Path>) -> LogGuard {
    let (file, file_guard) = match log_dir.filter(|_| file_logging_enabled()) {
        Some(dir) => {
            let _ = std::fs::create_dir_all(dir);
            let file_appender = tracing_appender::rolling::never(dir, "bootc-devvm.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            (Some(non_blocking), Some(guard))
        }
        None => (None, None),
    };

    subscriber(verbose, std::io::stderr, file).init();

    LogGuard {
        _file_guard: file_guard,
    }
}

fn file_logging_enabled() -> bool {
    std::env::var("BOOTC_DEVVM_LOG").as_deref() == Ok("1")
}
