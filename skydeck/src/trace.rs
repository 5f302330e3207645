//! Logging plumbing.
//!
//! Enabled by the `tracing` feature (on by default). With the feature off the
//! log macros below expand to nothing, so the link and render paths carry no
//! formatting cost.

/// Installs a `tracing` subscriber with uptime timestamps and thread names.
///
/// The filter is read from `RUST_LOG` and falls back to `skydeck=info`.
/// Safe to call more than once; later calls are ignored, which lets every
/// test call it unconditionally.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("skydeck=info"));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, info, trace, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! log_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use log_noop as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use log_noop as info;
#[cfg(not(feature = "tracing"))]
pub(crate) use log_noop as trace;
#[cfg(not(feature = "tracing"))]
pub(crate) use log_noop as warn;
