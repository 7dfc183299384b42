//! Helper macros for logging (console printing).
//!
//! Debug and trace output can be silenced cluster-wide by setting the
//! `ADLB_DEBUG` / `ADLB_TRACE` environment variables to `0`, independently
//! of the `log` filter configuration.

use std::sync::OnceLock;

static DEBUG_ENABLED: OnceLock<bool> = OnceLock::new();
static TRACE_ENABLED: OnceLock<bool> = OnceLock::new();

/// Whether debug-level printing is enabled (`ADLB_DEBUG` != 0).
pub fn debug_enabled() -> bool {
    *DEBUG_ENABLED.get_or_init(|| crate::utils::env_boolean("ADLB_DEBUG", true))
}

/// Whether trace-level printing is enabled (`ADLB_TRACE` != 0).
pub fn trace_enabled() -> bool {
    *TRACE_ENABLED.get_or_init(|| crate::utils::env_boolean("ADLB_TRACE", true))
}

/// Log TRACE message.
///
/// Example:
/// ```no_run
/// pf_trace!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($fmt_str:literal $(, $fmt_arg:expr)*) => {
        if $crate::utils::print::trace_enabled() {
            log::trace!($fmt_str $(, $fmt_arg)*)
        }
    };
}

/// Log DEBUG message.
#[macro_export]
macro_rules! pf_debug {
    ($fmt_str:literal $(, $fmt_arg:expr)*) => {
        if $crate::utils::print::debug_enabled() {
            log::debug!($fmt_str $(, $fmt_arg)*)
        }
    };
}

/// Log INFO message.
#[macro_export]
macro_rules! pf_info {
    ($fmt_str:literal $(, $fmt_arg:expr)*) => {
        log::info!($fmt_str $(, $fmt_arg)*)
    };
}

/// Log WARN message.
#[macro_export]
macro_rules! pf_warn {
    ($fmt_str:literal $(, $fmt_arg:expr)*) => {
        log::warn!($fmt_str $(, $fmt_arg)*)
    };
}

/// Log ERROR message.
#[macro_export]
macro_rules! pf_error {
    ($fmt_str:literal $(, $fmt_arg:expr)*) => {
        log::error!($fmt_str $(, $fmt_arg)*)
    };
}

/// Log an error string to logger and then return a `TaskmillError`
/// containing the string.
///
/// Example:
/// ```no_run
/// return logged_err!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($fmt_str:literal $(, $fmt_arg:expr)*) => {{
        pf_error!($fmt_str $(, $fmt_arg)*);
        Err($crate::utils::TaskmillError(format!($fmt_str $(, $fmt_arg)*)))
    }};
}
