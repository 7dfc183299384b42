//! Helper utilities, functions, and macros.

#[macro_use]
pub mod print;

#[macro_use]
mod config;

mod error;
mod hostmap;
mod safetcp;

pub use error::TaskmillError;
pub use hostmap::{HostmapMode, Hostnames};
pub(crate) use safetcp::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, tcp_connect_with_retry,
};

use std::env;

/// Reads a boolean environment variable. Unset or empty leaves the default;
/// "0", "false" and "no" count as false, everything else as true.
pub fn env_boolean(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(s) if s.is_empty() => default,
        Ok(s) => !matches!(s.as_str(), "0" | "false" | "no"),
        Err(_) => default,
    }
}

/// Reads an integer environment variable, falling back to the default on
/// unset, empty, or unparseable values (a warning is logged for the latter).
pub fn env_long(name: &str, default: i64) -> i64 {
    match env::var(name) {
        Ok(s) if s.is_empty() => default,
        Ok(s) => match s.parse::<i64>() {
            Ok(v) => v,
            Err(_) => {
                pf_warn!("invalid value '{}' for env var {}", s, name);
                default
            }
        },
        Err(_) => default,
    }
}
