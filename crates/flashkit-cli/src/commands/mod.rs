//! CLI command implementations

use humansize::{format_size, BINARY};

/// Conditionally println based on silent mode
macro_rules! println_if {
    ($silent:expr) => {
        if !$silent {
            println!();
        }
    };
    ($silent:expr, $($arg:tt)*) => {
        if !$silent {
            println!($($arg)*);
        }
    };
}

pub(crate) use println_if;

pub mod checksum;
pub mod config;
pub mod write;

/// Format a byte count for display
pub fn human_size(bytes: u64) -> String {
    format_size(bytes, BINARY)
}
