//! Fuzz test for size string parsing
//!
//! Tests that `parse_size` handles arbitrary inputs safely.

#![no_main]

use flashkit_core::parse_size;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    let _ = parse_size(data);

    for suffix in ["", "B", "K", "KB", "M", "MB", "G", "GB", "k", "m", "g", "b"] {
        let input = format!("{}{}", data.trim(), suffix);
        if let Ok(size) = parse_size(&input) {
            // A bare number parses to itself
            if suffix.is_empty() {
                if let Ok(n) = data.trim().parse::<usize>() {
                    assert_eq!(size, n);
                }
            }
        }
    }

    let _ = parse_size(&format!("  {}  ", data));
});
