//! Fuzz test for settings TOML parsing
//!
//! Tests that settings deserialization and conversion to a runtime config
//! handle arbitrary TOML safely.

#![no_main]

use flashkit_core::Settings;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Ok(settings) = Settings::parse(data) {
        // Conversion may reject values but must not panic
        if let Ok(config) = settings.flash.to_config() {
            let _ = config.validate();
        }
    }

    let wrapped = format!("[flash]\n{}", data);
    if let Ok(settings) = Settings::parse(&wrapped) {
        let _ = settings.flash.to_config();
    }

    let wrapped = format!("[behavior]\n{}", data);
    let _ = Settings::parse(&wrapped);
});
