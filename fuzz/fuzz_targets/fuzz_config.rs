#![no_main]

use ikspoz::Config;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let input = match std::str::from_utf8(data) {
        Ok(s) => s,
        Err(_) => return,
    };

    // Parsing and validation may reject anything, but must never panic
    if let Ok(config) = Config::parse(input) {
        let _ = config.target();
        let _ = config.connection_string();
    }
});
