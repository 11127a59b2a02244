#![no_main]

use ikspoz::ConnectionString;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let input = match std::str::from_utf8(data) {
        Ok(s) => s,
        Err(_) => return,
    };

    if let Ok(connection) = ConnectionString::parse(input) {
        // Derived addresses must stay well-formed and keep the entity
        let address = connection.address();
        assert!(address.path().ends_with('/'));
        let _ = connection.public_url();
        let _ = connection.to_string();
    }
});
