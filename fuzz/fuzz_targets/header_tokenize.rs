#![no_main]

use cachet::proxy::directives::{normalize, parse_directives, tokenize};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = tokenize(text);
        let _ = parse_directives(text);

        // Normalisation is idempotent.
        let normalized = normalize(text);
        assert_eq!(normalize(&normalized), normalized);
    }
});
