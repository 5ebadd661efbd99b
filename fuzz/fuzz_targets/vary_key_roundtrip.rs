#![no_main]

use cachet::proxy::cache::key::{decode_key, encode_key};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Some((url, fields, values)) = decode_key(data) {
        let encoded = encode_key(&url, &fields, &values);
        let decoded = decode_key(&encoded).expect("re-encoded key must decode");
        assert_eq!(decoded, (url, fields, values));
    }
});
