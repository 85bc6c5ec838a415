#![no_main]

use libfuzzer_sys::fuzz_target;
use shiguredo_mux::codec::parse_opus_head;

fuzz_target!(|data: &[u8]| {
    if let Ok(head) = parse_opus_head(data) {
        let _ = head.to_dops_payload();
        let _ = head.to_bytes();
    }
});
