#![no_main]

use libfuzzer_sys::fuzz_target;
use shiguredo_mux::codec::parse_flac_header;

fuzz_target!(|data: &[u8]| {
    if let Ok(header) = parse_flac_header(data) {
        let _ = header.to_dfla_payload();
    }
});
