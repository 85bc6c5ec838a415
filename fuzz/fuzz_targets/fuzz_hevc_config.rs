#![no_main]

use libfuzzer_sys::fuzz_target;
use shiguredo_mux::codec::{extract_hevc_decoder_configuration_record, parse_hevc_sps};

fuzz_target!(|data: &[u8]| {
    let _ = parse_hevc_sps(data);
    if let Ok(record) = extract_hevc_decoder_configuration_record(data) {
        let _ = record.to_bytes();
    }
});
