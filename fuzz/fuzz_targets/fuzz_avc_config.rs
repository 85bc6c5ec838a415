#![no_main]

use libfuzzer_sys::fuzz_target;
use shiguredo_mux::codec::{extract_avc_decoder_configuration_record, parse_avc_sps};

fuzz_target!(|data: &[u8]| {
    let _ = parse_avc_sps(data);
    if let Ok(record) = extract_avc_decoder_configuration_record(data) {
        let _ = record.to_bytes();
        let _ = record.codec_string();
    }
});
