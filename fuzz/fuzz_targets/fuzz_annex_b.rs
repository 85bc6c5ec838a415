#![no_main]

use libfuzzer_sys::fuzz_target;
use shiguredo_mux::codec::{
    annex_b_to_length_prefixed, find_nal_units_in_annex_b, remove_emulation_prevention,
};

fuzz_target!(|data: &[u8]| {
    for unit in find_nal_units_in_annex_b(data) {
        let _ = remove_emulation_prevention(unit);
    }
    let _ = annex_b_to_length_prefixed(data);
});
