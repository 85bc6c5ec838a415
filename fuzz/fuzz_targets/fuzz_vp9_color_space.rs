#![no_main]

use libfuzzer_sys::fuzz_target;
use shiguredo_mux::{codec::fix_vp9_color_space, metadata::MatrixCoefficients};

fuzz_target!(|data: &[u8]| {
    let mut frame = data.to_vec();
    let _ = fix_vp9_color_space(&mut frame, MatrixCoefficients::Bt709);
});
