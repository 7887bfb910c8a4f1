#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use parallel_gzip::GzipDecompress;

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    payload: Vec<u8>,
    expected_len: u32,
}

fuzz_target!(|input: FuzzInput| {
    if input.payload.len() > 64 * 1024 {
        return;
    }

    // Either the declared size or an unrelated one.
    if let Ok(declared) = GzipDecompress::original_len(&input.payload) {
        let _ = GzipDecompress.decompress(&input.payload, declared);
    }
    let _ = GzipDecompress.decompress(&input.payload, u64::from(input.expected_len));
});
