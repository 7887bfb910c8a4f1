#![no_main]

use libfuzzer_sys::fuzz_target;
use parallel_gzip::{decompress, Settings};

fuzz_target!(|data: &[u8]| {
    if data.len() > 64 * 1024 {
        return;
    }

    let settings = Settings {
        max_queue_size: 4,
        max_concurrency: 2,
        ..Settings::default()
    };

    // Arbitrary archives must fail cleanly, never panic or hang.
    let mut output = Vec::new();
    let _ = decompress(data, &mut output, &settings);
});
