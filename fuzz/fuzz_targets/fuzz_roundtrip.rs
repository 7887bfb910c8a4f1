#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use parallel_gzip::{compress, decompress, Settings};

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    data: Vec<u8>,
    block_size: u16,
    concurrency: u8,
    queue_size: i8,
    level: u8,
}

fuzz_target!(|input: FuzzInput| {
    if input.data.len() > 1_000_000 {
        return;
    }

    let settings = Settings {
        max_queue_size: if input.queue_size == 0 { 1 } else { input.queue_size as isize },
        max_concurrency: usize::from(input.concurrency % 8),
        block_size: usize::from(input.block_size).max(1),
        max_blocks_to_write_at_once: 3,
        compression_level: u32::from(input.level % 10),
    };

    let mut archive = Vec::new();
    compress(&input.data[..], &mut archive, &settings).expect("compression failed");
    let mut restored = Vec::new();
    decompress(&archive[..], &mut restored, &settings).expect("decompression failed");
    assert_eq!(restored, input.data);
});
