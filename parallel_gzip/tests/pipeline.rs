use std::io::{self, Cursor};
use std::thread;
use std::time::{Duration, Instant};

use parallel_gzip::{
    compress, decompress, run, run_with_cancel, ArchiveSink, CancellationToken, ChunkSink,
    ChunkSource, Error, InputChunk, OutputChunk, PlainSink, PlainSource, Result, Settings,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn settings(block_size: usize, concurrency: usize, queue: isize) -> Settings {
    Settings {
        max_queue_size: queue,
        max_concurrency: concurrency,
        block_size,
        max_blocks_to_write_at_once: 3,
        compression_level: 6,
    }
}

fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    // Mix runs and noise so blocks compress to different sizes.
    let mut data = Vec::with_capacity(len);
    while data.len() < len {
        if rng.gen_bool(0.5) {
            let byte = rng.gen::<u8>();
            let run = rng.gen_range(1..200);
            data.extend(std::iter::repeat(byte).take(run));
        } else {
            let noise = rng.gen_range(1..200);
            data.extend((0..noise).map(|_| rng.gen::<u8>()));
        }
    }
    data.truncate(len);
    data
}

fn roundtrip(data: &[u8], settings: &Settings) -> Vec<u8> {
    let mut archive = Vec::new();
    compress(Cursor::new(data), &mut archive, settings).unwrap();
    let mut restored = Vec::new();
    decompress(Cursor::new(&archive), &mut restored, settings).unwrap();
    restored
}

/// Splits an archive into its (length prefix, payload) entries.
fn entries(archive: &[u8]) -> Vec<&[u8]> {
    let mut rest = archive;
    let mut out = Vec::new();
    while !rest.is_empty() {
        let len = i64::from_le_bytes(rest[..8].try_into().unwrap()) as usize;
        out.push(&rest[8..8 + len]);
        rest = &rest[8 + len..];
    }
    out
}

fn isize_of(payload: &[u8]) -> u32 {
    u32::from_le_bytes(payload[payload.len() - 4..].try_into().unwrap())
}

#[test]
fn test_empty_input() {
    let settings = settings(1024, 4, 8);
    let mut archive = Vec::new();
    compress(io::empty(), &mut archive, &settings).unwrap();
    assert!(archive.is_empty());

    let mut restored = Vec::new();
    decompress(io::empty(), &mut restored, &settings).unwrap();
    assert!(restored.is_empty());
}

#[test]
fn test_input_smaller_than_block() {
    let data = b"a short line of text\n".repeat(3);
    let settings = settings(64 * 1024, 4, 8);
    let mut archive = Vec::new();
    compress(Cursor::new(&data), &mut archive, &settings).unwrap();
    let parts = entries(&archive);
    assert_eq!(parts.len(), 1);
    assert_eq!(isize_of(parts[0]), data.len() as u32);
    assert_eq!(roundtrip(&data, &settings), data);
}

#[test]
fn test_two_and_a_half_blocks() {
    let block = 64 * 1024;
    let data = random_bytes(block * 5 / 2, 7);
    let settings = settings(block, 4, 2);

    let mut archive = Vec::new();
    compress(Cursor::new(&data), &mut archive, &settings).unwrap();
    let parts = entries(&archive);
    let sizes: Vec<u32> = parts.iter().map(|p| isize_of(p)).collect();
    assert_eq!(sizes, vec![65536, 65536, 32768]);
    let framing: usize = parts.iter().map(|p| 8 + p.len()).sum();
    assert_eq!(framing, archive.len());

    assert_eq!(roundtrip(&data, &settings), data);
}

#[test]
fn test_roundtrip_shapes() {
    let data = random_bytes(300_000, 11);
    for (block, concurrency, queue) in [
        (1, 2, 64),
        (4096, 1, 1),
        (4096, 8, 1),
        (10_000, 3, -1),
        (1 << 20, 4, 4),
    ] {
        let settings = settings(block, concurrency, queue);
        let input = if block == 1 { &data[..5_000] } else { &data[..] };
        assert_eq!(
            roundtrip(input, &settings),
            input,
            "block {} concurrency {} queue {}",
            block,
            concurrency,
            queue
        );
    }
}

#[test]
fn test_order_preserved_under_random_delays() {
    for (n, seed) in [(0usize, 1u64), (1, 2), (2, 3), (17, 4), (250, 5)] {
        let blocks: Vec<Vec<u8>> = (0..n as u32).map(|i| i.to_le_bytes().to_vec()).collect();
        let data: Vec<u8> = blocks.concat();

        let jitter = |chunk: &InputChunk| -> Result<Vec<u8>> {
            let mut rng = StdRng::seed_from_u64(seed ^ u64::from(chunk.data()[0]));
            thread::sleep(Duration::from_micros(rng.gen_range(0..500)));
            Ok(chunk.data().to_vec())
        };

        let mut out = Vec::new();
        run(
            PlainSource::new(Cursor::new(&data), 4),
            &jitter,
            PlainSink::new(&mut out),
            &settings(4, 4, 3),
        )
        .unwrap();
        assert_eq!(out, data, "{} blocks", n);
    }
}

#[test]
fn test_compression_levels_roundtrip() {
    let data = random_bytes(50_000, 21);
    for level in [0, 1, 9] {
        let settings = Settings {
            compression_level: level,
            ..settings(8192, 2, 4)
        };
        assert_eq!(roundtrip(&data, &settings), data);
    }
}

#[test]
fn test_truncated_archive_fails() {
    let data = random_bytes(20_000, 3);
    let settings = settings(4096, 2, 4);
    let mut archive = Vec::new();
    compress(Cursor::new(&data), &mut archive, &settings).unwrap();
    archive.truncate(archive.len() - 5);

    let err = decompress(Cursor::new(&archive), io::sink(), &settings).unwrap_err();
    let Error::Run { operation, source } = &err else {
        panic!("unexpected error {:?}", err);
    };
    assert_eq!(*operation, "failed to decompress");
    let Error::Aggregate(failures) = source.as_ref() else {
        panic!("unexpected error {:?}", source);
    };
    assert!(failures
        .iter()
        .any(|f| matches!(f.root_cause(), Error::InvalidArchive(_))));
    assert!(err.to_string().starts_with("failed to decompress"));
}

#[test]
fn test_corrupt_block_fails() {
    let data = random_bytes(40_000, 9);
    let settings = settings(8192, 3, 2);
    let mut archive = Vec::new();
    compress(Cursor::new(&data), &mut archive, &settings).unwrap();

    // Flip the stored size of the second block.
    let first_len = i64::from_le_bytes(archive[..8].try_into().unwrap()) as usize;
    let second_start = 8 + first_len;
    let second_len =
        i64::from_le_bytes(archive[second_start..second_start + 8].try_into().unwrap()) as usize;
    let isize_at = second_start + 8 + second_len - 4;
    archive[isize_at] ^= 0x01;

    let err = decompress(Cursor::new(&archive), io::sink(), &settings).unwrap_err();
    assert!(!err.is_cancelled());
    assert!(err.to_string().contains("failed to decompress"));
}

#[test]
fn test_transform_failures_are_aggregated() {
    let data = random_bytes(64 * 1024, 5);
    let poisoned = &data[20 * 1024..21 * 1024];
    let reject_poisoned = |chunk: &InputChunk| -> Result<Vec<u8>> {
        thread::sleep(Duration::from_millis(1));
        if chunk.data() == poisoned {
            Err(Error::InvalidArchive("rejected".into()))
        } else {
            Ok(chunk.data().to_vec())
        }
    };

    let started = Instant::now();
    let result = run(
        PlainSource::new(Cursor::new(&data), 1024),
        &reject_poisoned,
        PlainSink::new(io::sink()),
        &settings(1024, 4, 2),
    );
    assert!(started.elapsed() < Duration::from_secs(10));

    let Err(Error::Aggregate(failures)) = result else {
        panic!("expected aggregate failure, got {:?}", result);
    };
    assert!(!failures.is_empty());
    for failure in &failures {
        assert!(!failure.is_cancelled());
        assert!(matches!(failure.root_cause(), Error::InvalidArchive(_)));
    }
}

/// Fails after handing out a few blocks.
struct FailingSource {
    left: usize,
}

impl ChunkSource for FailingSource {
    fn next_chunk(&mut self) -> Result<Option<(Vec<u8>, u64)>> {
        if self.left == 0 {
            return Err(Error::InvalidArchive("source broke".into()));
        }
        self.left -= 1;
        Ok(Some((vec![1; 16], 16)))
    }
}

#[test]
fn test_reader_failure_stops_pipeline() {
    let identity = |chunk: &InputChunk| -> Result<Vec<u8>> { Ok(chunk.data().to_vec()) };
    let err = run(
        FailingSource { left: 10 },
        &identity,
        PlainSink::new(io::sink()),
        &settings(16, 3, 2),
    )
    .unwrap_err();
    let Error::Aggregate(failures) = err else {
        panic!("expected aggregate failure");
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].to_string(), "failed to read blocks");
}

/// Accepts a few chunks, then fails every write.
struct FailingSink {
    accepted: usize,
}

impl ChunkSink for FailingSink {
    fn write_chunk(&mut self, _chunk: &OutputChunk) -> Result<()> {
        if self.accepted == 0 {
            return Err(Error::InvalidState("sink broke"));
        }
        self.accepted -= 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[test]
fn test_writer_failure_stops_pipeline() {
    let data = random_bytes(1 << 20, 13);
    let identity = |chunk: &InputChunk| -> Result<Vec<u8>> { Ok(chunk.data().to_vec()) };
    let started = Instant::now();
    let err = run(
        PlainSource::new(Cursor::new(&data), 512),
        &identity,
        FailingSink { accepted: 5 },
        &settings(512, 4, 2),
    )
    .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(10));

    let Error::Aggregate(failures) = err else {
        panic!("expected aggregate failure");
    };
    assert_eq!(failures.len(), 1);
    assert!(matches!(failures[0].root_cause(), Error::InvalidState("sink broke")));
}

#[test]
fn test_cancel_before_start() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let data = random_bytes(10_000, 17);
    let result = run_with_cancel(
        PlainSource::new(Cursor::new(&data), 1000),
        &parallel_gzip::GzipCompress::default(),
        ArchiveSink::new(io::sink()),
        &settings(1000, 2, 2),
        &cancel,
    );
    assert!(matches!(result, Err(Error::Cancelled)));
}

#[test]
fn test_transform_panic_stops_pipeline() {
    let data: Vec<u8> = (0..64u8).flat_map(|i| [i; 4]).collect();
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    thread::spawn(move || {
        let exploding = |chunk: &InputChunk| -> Result<Vec<u8>> {
            if chunk.data()[0] == 3 {
                thread::sleep(Duration::from_millis(50));
                panic!("transform exploded on block 3");
            }
            Ok(chunk.data().to_vec())
        };
        let result = run(
            PlainSource::new(Cursor::new(data), 4),
            &exploding,
            PlainSink::new(Vec::new()),
            &settings(4, 3, 4),
        );
        let _ = done_tx.send(result);
    });

    let result = done_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("pipeline did not stop after a transform panicked");
    let failures = match result {
        Err(Error::Aggregate(failures)) => failures,
        other => panic!("expected aggregate, got {:?}", other),
    };
    assert!(failures
        .iter()
        .any(|f| matches!(f.root_cause(), Error::InvalidState(_))));
}

#[test]
fn test_huge_queue_size_roundtrip() {
    let data = random_bytes(100_000, 11);
    assert_eq!(roundtrip(&data, &settings(4096, 3, isize::MAX)), data);
}
