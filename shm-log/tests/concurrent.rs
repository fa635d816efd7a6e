use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use shm_log::{Log, LogConfig, WritePath};

const CHUNK: u64 = 4096;

fn config() -> LogConfig {
    LogConfig::default()
        .with_chunk_size(CHUNK)
        .with_max_resident_chunks(8)
        .with_backpressure_timeout(Duration::from_secs(1))
}

/// A record that names its writer and sequence number in every byte pair.
fn record(writer: u8, seq: u32, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| if i % 2 == 0 { writer } else { (seq + i as u32) as u8 })
        .collect()
}

fn read_back(path: &Path, start: u64, end: u64) -> Vec<u8> {
    let mut buf = vec![0; (end - start) as usize];
    File::open(path).unwrap().read_exact_at(&mut buf, start).unwrap();
    buf
}

/// The appends of all writers, sorted by offset, must tile the log without gaps or overlap.
fn assert_partition(mut ranges: Vec<(u64, u64)>, end: u64) {
    ranges.sort_unstable();

    let mut expected = 0;
    for (start, stop) in ranges {
        assert_eq!(start, expected, "gap or overlap at {start}");
        expected = stop;
    }

    assert_eq!(expected, end);
}

#[test]
fn four_writers_fill_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let meta = dir.path().join("log.meta");
    let data = dir.path().join("log.data");

    let written = std::thread::scope(|scope| {
        let writers = (0..4u8)
            .map(|writer| {
                let (meta, data) = (&meta, &data);
                scope.spawn(move || {
                    let log = Log::create_or_attach(meta, data, &config()).unwrap();
                    (0..100)
                        .map(|seq| {
                            let at = log.append(&record(writer, seq, 128)).unwrap();
                            assert_eq!(at.path, WritePath::Single);
                            (at.start, at.end, writer, seq)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        writers
            .into_iter()
            .flat_map(|writer| writer.join().unwrap())
            .collect::<Vec<_>>()
    });

    let log = Log::create_or_attach(&meta, &data, &config()).unwrap();
    let status = log.status();
    assert_eq!(status.cursor, 51200);
    assert_eq!(status.committed_size, 53248);
    assert!(!status.panicked);

    for &(start, end, writer, seq) in &written {
        assert_eq!(read_back(&data, start, end), record(writer, seq, 128));
    }

    assert_partition(
        written.iter().map(|&(start, end, ..)| (start, end)).collect(),
        51200,
    );
}

#[test]
fn shared_handle_partitions_mixed_sizes() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("log.data");
    let log = Log::create_or_attach(dir.path().join("log.meta"), &data, &config()).unwrap();

    // Sizes cover empty, in-chunk, straddling and bulk writes.
    const SIZES: &[usize] = &[0, 1, 17, 300, 1000, 4095, 4096, 5000, 9000];

    let written = std::thread::scope(|scope| {
        let writers = (0..6u8)
            .map(|writer| {
                let log = &log;
                scope.spawn(move || {
                    (0..60u32)
                        .map(|seq| {
                            let len = SIZES[(seq as usize + writer as usize) % SIZES.len()];
                            let at = log.append(&record(writer, seq, len)).unwrap();
                            (at.start, at.end, writer, seq)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        writers
            .into_iter()
            .flat_map(|writer| writer.join().unwrap())
            .collect::<Vec<_>>()
    });

    let total: u64 = written.iter().map(|&(start, end, ..)| end - start).sum();
    let status = log.status();
    assert_eq!(status.cursor, total);
    assert!(status.committed_size >= total);
    assert_eq!(status.committed_size % CHUNK, 0);

    for &(start, end, writer, seq) in &written {
        assert_eq!(read_back(&data, start, end), record(writer, seq, (end - start) as usize));
    }

    let stats = log.stats();
    assert!(stats.boundary_writes > 0);
    assert!(stats.bulk_writes > 0);
    assert!(stats.resident_chunks <= 8);

    assert_partition(
        written
            .iter()
            .filter(|&&(start, end, ..)| start != end)
            .map(|&(start, end, ..)| (start, end))
            .collect(),
        total,
    );
}

#[test]
fn trims_race_with_appends() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("log.data");
    let log = Log::create_or_attach(dir.path().join("log.meta"), &data, &config()).unwrap();
    let done = AtomicBool::new(false);

    let written = std::thread::scope(|scope| {
        let trimmer = scope.spawn(|| {
            let mut trims = 0;
            loop {
                let committed = log.trim().unwrap();
                assert!(committed >= CHUNK);
                trims += 1;

                if done.load(Ordering::Relaxed) {
                    break trims;
                }
            }
        });

        let writers = (0..3u8)
            .map(|writer| {
                let log = &log;
                scope.spawn(move || {
                    (0..200u32)
                        .map(|seq| {
                            let at = log.append(&record(writer, seq, 700)).unwrap();
                            (at.start, at.end, writer, seq)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        let written = writers
            .into_iter()
            .flat_map(|writer| writer.join().unwrap())
            .collect::<Vec<_>>();

        done.store(true, Ordering::Relaxed);
        assert!(trimmer.join().unwrap() > 0);
        written
    });

    let cursor = 3 * 200 * 700;
    assert_eq!(log.status().cursor, cursor);
    assert!(log.status().committed_size >= cursor);

    for &(start, end, writer, seq) in &written {
        assert_eq!(read_back(&data, start, end), record(writer, seq, 700));
    }

    // Nothing was appended since, so trimming settles on the chunk covering the cursor.
    let settled = log.trim().unwrap();
    assert_eq!(settled, cursor.div_ceil(CHUNK) * CHUNK);
    assert_eq!(log.trim().unwrap(), settled);
}
