use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use mlog::{Error, Log, OpenFlags};
use tempfile::tempdir;

/// Several independent readers racing a single writer across multiple
/// segment rollovers. Each reader tracks its own cursor; none of them
/// coordinate with each other, only with the writer's progress, mirroring
/// many independent consumers fanned out off one producer.
#[test]
fn many_readers_follow_one_writer_across_rollovers() {
    let _ = env_logger::try_init();
    let dir = tempdir().expect("tempdir");
    let log = Arc::new(Log::open(dir.path(), 8192, OpenFlags::ReadDirty).expect("open log"));

    const TOTAL: u64 = 600;
    const READERS: usize = 6;

    let writer_log = Arc::clone(&log);
    let writer = thread::spawn(move || {
        for i in 0..TOTAL {
            let msg = format!("event-{i}");
            loop {
                match writer_log.write(msg.as_bytes()) {
                    Ok(_) => break,
                    Err(e) if e.is_retriable() => continue,
                    Err(e) => panic!("unexpected write error: {e}"),
                }
            }
        }
    });

    let last_seen = Arc::new(AtomicU64::new(0));
    let mut readers = Vec::new();
    for _ in 0..READERS {
        let log = Arc::clone(&log);
        let last_seen = Arc::clone(&last_seen);
        readers.push(thread::spawn(move || {
            let mut offset = 0u64;
            while offset < TOTAL {
                match log.read(offset) {
                    Ok(frame) => {
                        assert_eq!(frame.payload(), format!("event-{offset}").as_bytes());
                        offset += 1;
                    }
                    Err(e) if e.is_retriable() => continue,
                    Err(Error::NoSuchRecord) => continue,
                    Err(e) => panic!("unexpected read error: {e}"),
                }
            }
            last_seen.fetch_max(offset, Ordering::AcqRel);
        }));
    }

    writer.join().expect("writer thread panicked");
    for reader in readers {
        reader.join().expect("reader thread panicked");
    }

    assert_eq!(last_seen.load(Ordering::Acquire), TOTAL);
    assert!(dir.path().join("0.log").exists());
    assert!(dir.read_dir().unwrap().filter_map(|e| e.ok()).count() > 2);
}
