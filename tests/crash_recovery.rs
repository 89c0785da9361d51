use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use mlog::frame::HEADER_SIZE;
use mlog::{Error, Log, OpenFlags};
use tempfile::tempdir;

/// Slot size of a segment's `.idx` file: one `u64` physical offset per
/// frame (mirrors `mlog::segment`'s private `INDEX_ENTRY_SIZE`).
const INDEX_ENTRY_SIZE: u64 = 8;

/// Simulates a crash between a writer's CAS claim and its header
/// publish: the index file gets a third, nonzero entry pointing at a
/// physical offset, but the frame header at that offset is never
/// published (`flags` stays zero). The segment's own `(w_index, w_data)`
/// write cursor only lives in an in-memory `AtomicU64` -- it isn't
/// persisted separately -- so this is the only on-disk trace such a
/// crash would leave. Reopening the log must stop recovery at that slot
/// and discard the torn frame rather than trusting the claimed entry.
#[test]
fn torn_trailing_frame_is_discarded_on_reopen() {
    let dir = tempdir().expect("tempdir");

    {
        let log = Log::open(dir.path(), 4096, OpenFlags::ReadDirty).expect("open log");
        log.write(b"first message").expect("write first");
        log.write(b"second message").expect("write second");
        log.sync().expect("sync");
    }

    let torn_offset =
        (HEADER_SIZE + "first message".len() + HEADER_SIZE + "second message".len()) as u64;

    // Store the claimed-but-unpublished index entry for slot 2.
    let index_path = dir.path().join("0.idx");
    let mut index_file = OpenOptions::new()
        .write(true)
        .open(&index_path)
        .expect("open index file");
    index_file
        .seek(SeekFrom::Start(2 * INDEX_ENTRY_SIZE))
        .expect("seek index");
    index_file
        .write_all(&torn_offset.to_le_bytes())
        .expect("write claimed index entry");
    drop(index_file);

    // The frame header at that offset is left exactly as a fresh
    // `ftruncate`d data file already has it: flags == FLAGS_EMPTY, i.e.
    // claimed but never published.
    let data_path = dir.path().join("0.log");
    let mut data_file = OpenOptions::new()
        .write(true)
        .open(&data_path)
        .expect("open data file");
    data_file.seek(SeekFrom::Start(torn_offset)).expect("seek data");
    data_file
        .write_all(&[0u8; HEADER_SIZE])
        .expect("leave torn header zeroed");
    drop(data_file);

    let log = Log::open(dir.path(), 4096, OpenFlags::ReadDirty).expect("reopen log");
    assert_eq!(log.read(0).expect("read first").payload(), b"first message");
    assert_eq!(log.read(1).expect("read second").payload(), b"second message");
    assert!(matches!(log.read(2), Err(Error::NoSuchRecord)));

    // Recovery stopped at the torn frame's offset, so a fresh write
    // reclaims that exact space instead of leaving a hole.
    log.write(b"third message").expect("write after recovery");
    assert_eq!(log.read(2).expect("read third").payload(), b"third message");
}
