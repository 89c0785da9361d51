//! A fixed-size, memory-mapped data+index file pair supporting lock-free
//! concurrent appends.
//!
//! # Design
//!
//! Every segment is two files: `<base_offset>.log` holds frames back to
//! back, `<base_offset>.idx` holds one `u64` physical offset per frame
//! (so a relative frame index is an O(1) lookup instead of a linear
//! scan). Both are `ftruncate`d to their full size up front; nothing
//! grows in place.
//!
//! A single `AtomicU64` packs the next-free-index-slot and
//! next-free-data-byte offsets (`w_index` in the high 32 bits, `w_data`
//! in the low 32 bits) so claiming space for a frame is one CAS rather
//! than two, which would otherwise let a claim on one field observe a
//! torn, inconsistent pair. A second packed word, `sync`, records the
//! durable prefix boundary advanced by [`Segment::sync`].
//!
//! When a frame wouldn't leave enough room for a trailing end-of-segment
//! marker, the writer claims 12 bytes for that marker instead and the
//! caller rolls to a new segment. This keeps "is this segment full?" an
//! O(1) check of the final header rather than a scan.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::frame::{self, FrameHeader, HEADER_SIZE};
use crate::mmap::MmapFile;
use crate::util;

const INDEX_ENTRY_SIZE: usize = 8;

fn pack(hi: u32, lo: u32) -> u64 {
    ((hi as u64) << 32) | lo as u64
}

fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// Which frames a read is allowed to see.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenFlags {
    /// See any frame whose header is published, synced or not.
    ReadDirty,
    /// See only frames below the segment's synced boundary.
    ReadCommitted,
}

/// A zero-copy view of one frame, borrowed from a segment's mapping.
pub struct ReadFrame<'a> {
    pub header: FrameHeader,
    pub payload: &'a [u8],
}

pub struct Segment {
    base_offset: u64,
    size: usize,
    data: MmapFile,
    index: MmapFile,
    write: AtomicU64,
    sync: AtomicU64,
    flags: OpenFlags,
}

impl Segment {
    fn index_entry_count(size: usize) -> usize {
        size.div_ceil(HEADER_SIZE)
    }

    /// Creates a brand new, empty segment at `base_offset`.
    pub fn create(dir: &Path, base_offset: u64, size: usize, flags: OpenFlags) -> Result<Self> {
        if size % util::page_size() != 0 {
            return Err(Error::NotPageMultiple);
        }
        util::ensure_directory(dir)?;
        let data = MmapFile::create(&util::data_path(dir, base_offset), size)?;
        let index_len = Self::index_entry_count(size) * INDEX_ENTRY_SIZE;
        let index = MmapFile::create(&util::index_path(dir, base_offset), index_len)?;
        log::debug!("created segment base_offset={base_offset} size={size}");
        Ok(Segment {
            base_offset,
            size,
            data,
            index,
            write: AtomicU64::new(0),
            sync: AtomicU64::new(0),
            flags,
        })
    }

    /// Opens an existing segment and recovers its write offsets by
    /// scanning the index.
    pub fn open(dir: &Path, base_offset: u64, size: usize, flags: OpenFlags) -> Result<Self> {
        let data = MmapFile::open(&util::data_path(dir, base_offset))?;
        if data.len() != size {
            return Err(Error::Corrupt("segment data file size does not match expected size"));
        }
        let index = MmapFile::open(&util::index_path(dir, base_offset))?;

        let (w_index, w_data) = recover_offsets(&data, &index)?;
        log::debug!(
            "recovered segment base_offset={base_offset} w_index={w_index} w_data={w_data}"
        );
        Ok(Segment {
            base_offset,
            size,
            data,
            index,
            write: AtomicU64::new(pack(w_index, w_data)),
            sync: AtomicU64::new(0),
            flags,
        })
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// The physical byte offset one past the last claimed frame. Used as
    /// the next segment's `base_offset` on rollover.
    pub fn write_offset(&self) -> u64 {
        unpack(self.write.load(Ordering::Acquire)).1 as u64
    }

    pub fn record_count(&self) -> u32 {
        unpack(self.write.load(Ordering::Acquire)).0
    }

    fn sealed_at(&self, w_data: u32) -> Result<bool> {
        if (w_data as usize) < HEADER_SIZE {
            return Ok(false);
        }
        let prior = self.data.range(w_data as usize - HEADER_SIZE, HEADER_SIZE)?;
        Ok(frame::load_flags(prior) == frame::FLAGS_EOS)
    }

    fn store_index_entry(&self, i: usize, value: u64) {
        // SAFETY: `i` is the slot this thread's successful CAS claimed;
        // no other thread will touch it.
        let buf = unsafe {
            self.index
                .range_mut_shared(i * INDEX_ENTRY_SIZE, INDEX_ENTRY_SIZE)
                .expect("claimed index slot is in bounds")
        };
        let ptr = buf.as_mut_ptr() as *const AtomicU64;
        // SAFETY: 8-byte aligned, exclusively owned for the duration of
        // this call.
        unsafe { (*ptr).store(value, Ordering::Release) };
    }

    fn load_index_entry(&self, i: usize) -> Result<u64> {
        let buf = self.index.range(i * INDEX_ENTRY_SIZE, INDEX_ENTRY_SIZE)?;
        let ptr = buf.as_ptr() as *const AtomicU64;
        // SAFETY: 8-byte aligned; concurrent writers only ever store a
        // larger, still-valid physical offset into slots at or after
        // this one, never this one once it is readable.
        Ok(unsafe { (*ptr).load(Ordering::Acquire) })
    }

    /// Claims space for `payload`, writes it, and publishes the frame.
    /// A single, non-blocking claim attempt: on CAS contention this
    /// returns [`Error::Lock`] for the caller to retry, it does not spin.
    pub fn write(&self, payload: &[u8]) -> Result<usize> {
        let frame_size = HEADER_SIZE + payload.len();
        if HEADER_SIZE + frame_size > self.size {
            return Err(Error::PayloadTooLarge);
        }

        let current = self.write.load(Ordering::Acquire);
        let (w_index, w_data) = unpack(current);
        if self.sealed_at(w_data)? {
            return Err(Error::EndOfSegment);
        }

        let remaining = self.size - w_data as usize;
        if HEADER_SIZE + frame_size > remaining {
            let next = pack(w_index, w_data + HEADER_SIZE as u32);
            self.write
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .map_err(|_| Error::Lock)?;
            // SAFETY: this CAS is the only claim on [w_data, w_data+12).
            let buf = unsafe { self.data.range_mut_shared(w_data as usize, HEADER_SIZE)? };
            frame::write_eos(buf);
            log::debug!("segment base_offset={} sealed at {}", self.base_offset, w_data);
            return Err(Error::EndOfSegment);
        }

        let next = pack(w_index + 1, w_data + frame_size as u32);
        self.write
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::Lock)?;

        // SAFETY: this CAS is the only claim on [w_data, w_data+frame_size).
        let payload_buf =
            unsafe { self.data.range_mut_shared(w_data as usize + HEADER_SIZE, payload.len())? };
        payload_buf.copy_from_slice(payload);
        let crc = frame::crc32(payload);
        // SAFETY: same claimed range as above.
        let header_buf = unsafe { self.data.range_mut_shared(w_data as usize, HEADER_SIZE)? };
        frame::write_header_fields(header_buf, frame_size as u32, crc);
        frame::store_flags(header_buf, frame::FLAGS_READY);
        self.store_index_entry(w_index as usize, w_data as u64);

        Ok(payload.len())
    }

    /// Reads the frame at `relative_index`, the index of this segment's
    /// frames starting at 0. Returns [`Error::EndOfSegment`] (rather than
    /// [`Error::NoSuchRecord`]) when the index lands exactly on this
    /// segment's seal, so the log coordinator can jump to the next
    /// segment instead of reporting a gap.
    pub fn read(&self, relative_index: u32) -> Result<ReadFrame<'_>> {
        let (w_index, w_data) = unpack(self.write.load(Ordering::Acquire));
        let read_limit = match self.flags {
            OpenFlags::ReadDirty => w_data,
            OpenFlags::ReadCommitted => unpack(self.sync.load(Ordering::Acquire)).1,
        };

        if relative_index >= w_index {
            if self.sealed_at(w_data)? {
                return Err(Error::EndOfSegment);
            }
            return Err(Error::NoSuchRecord);
        }

        let offset = self.load_index_entry(relative_index as usize)?;
        if offset as u32 >= read_limit {
            return Err(Error::NoSuchRecord);
        }

        let header_bytes = self.data.range(offset as usize, HEADER_SIZE)?;
        let header = frame::read_header(header_bytes)?;
        if header.is_eos() {
            return Err(Error::EndOfSegment);
        }
        let payload = self
            .data
            .range(offset as usize + HEADER_SIZE, header.payload_size())?;
        if frame::crc32(payload) != header.crc32 {
            return Err(Error::Corrupt("crc mismatch"));
        }
        Ok(ReadFrame { header, payload })
    }

    /// Syncs the durable prefix forward to the current write offset.
    /// Returns the number of newly-durable data bytes.
    pub fn sync(&self) -> Result<u64> {
        let (w_index, w_data) = unpack(self.write.load(Ordering::Acquire));
        let (s_index, s_data) = unpack(self.sync.load(Ordering::Acquire));

        if w_data > s_data {
            self.data
                .flush_range(s_data as usize, (w_data - s_data) as usize)
                .map_err(|_| Error::DataSync)?;
        }
        if w_index > s_index {
            self.index
                .flush_range(s_index as usize * INDEX_ENTRY_SIZE, (w_index - s_index) as usize * INDEX_ENTRY_SIZE)
                .map_err(|_| Error::IndexSync)?;
        }

        let synced = (w_data - s_data) as u64;
        self.sync.store(pack(w_index, w_data), Ordering::Release);
        Ok(synced)
    }

    /// Best-effort durability flush before the segment is dropped.
    pub fn close(&self) -> Result<()> {
        self.sync()?;
        Ok(())
    }
}

/// Recovers `(w_index, w_data)` by scanning the index from slot 0 until
/// the first unwritten (zero) slot, reading each frame's own header to
/// find where the next one starts. A slot whose frame header is claimed
/// but never published (`flags == 0`, a crash mid-write) ends the scan
/// at that slot's offset, discarding the torn frame.
fn recover_offsets(data: &MmapFile, index: &MmapFile) -> Result<(u32, u32)> {
    let entry_count = index.len() / INDEX_ENTRY_SIZE;
    let mut w_index: u32 = 0;
    let mut w_data: u32 = 0;

    for i in 0..entry_count {
        let raw = u64::from_le_bytes(index.range(i * INDEX_ENTRY_SIZE, INDEX_ENTRY_SIZE)?.try_into().unwrap());

        if raw == 0 && i == 0 {
            let header_bytes = data.range(0, HEADER_SIZE)?;
            if frame::load_flags(header_bytes) == frame::FLAGS_EMPTY {
                return Ok((0, 0));
            }
            // offset 0 is a legitimate physical offset for the first
            // frame; fall through and inspect it below.
        } else if raw == 0 {
            break;
        }

        let offset = raw as u32;
        let header_bytes = data.range(offset as usize, HEADER_SIZE)?;
        if frame::load_flags(header_bytes) == frame::FLAGS_EMPTY {
            w_data = offset;
            break;
        }
        let header = frame::read_header(header_bytes)?;
        w_data = offset + header.size;
        w_index = (i + 1) as u32;
        if header.is_eos() {
            break;
        }
    }

    Ok((w_index, w_data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SEGMENT_SIZE: usize = 4096;

    #[test]
    fn write_then_read_round_trip() {
        let dir = tempdir().unwrap();
        let segment = Segment::create(dir.path(), 0, SEGMENT_SIZE, OpenFlags::ReadDirty).unwrap();
        segment.write(b"hello").unwrap();
        segment.write(b"world!").unwrap();

        let first = segment.read(0).unwrap();
        assert_eq!(first.payload, b"hello");
        let second = segment.read(1).unwrap();
        assert_eq!(second.payload, b"world!");
        assert!(matches!(segment.read(2), Err(Error::NoSuchRecord)));
    }

    #[test]
    fn seals_when_next_frame_would_not_leave_room_for_eos() {
        let dir = tempdir().unwrap();
        let segment = Segment::create(dir.path(), 0, SEGMENT_SIZE, OpenFlags::ReadDirty).unwrap();
        // 3012 + 1012 fit; 1112 does not leave room for a trailing EOS.
        segment.write(&vec![1u8; 3012 - HEADER_SIZE]).unwrap();
        segment.write(&vec![2u8; 1012 - HEADER_SIZE]).unwrap();
        assert!(matches!(
            segment.write(&vec![3u8; 1112 - HEADER_SIZE]),
            Err(Error::EndOfSegment)
        ));
        assert!(matches!(segment.write(b"anything"), Err(Error::EndOfSegment)));
    }

    #[test]
    fn payload_larger_than_segment_is_rejected() {
        let dir = tempdir().unwrap();
        let segment = Segment::create(dir.path(), 0, SEGMENT_SIZE, OpenFlags::ReadDirty).unwrap();
        let huge = vec![0u8; SEGMENT_SIZE];
        assert!(matches!(segment.write(&huge), Err(Error::PayloadTooLarge)));
    }

    #[test]
    fn reopen_recovers_write_offsets() {
        let dir = tempdir().unwrap();
        let base_offset;
        {
            let segment = Segment::create(dir.path(), 0, SEGMENT_SIZE, OpenFlags::ReadDirty).unwrap();
            segment.write(b"first").unwrap();
            segment.write(b"second").unwrap();
            segment.sync().unwrap();
            base_offset = segment.write_offset();
        }
        let reopened = Segment::open(dir.path(), 0, SEGMENT_SIZE, OpenFlags::ReadDirty).unwrap();
        assert_eq!(reopened.write_offset(), base_offset);
        assert_eq!(reopened.record_count(), 2);
        assert_eq!(reopened.read(0).unwrap().payload, b"first");
        assert_eq!(reopened.read(1).unwrap().payload, b"second");
    }

    #[test]
    fn read_committed_hides_unsynced_frames() {
        let dir = tempdir().unwrap();
        let segment = Segment::create(dir.path(), 0, SEGMENT_SIZE, OpenFlags::ReadCommitted).unwrap();
        segment.write(b"hello").unwrap();
        assert!(matches!(segment.read(0), Err(Error::NoSuchRecord)));
        segment.sync().unwrap();
        assert_eq!(segment.read(0).unwrap().payload, b"hello");
    }
}
