//! The log coordinator: opens a directory of segments, rebuilds the
//! index from what it finds, and routes writes and reads to the right
//! segment, rolling over on end-of-segment.
//!
//! # Design
//!
//! Writers serialize through a non-blocking try-lock mutex (one rollover
//! decision in flight at a time); readers never take that lock and only
//! briefly touch the index's own try-lock while finding which segment an
//! offset lives in. See [`crate::index`] and [`crate::segment`] for the
//! two subsystems this stitches together.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{Error, Result};
use crate::index::MonotonicIndex;
use crate::segment::{OpenFlags, Segment};
use crate::util;

/// Matches the original `mqlog` coordinator's branch factor.
const BRANCH_FACTOR: usize = 7;

/// A page-aligned default segment size (64 MiB), used by callers that
/// don't have a specific size requirement of their own.
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

pub struct Log {
    dir: PathBuf,
    segment_size: u64,
    flags: OpenFlags,
    segments: RwLock<Vec<Arc<Segment>>>,
    index: MonotonicIndex<u32>,
    writer_lock: Mutex<()>,
}

impl Log {
    /// Opens (creating if necessary) a log directory, rebuilding its
    /// index from whatever `*.log` segments are already there.
    pub fn open(dir: impl AsRef<Path>, segment_size: u64, flags: OpenFlags) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if segment_size % util::page_size() as u64 != 0 {
            return Err(Error::NotPageMultiple);
        }
        util::ensure_directory(&dir).map_err(|_| Error::OpenLogDir)?;

        let index = MonotonicIndex::new(BRANCH_FACTOR);
        let mut segments = Vec::new();

        let mut base_offsets: Vec<u64> = fs::read_dir(&dir)
            .map_err(|_| Error::LoadSegments)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter_map(|name| util::parse_base_offset(&name))
            .collect();
        base_offsets.sort_unstable();

        for base_offset in base_offsets {
            let segment = Segment::open(&dir, base_offset, segment_size as usize, flags)
                .map_err(|_| Error::LoadSegments)?;
            let slot = segments.len() as u32;
            segments.push(Arc::new(segment));
            index.append(base_offset, slot).map_err(|err| match err {
                Error::IndexInconsistent => Error::IndexInconsistent,
                _ => Error::IndexCreate,
            })?;
        }

        log::debug!(
            "opened log at {:?} with {} existing segment(s)",
            dir,
            segments.len()
        );

        Ok(Log {
            dir,
            segment_size,
            flags,
            segments: RwLock::new(segments),
            index,
            writer_lock: Mutex::new(()),
        })
    }

    /// Appends `payload`, returning the number of bytes written.
    pub fn write(&self, payload: &[u8]) -> Result<usize> {
        let _guard = self.writer_lock.try_lock().map_err(|_| Error::Lock)?;

        let (segment, is_new) = self.current_segment_or_create()?;

        match segment.write(payload) {
            Ok(n) => Ok(n),
            Err(Error::EndOfSegment) if is_new => {
                // The payload alone doesn't even fit in a fresh segment.
                Err(Error::PayloadTooLarge)
            }
            Err(Error::EndOfSegment) => {
                let rolled = self.roll_segment(&segment)?;
                match rolled.write(payload) {
                    Ok(n) => Ok(n),
                    Err(Error::EndOfSegment) => Err(Error::PayloadTooLarge),
                    Err(other) => Err(other),
                }
            }
            Err(other) => Err(other),
        }
    }

    /// Returns the current (highest base offset) segment, creating the
    /// very first segment if the log is empty. The bool reports whether
    /// the segment was just created by this call.
    fn current_segment_or_create(&self) -> Result<(Arc<Segment>, bool)> {
        if let Some((_, slot)) = self.index.last()? {
            let segments = self.segments.read().map_err(|_| Error::LockOp)?;
            return Ok((Arc::clone(&segments[slot as usize]), false));
        }

        let segment = Arc::new(Segment::create(
            &self.dir,
            0,
            self.segment_size as usize,
            self.flags,
        )?);
        let slot = {
            let mut segments = self.segments.write().map_err(|_| Error::LockOp)?;
            segments.push(Arc::clone(&segment));
            (segments.len() - 1) as u32
        };
        self.index.append(0, slot)?;
        Ok((segment, true))
    }

    /// Creates the next segment after `current`, whose `base_offset` is
    /// `current`'s base offset plus its number of real (non-EOS) frames,
    /// so logical offsets stay gap-free.
    fn roll_segment(&self, current: &Segment) -> Result<Arc<Segment>> {
        let new_base_offset = current.base_offset() + current.record_count() as u64;
        let segment = Arc::new(Segment::create(
            &self.dir,
            new_base_offset,
            self.segment_size as usize,
            self.flags,
        )?);
        let slot = {
            let mut segments = self.segments.write().map_err(|_| Error::LockOp)?;
            segments.push(Arc::clone(&segment));
            (segments.len() - 1) as u32
        };
        self.index.append(new_base_offset, slot)?;
        log::debug!("rolled segment to base_offset={new_base_offset}");
        Ok(segment)
    }

    /// Reads the frame at logical `offset`, following an end-of-segment
    /// marker into the next segment if `offset` landed in a sealed
    /// segment's tail.
    pub fn read(&self, offset: u64) -> Result<LogFrame> {
        let mut offset = offset;
        let mut last_base_offset = None;
        // Bounded by the number of segments: each iteration either
        // returns or jumps to a strictly later base offset.
        loop {
            let (base_offset, slot) = self.index.floor(offset)?.ok_or(Error::NoSuchRecord)?;
            if Some(base_offset) == last_base_offset {
                // The floor lookup landed on the same sealed segment
                // again: there is no next segment to jump to yet.
                return Err(Error::NoSuchRecord);
            }
            let segment = {
                let segments = self.segments.read().map_err(|_| Error::LockOp)?;
                Arc::clone(&segments[slot as usize])
            };
            let relative = (offset - base_offset) as u32;
            match segment.read(relative) {
                Ok(frame) => {
                    let crc32 = frame.header.crc32;
                    return Ok(LogFrame { segment, relative, crc32 });
                }
                Err(Error::EndOfSegment) => {
                    last_base_offset = Some(base_offset);
                    offset = base_offset + segment.record_count() as u64;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Syncs only the current (highest base offset) segment; older
    /// segments are immutable once rolled past and were synced at
    /// rollover.
    pub fn sync(&self) -> Result<u64> {
        let Some((_, slot)) = self.index.last()? else {
            return Ok(0);
        };
        let segment = {
            let segments = self.segments.read().map_err(|_| Error::LockOp)?;
            Arc::clone(&segments[slot as usize])
        };
        segment.sync()
    }

    /// Best-effort: syncs and releases every segment, accumulating (but
    /// not failing fast on) individual close errors.
    pub fn close(&self) -> Result<()> {
        let segments = self.segments.read().map_err(|_| Error::LockOp)?;
        let mut errors = 0;
        for segment in segments.iter() {
            if segment.close().is_err() {
                errors += 1;
            }
        }
        if errors > 0 {
            log::warn!("{errors} segment(s) failed to close cleanly");
        }
        Ok(())
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("error while dropping log: {err}");
        }
    }
}

/// A frame returned from [`Log::read`].
///
/// Holds the `Arc<Segment>` the frame lives in rather than a copy of its
/// bytes: segments are only ever appended to [`Log`]'s segment list, never
/// removed, so the `Arc` keeps the mapping alive for as long as the frame
/// is held and [`payload`](LogFrame::payload) can re-derive the `&[u8]`
/// view straight out of that mapping on every call.
pub struct LogFrame {
    segment: Arc<Segment>,
    relative: u32,
    pub crc32: u32,
}

impl LogFrame {
    /// The frame's payload, borrowed directly from the segment's mapping.
    pub fn payload(&self) -> &[u8] {
        self.segment
            .read(self.relative)
            .expect("a frame this handle was constructed from stays readable for the segment's life")
            .payload
    }
}
