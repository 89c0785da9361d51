//! Packed exclusive|shared lock word for the monotonic B+ tree.
//!
//! Both halves live in one `AtomicU64` (high 32 bits: exclusive holder
//! count, low 32 bits: shared holder count) so acquisition is a single
//! CAS rather than a union over two separately-addressable words. Every
//! acquisition is a single non-blocking attempt: on contention the
//! caller gets [`crate::Error::IndexLocked`] back and decides whether to
//! retry, matching the try-lock discipline used at every other layer of
//! this crate.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

fn pack(exclusive: u32, shared: u32) -> u64 {
    ((exclusive as u64) << 32) | shared as u64
}

fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

pub(crate) struct LockWord(AtomicU64);

impl LockWord {
    pub(crate) fn new() -> Self {
        LockWord(AtomicU64::new(0))
    }

    pub(crate) fn try_acquire_write(&self) -> Result<WriteGuard<'_>> {
        self.0
            .compare_exchange(0, pack(1, 0), Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::IndexLocked)?;
        Ok(WriteGuard(&self.0))
    }

    pub(crate) fn try_acquire_read(&self) -> Result<ReadGuard<'_>> {
        let current = self.0.load(Ordering::Acquire);
        let (exclusive, shared) = unpack(current);
        if exclusive != 0 {
            return Err(Error::IndexLocked);
        }
        let next = pack(0, shared + 1);
        self.0
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::IndexLocked)?;
        Ok(ReadGuard(&self.0))
    }
}

pub(crate) struct WriteGuard<'a>(&'a AtomicU64);

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.0.store(0, Ordering::Release);
    }
}

pub(crate) struct ReadGuard<'a>(&'a AtomicU64);

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        // The shared count lives in the word's low 32 bits; a plain
        // subtract of the whole word is equivalent to decrementing just
        // that half as long as it never underflows, which it can't
        // since this guard is proof a shared acquisition took place.
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_excludes_writer_and_reader() {
        let lock = LockWord::new();
        let guard = lock.try_acquire_write().expect("first writer succeeds");
        assert!(matches!(lock.try_acquire_write(), Err(Error::IndexLocked)));
        assert!(matches!(lock.try_acquire_read(), Err(Error::IndexLocked)));
        drop(guard);
        assert!(lock.try_acquire_write().is_ok());
    }

    #[test]
    fn readers_run_concurrently() {
        let lock = LockWord::new();
        let r1 = lock.try_acquire_read().expect("first reader succeeds");
        let r2 = lock.try_acquire_read().expect("second reader succeeds");
        assert!(matches!(lock.try_acquire_write(), Err(Error::IndexLocked)));
        drop(r1);
        drop(r2);
        assert!(lock.try_acquire_write().is_ok());
    }
}
