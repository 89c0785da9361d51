//! Small filesystem and path helpers shared by [`crate::segment`] and
//! [`crate::log`]. Deliberately thin: these are the external-collaborator
//! utilities the design leaves unspecified beyond their contract.

use std::path::{Path, PathBuf};

use crate::error::Result;

pub const LOG_SUFFIX: &str = "log";
pub const INDEX_SUFFIX: &str = "idx";

pub fn page_size() -> usize {
    // SAFETY: sysconf with _SC_PAGESIZE has no preconditions and never
    // returns a value callers need to free.
    let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if value <= 0 {
        4096
    } else {
        value as usize
    }
}

pub fn ensure_directory(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    Ok(())
}

pub fn data_path(dir: &Path, base_offset: u64) -> PathBuf {
    dir.join(format!("{base_offset}.{LOG_SUFFIX}"))
}

pub fn index_path(dir: &Path, base_offset: u64) -> PathBuf {
    dir.join(format!("{base_offset}.{INDEX_SUFFIX}"))
}

/// Parses a `<base_offset>.log` file name into its base offset, or
/// `None` if `name` doesn't have that shape.
pub fn parse_base_offset(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(&format!(".{LOG_SUFFIX}"))?;
    stem.parse::<u64>().ok()
}
