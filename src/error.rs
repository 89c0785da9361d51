use std::fmt;

/// Every failure mode the engine can surface, named for what went wrong
/// rather than for a historical error code.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),

    /// `segment_size` (or an on-disk segment's length) is not a multiple
    /// of the OS page size.
    NotPageMultiple,
    /// The framed record is larger than an entire segment could ever hold.
    PayloadTooLarge,

    /// Recovery found an index entry pointing past `w_data`, or an
    /// otherwise structurally broken data/index file pair.
    Corrupt(&'static str),

    /// Directory did not exist and could not be created.
    OpenLogDir,
    /// A directory scan found a segment whose name or header could not
    /// be parsed.
    LoadSegments,
    /// Failed to insert a segment's base offset into the index.
    IndexCreate,
    /// Caller attempted to append a key <= the tree's current maximum.
    IndexNotMonotonic,
    /// A split left the tree partially linked; the containing `Log` must
    /// not be used any further.
    IndexInconsistent,
    /// The index's try-lock was contended.
    IndexLocked,

    /// The coordinator's writer mutex was already held.
    Lock,
    /// The underlying mutex primitive failed (poisoned).
    LockOp,

    /// `msync` on the data mapping failed to advance the sync boundary.
    DataSync,
    /// `msync` on the index mapping failed to advance the sync boundary.
    IndexSync,

    /// No frame exists yet at the requested offset.
    NoSuchRecord,
    /// The frame's header has not been published yet (`flags == 0`);
    /// retriable.
    InvalidHeader,
    /// The read landed on (or was redirected into) an end-of-segment
    /// marker with no following segment.
    EndOfSegment,
}

impl Error {
    /// Whether a caller can retry the same operation without having
    /// observed any state change.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::Lock | Error::IndexLocked | Error::InvalidHeader
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::NotPageMultiple => write!(f, "size is not a multiple of the page size"),
            Error::PayloadTooLarge => write!(f, "payload does not fit in a single segment"),
            Error::Corrupt(msg) => write!(f, "corrupt on-disk state: {msg}"),
            Error::OpenLogDir => write!(f, "could not open or create log directory"),
            Error::LoadSegments => write!(f, "failed to load segments from directory"),
            Error::IndexCreate => write!(f, "failed to create index"),
            Error::IndexNotMonotonic => write!(f, "index key must be greater than the current maximum"),
            Error::IndexInconsistent => {
                write!(f, "index is potentially inconsistent after a failed split")
            }
            Error::IndexLocked => write!(f, "index lock contended"),
            Error::Lock => write!(f, "writer lock contended"),
            Error::LockOp => write!(f, "writer mutex poisoned"),
            Error::DataSync => write!(f, "data msync failed"),
            Error::IndexSync => write!(f, "index msync failed"),
            Error::NoSuchRecord => write!(f, "no record at that offset"),
            Error::InvalidHeader => write!(f, "header not yet published"),
            Error::EndOfSegment => write!(f, "end of segment"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
