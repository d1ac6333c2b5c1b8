use core::fmt;

// Error kinds surfaced by the cache and the inode layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    // Sector index past the addressable range, or no valid inode at
    // the given sector.
    NotFound,
    // Requested logical size exceeds what the index tree can address.
    TooLarge,
    // The free sector map could not satisfy an allocation.
    OutOfSpace,
    // The block device failed a read or write.
    IoError,
    // A cache slot buffer could not be allocated, or the open-inode
    // table is full.
    OutOfMemory,
}

pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::NotFound => "entry not found",
            Error::TooLarge => "file too large",
            Error::OutOfSpace => "no free sectors",
            Error::IoError => "device i/o error",
            Error::OutOfMemory => "out of memory",
        };
        write!(f, "{}", msg)
    }
}
