// File storage core for a small filesystem. Two layers:
//   - bio: a bounded, write-back LRU cache of disk sectors. All device
//     traffic from the layers above goes through it.
//   - fs: the on-disk inode format (direct, indirect and
//     double-indirect indices) and the in-memory open-inode table.
//
// The block device, the free sector map and the timer are external
// collaborators, consumed behind the traits in dev.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bio;
pub mod dev;
pub mod error;
pub mod fs;
pub mod param;

pub use bio::{Bcache, Stats};
pub use dev::{BlockDevice, FreeMap, TickSource};
pub use error::{Error, Result};
pub use fs::{Inode, Itable};
