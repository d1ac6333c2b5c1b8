// Filesystem geometry and policy parameters.

pub const SECTOR_SIZE: usize = 512; // bytes per device sector
pub const NBUF: usize = 64; // default buffer cache capacity (sectors)
pub const NINODE: usize = 64; // maximum number of open inodes

pub const NDIRECT: usize = 10; // direct sector pointers per inode
pub const NINDIRECT: usize = 125; // sector pointers per indirect block
pub const NDBL: usize = 125; // indirect children of the double-indirect block

// Largest addressable file: 15,760 sectors, 8,069,120 bytes.
pub const MAXBLOCKS: usize = NDIRECT + NINDIRECT + NDBL * NINDIRECT;
pub const MAXFILE: usize = MAXBLOCKS * SECTOR_SIZE;

pub const TICKS_PER_SEC: u64 = 100;
pub const FLUSH_INTERVAL: u64 = 30 * TICKS_PER_SEC; // periodic write-back period
