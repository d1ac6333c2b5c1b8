// Inode layer.
//
// An inode describes a single unnamed file. The on-disk record holds
// the file length and the index tree locating its data: NDIRECT sector
// numbers stored directly, one indirect block of NINDIRECT more, and
// one double-indirect block whose entries are further indirect blocks.
// All records are exactly one sector and move through the buffer
// cache; indirect records live on the stack only while being read or
// rewritten.
//
// The in-memory side is a table of open inodes, one record per inode
// with a nonzero open count, so every opener of the same sector
// observes the same record. That sharing is what makes remove and
// deny_write coherent across handles. Reference counts are Arc strong
// counts: the table holds one, each Inode handle holds one.
//
// A typical sequence:
//   let ino = Itable::open(&itable, sector)?;
//   ino.write_at(b"...", 0)?;
//   ino.read_at(&mut buf, 0)?;
//   drop(ino);                  // the close
//
// remove() only marks the inode; the final close walks the index tree
// and gives every sector back to the free map, the inode's own host
// sector last.

use crate::{
    bio::Bcache,
    dev::FreeMap,
    error::{Error, Result},
    param::{MAXFILE, NDBL, NDIRECT, NINDIRECT, NINODE, SECTOR_SIZE},
};
use alloc::{sync::Arc, vec::Vec};
use array_macro::array;
use core::mem::size_of;
use spin::Mutex;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

// Marks a formatted inode sector.
pub const IMAGIC: u32 = 0x494E_4F44;

const ZERO_SECTOR: [u8; SECTOR_SIZE] = [0; SECTOR_SIZE];

// On-disk inode. Little-endian, exactly one sector.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, AsBytes)]
struct DiskInode {
    start: u32, // legacy field, always 0
    direct: [u32; NDIRECT],
    length: u32, // file length in bytes
    this: u32,   // own sector, advisory
    indirect: u32,
    dbl_indirect: u32,
    indirect_used: u32, // entries used in the indirect block
    dbl_used: u32,      // children referenced by the double-indirect block
    magic: u32,
    _pad: [u8; SECTOR_SIZE - 4 * (NDIRECT + 8)],
}

// First-level index: an array of data-sector numbers.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, AsBytes)]
struct IndirectBlock {
    this: u32,
    parent: u32,
    used: u32,
    blocks: [u32; NINDIRECT],
}

// Second-level index: an array of indirect-block sector numbers.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, AsBytes)]
struct DblIndirectBlock {
    this: u32,
    parent: u32,
    used: u32,
    indirect: [u32; NINDIRECT],
}

const_assert_eq!(size_of::<DiskInode>(), SECTOR_SIZE);
const_assert_eq!(size_of::<IndirectBlock>(), SECTOR_SIZE);
const_assert_eq!(size_of::<DblIndirectBlock>(), SECTOR_SIZE);

// How a sector count spreads across the index tree. `full` second-level
// children use every entry of their indirect block; the `partial` count
// lives in one trailing child after them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Budget {
    direct: usize,
    indirect: usize,
    full: usize,
    partial: usize,
}

impl Budget {
    // Peel a sector count level by level: direct entries first, then
    // the indirect block, then whole second-level children.
    fn for_sectors(mut s: usize) -> Result<Budget> {
        let direct = s.min(NDIRECT);
        s -= direct;
        let indirect = s.min(NINDIRECT);
        s -= indirect;
        let full = (s / NINDIRECT).min(NDBL);
        s -= full * NINDIRECT;
        let partial = s % NINDIRECT;
        s -= partial;
        // A partial child still needs a free entry in the
        // double-indirect block.
        if s != 0 || (full == NDBL && partial > 0) {
            return Err(Error::TooLarge);
        }
        Ok(Budget {
            direct,
            indirect,
            full,
            partial,
        })
    }

    fn for_bytes(len: u64) -> Result<Budget> {
        if len > MAXFILE as u64 {
            return Err(Error::TooLarge);
        }
        let s = SECTOR_SIZE as u64;
        Budget::for_sectors(((len + s - 1) / s) as usize)
    }

    // Child indirect blocks of the double-indirect block, the trailing
    // partial one included.
    fn children(&self) -> usize {
        self.full + (self.partial > 0) as usize
    }

    // Entries used in child `k`.
    fn child_used(&self, k: usize) -> usize {
        if k < self.full {
            NINDIRECT
        } else {
            self.partial
        }
    }
}

// One open inode. `sector` never changes; everything else lives under
// the data lock.
struct MInode {
    sector: u32,
    data: Mutex<IData>,
}

struct IData {
    removed: bool,
    deny_writes: u32,
    din: DiskInode,
}

// The open-inode table, plus the cache and free map every inode
// operation goes through.
pub struct Itable {
    cache: Arc<Bcache>,
    fmap: Arc<dyn FreeMap>,
    table: Mutex<[Option<Arc<MInode>>; NINODE]>,
}

// Handle to an open inode. Cloning via dup() is the reopen; dropping
// the handle is the close.
pub struct Inode {
    table: Arc<Itable>,
    ip: Option<Arc<MInode>>,
}

impl Itable {
    pub fn new(cache: Arc<Bcache>, fmap: Arc<dyn FreeMap>) -> Arc<Itable> {
        Arc::new(Itable {
            cache,
            fmap,
            table: Mutex::new(array![None; NINODE]),
        })
    }

    // Format a fresh inode at `sector` describing a file of `length`
    // bytes, every backing sector allocated and zeroed through the
    // cache. Either the whole tree is built or every sector reserved
    // here goes back to the free map.
    pub fn create(&self, sector: u32, length: u64) -> Result<()> {
        let budget = Budget::for_bytes(length)?;
        let mut reserved = Vec::new();
        let r = self
            .build_tree(sector, length, budget, &mut reserved)
            .and_then(|din| self.cache.write(sector, din.as_bytes()));
        if let Err(e) = r {
            for &s in &reserved {
                self.fmap.release(s, 1);
            }
            return Err(e);
        }
        Ok(())
    }

    fn build_tree(
        &self,
        sector: u32,
        length: u64,
        budget: Budget,
        reserved: &mut Vec<u32>,
    ) -> Result<DiskInode> {
        let mut din = DiskInode::new_zeroed();
        din.this = sector;
        din.length = length as u32;
        din.magic = IMAGIC;
        self.alloc_data_range(&mut din.direct[..budget.direct], reserved)?;
        if budget.indirect > 0 {
            let host = self.alloc_sector(reserved)?;
            let mut ind = IndirectBlock::new_zeroed();
            ind.this = host;
            ind.parent = sector;
            self.alloc_indirect_range(&mut ind, budget.indirect, reserved)?;
            self.cache.write(host, ind.as_bytes())?;
            din.indirect = host;
            din.indirect_used = budget.indirect as u32;
        }
        if budget.children() > 0 {
            let host = self.alloc_sector(reserved)?;
            let mut dbl = DblIndirectBlock::new_zeroed();
            dbl.this = host;
            dbl.parent = sector;
            self.alloc_dbl_children(&mut dbl, 0, budget, reserved)?;
            self.cache.write(host, dbl.as_bytes())?;
            din.dbl_indirect = host;
            din.dbl_used = budget.children() as u32;
        }
        Ok(din)
    }

    // Take one sector from the free map, remembering it for rollback.
    fn alloc_sector(&self, reserved: &mut Vec<u32>) -> Result<u32> {
        let s = self.fmap.allocate(1).ok_or(Error::OutOfSpace)?;
        reserved.push(s);
        Ok(s)
    }

    // Fill each entry of `dst` with a fresh zeroed data sector.
    fn alloc_data_range(&self, dst: &mut [u32], reserved: &mut Vec<u32>) -> Result<()> {
        for e in dst {
            let s = self.alloc_sector(reserved)?;
            self.cache.write(s, &ZERO_SECTOR)?;
            *e = s;
        }
        Ok(())
    }

    // Extend an indirect record with zeroed data sectors up to `to`
    // used entries.
    fn alloc_indirect_range(
        &self,
        ind: &mut IndirectBlock,
        to: usize,
        reserved: &mut Vec<u32>,
    ) -> Result<()> {
        let from = ind.used as usize;
        self.alloc_data_range(&mut ind.blocks[from..to], reserved)?;
        ind.used = to as u32;
        Ok(())
    }

    // Build children `from..budget.children()` of the double-indirect
    // record, each a freshly hosted indirect block filled per the
    // budget and written through the cache.
    fn alloc_dbl_children(
        &self,
        dbl: &mut DblIndirectBlock,
        from: usize,
        budget: Budget,
        reserved: &mut Vec<u32>,
    ) -> Result<()> {
        for k in from..budget.children() {
            let host = self.alloc_sector(reserved)?;
            let mut ind = IndirectBlock::new_zeroed();
            ind.this = host;
            ind.parent = dbl.this;
            self.alloc_indirect_range(&mut ind, budget.child_used(k), reserved)?;
            self.cache.write(host, ind.as_bytes())?;
            dbl.indirect[k] = host;
        }
        dbl.used = budget.children() as u32;
        Ok(())
    }

    // Find the open inode for `sector`, or load it through the cache
    // and install it. Every opener of the same sector shares one
    // record.
    pub fn open(table: &Arc<Itable>, sector: u32) -> Result<Inode> {
        let mut tab = table.table.lock();
        let mut empty = None;
        for (k, ent) in tab.iter().enumerate() {
            match ent {
                Some(ip) if ip.sector == sector => {
                    return Ok(Inode {
                        table: Arc::clone(table),
                        ip: Some(Arc::clone(ip)),
                    });
                }
                None if empty.is_none() => empty = Some(k),
                _ => (),
            }
        }
        let k = empty.ok_or(Error::OutOfMemory)?;
        let mut buf = [0u8; SECTOR_SIZE];
        table.cache.read(sector, &mut buf)?;
        let din = DiskInode::read_from(&buf[..]).unwrap();
        if din.magic != IMAGIC {
            return Err(Error::NotFound);
        }
        let ip = Arc::new(MInode {
            sector,
            data: Mutex::new(IData {
                removed: false,
                deny_writes: 0,
                din,
            }),
        });
        tab[k] = Some(Arc::clone(&ip));
        Ok(Inode {
            table: Arc::clone(table),
            ip: Some(ip),
        })
    }

    // Drop one reference to an open inode. On the last close the table
    // entry is recycled; if the inode was marked removed, its whole
    // tree goes back to the free map.
    fn put(&self, ip: Arc<MInode>) {
        let mut tab = self.table.lock();
        // Two strong references left means this handle plus the table
        // entry: no other opener, and no new one can appear while we
        // hold the table lock.
        if Arc::strong_count(&ip) == 2 {
            {
                let data = ip.data.lock();
                if data.removed {
                    self.release_tree(&data.din);
                    self.fmap.release(ip.sector, 1);
                }
            }
            for ent in tab.iter_mut() {
                if ent.as_ref().map_or(false, |other| Arc::ptr_eq(other, &ip)) {
                    ent.take();
                }
            }
        }
    }

    // Release every sector the index tree references: data sectors,
    // then each index block's host. The budget recomputed from the
    // length mirrors exactly what create and grow built.
    fn release_tree(&self, din: &DiskInode) {
        let budget = match Budget::for_bytes(u64::from(din.length)) {
            Ok(b) => b,
            Err(_) => return,
        };
        for &s in &din.direct[..budget.direct] {
            self.fmap.release(s, 1);
        }
        if budget.indirect > 0 {
            match self.read_indirect(din.indirect) {
                Ok(ind) => {
                    for &s in &ind.blocks[..budget.indirect] {
                        self.fmap.release(s, 1);
                    }
                }
                Err(_) => log::warn!(
                    "itable: indirect block {} unreadable, leaking its data sectors",
                    din.indirect
                ),
            }
            self.fmap.release(din.indirect, 1);
        }
        if budget.children() > 0 {
            match self.read_dbl(din.dbl_indirect) {
                Ok(dbl) => {
                    for k in 0..budget.children() {
                        let host = dbl.indirect[k];
                        match self.read_indirect(host) {
                            Ok(ind) => {
                                for &s in &ind.blocks[..budget.child_used(k)] {
                                    self.fmap.release(s, 1);
                                }
                            }
                            Err(_) => log::warn!(
                                "itable: indirect block {} unreadable, leaking its data sectors",
                                host
                            ),
                        }
                        self.fmap.release(host, 1);
                    }
                }
                Err(_) => log::warn!(
                    "itable: double-indirect block {} unreadable, leaking its subtree",
                    din.dbl_indirect
                ),
            }
            self.fmap.release(din.dbl_indirect, 1);
        }
    }

    fn read_indirect(&self, sector: u32) -> Result<IndirectBlock> {
        let mut buf = [0u8; SECTOR_SIZE];
        self.cache.read(sector, &mut buf)?;
        Ok(IndirectBlock::read_from(&buf[..]).unwrap())
    }

    fn read_dbl(&self, sector: u32) -> Result<DblIndirectBlock> {
        let mut buf = [0u8; SECTOR_SIZE];
        self.cache.read(sector, &mut buf)?;
        Ok(DblIndirectBlock::read_from(&buf[..]).unwrap())
    }

    // Map a file block index to the data sector backing it.
    fn locate(&self, din: &DiskInode, blk: u64) -> Result<u32> {
        let nd = NDIRECT as u64;
        let ni = NINDIRECT as u64;
        if blk < nd {
            return Ok(din.direct[blk as usize]);
        }
        let blk = blk - nd;
        if blk < ni {
            let ind = self.read_indirect(din.indirect)?;
            return Ok(ind.blocks[blk as usize]);
        }
        let k = blk - ni;
        if k < NDBL as u64 * ni {
            let dbl = self.read_dbl(din.dbl_indirect)?;
            let ind = self.read_indirect(dbl.indirect[(k / ni) as usize])?;
            return Ok(ind.blocks[(k % ni) as usize]);
        }
        Err(Error::NotFound)
    }

    // Extend the tree so the file covers `new_len` bytes. New data
    // sectors are zeroed through the cache; index blocks are stitched
    // in as the budget crosses each level. A failed growth releases
    // the sectors it reserved and restores the cached inode.
    fn grow(&self, din: &mut DiskInode, new_len: u64) -> Result<()> {
        let old = Budget::for_bytes(u64::from(din.length))?;
        let new = Budget::for_bytes(new_len)?;
        let saved = *din;
        let mut reserved = Vec::new();
        if let Err(e) = self.grow_tree(din, old, new, &mut reserved) {
            for &s in &reserved {
                self.fmap.release(s, 1);
            }
            *din = saved;
            return Err(e);
        }
        din.length = new_len as u32;
        Ok(())
    }

    fn grow_tree(
        &self,
        din: &mut DiskInode,
        old: Budget,
        new: Budget,
        reserved: &mut Vec<u32>,
    ) -> Result<()> {
        // Growth begins at the first unallocated index of each level.
        self.alloc_data_range(&mut din.direct[old.direct..new.direct], reserved)?;

        if new.indirect > old.indirect {
            let mut ind = if old.indirect == 0 {
                let host = self.alloc_sector(reserved)?;
                din.indirect = host;
                let mut ind = IndirectBlock::new_zeroed();
                ind.this = host;
                ind.parent = din.this;
                ind
            } else {
                self.read_indirect(din.indirect)?
            };
            self.alloc_indirect_range(&mut ind, new.indirect, reserved)?;
            self.cache.write(din.indirect, ind.as_bytes())?;
            din.indirect_used = new.indirect as u32;
        }

        if (new.full, new.partial) != (old.full, old.partial) {
            let mut dbl = if old.children() == 0 {
                let host = self.alloc_sector(reserved)?;
                din.dbl_indirect = host;
                let mut dbl = DblIndirectBlock::new_zeroed();
                dbl.this = host;
                dbl.parent = din.this;
                dbl
            } else {
                self.read_dbl(din.dbl_indirect)?
            };
            // Top up the trailing partial child from the previous size.
            if old.partial > 0 {
                let k = old.children() - 1;
                let host = dbl.indirect[k];
                let mut ind = self.read_indirect(host)?;
                self.alloc_indirect_range(&mut ind, new.child_used(k), reserved)?;
                self.cache.write(host, ind.as_bytes())?;
            }
            self.alloc_dbl_children(&mut dbl, old.children(), new, reserved)?;
            self.cache.write(din.dbl_indirect, dbl.as_bytes())?;
            din.dbl_used = new.children() as u32;
        }
        Ok(())
    }

    // Copy a modified in-memory inode through the cache.
    fn update(&self, sector: u32, din: &DiskInode) -> Result<()> {
        self.cache.write(sector, din.as_bytes())
    }
}

impl Inode {
    fn ip(&self) -> &Arc<MInode> {
        self.ip.as_ref().unwrap()
    }

    // Increment the open count; both handles observe the same record.
    pub fn dup(&self) -> Inode {
        Inode {
            table: Arc::clone(&self.table),
            ip: self.ip.clone(),
        }
    }

    pub fn sector(&self) -> u32 {
        self.ip().sector
    }

    // File length in bytes.
    pub fn len(&self) -> u64 {
        u64::from(self.ip().data.lock().din.length)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Mark for deletion. The sectors go back to the free map at the
    // final close, not before.
    pub fn remove(&self) {
        self.ip().data.lock().removed = true;
    }

    pub fn deny_write(&self) {
        let ip = self.ip();
        let mut data = ip.data.lock();
        data.deny_writes += 1;
        assert!(
            data.deny_writes as usize <= Arc::strong_count(ip) - 1,
            "deny_write without opener"
        );
    }

    pub fn allow_write(&self) {
        let mut data = self.ip().data.lock();
        assert!(data.deny_writes > 0, "allow_write without deny_write");
        data.deny_writes -= 1;
    }

    // Read up to dst.len() bytes starting at `offset`. Returns the
    // byte count actually read, short at end of file. Never extends.
    pub fn read_at(&self, dst: &mut [u8], offset: u64) -> Result<usize> {
        let ip = self.ip();
        let data = ip.data.lock();
        let length = u64::from(data.din.length);
        if offset >= length {
            return Ok(0);
        }
        let n = dst.len().min((length - offset) as usize);
        let mut tot = 0;
        let mut off = offset;
        while tot < n {
            let sector = match self.table.locate(&data.din, off / SECTOR_SIZE as u64) {
                Ok(s) => s,
                Err(e) => return if tot > 0 { Ok(tot) } else { Err(e) },
            };
            let start = (off % SECTOR_SIZE as u64) as usize;
            let m = (n - tot).min(SECTOR_SIZE - start);
            let r = if start == 0 && m == SECTOR_SIZE {
                self.table.cache.read(sector, &mut dst[tot..tot + m])
            } else {
                self.table.cache.read_partial(sector, &mut dst[tot..tot + m], start)
            };
            if let Err(e) = r {
                return if tot > 0 { Ok(tot) } else { Err(e) };
            }
            tot += m;
            off += m as u64;
        }
        Ok(tot)
    }

    // Write src at `offset`, growing the file first when the range
    // runs past the current length. Returns the byte count written;
    // 0 while writes are denied.
    pub fn write_at(&self, src: &[u8], offset: u64) -> Result<usize> {
        let ip = self.ip();
        let mut data = ip.data.lock();
        if data.deny_writes > 0 {
            return Ok(0);
        }
        if src.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(src.len() as u64)
            .ok_or(Error::TooLarge)?;
        if end > MAXFILE as u64 {
            return Err(Error::TooLarge);
        }
        if end > u64::from(data.din.length) {
            self.table.grow(&mut data.din, end)?;
            self.table.update(ip.sector, &data.din)?;
        }
        let mut tot = 0;
        let mut off = offset;
        while tot < src.len() {
            let sector = match self.table.locate(&data.din, off / SECTOR_SIZE as u64) {
                Ok(s) => s,
                Err(e) => return if tot > 0 { Ok(tot) } else { Err(e) },
            };
            let start = (off % SECTOR_SIZE as u64) as usize;
            let m = (src.len() - tot).min(SECTOR_SIZE - start);
            let r = if start == 0 && m == SECTOR_SIZE {
                self.table.cache.write(sector, &src[tot..tot + m])
            } else {
                self.table.cache.write_partial(sector, &src[tot..tot + m], start)
            };
            if let Err(e) = r {
                return if tot > 0 { Ok(tot) } else { Err(e) };
            }
            tot += m;
            off += m as u64;
        }
        Ok(tot)
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        if let Some(ip) = self.ip.take() {
            self.table.put(ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::testing::{BitmapFreeMap, MemDisk};
    use crate::param::NBUF;
    use alloc::vec;

    const DISK_SECTORS: usize = 20_000;

    struct Fixture {
        disk: Arc<MemDisk>,
        fmap: Arc<BitmapFreeMap>,
        itable: Arc<Itable>,
    }

    fn setup() -> Fixture {
        setup_sized(DISK_SECTORS, NBUF)
    }

    fn setup_sized(sectors: usize, capacity: usize) -> Fixture {
        let disk = Arc::new(MemDisk::new(sectors));
        let fmap = Arc::new(BitmapFreeMap::new(sectors));
        let cache = Arc::new(Bcache::new(disk.clone(), capacity));
        let itable = Itable::new(cache, fmap.clone());
        Fixture { disk, fmap, itable }
    }

    impl Fixture {
        fn new_file(&self, length: u64) -> u32 {
            let sector = self.fmap.allocate(1).unwrap();
            self.itable.create(sector, length).unwrap();
            sector
        }
    }

    #[test]
    fn small_file_round_trip() {
        let fx = setup();
        let s0 = fx.new_file(100);
        let ino = Itable::open(&fx.itable, s0).unwrap();
        assert_eq!(ino.write_at(b"hello", 0).unwrap(), 5);
        let mut buf = [0u8; 5];
        assert_eq!(ino.read_at(&mut buf, 0).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(ino.len(), 100);
    }

    #[test]
    fn read_past_eof_returns_zero() {
        let fx = setup();
        let s0 = fx.new_file(10);
        let ino = Itable::open(&fx.itable, s0).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(ino.read_at(&mut buf, 10).unwrap(), 0);
        assert_eq!(ino.read_at(&mut buf, 1000).unwrap(), 0);
        // Short read across the end.
        assert_eq!(ino.read_at(&mut buf, 8).unwrap(), 2);
    }

    #[test]
    fn open_of_unformatted_sector_fails() {
        let fx = setup();
        let s = fx.fmap.allocate(1).unwrap();
        assert_eq!(Itable::open(&fx.itable, s).err(), Some(Error::NotFound));
    }

    #[test]
    fn direct_to_indirect_crossover() {
        let fx = setup();
        let s0 = fx.new_file(0);
        let ino = Itable::open(&fx.itable, s0).unwrap();
        let mut offsets = Vec::new();
        for blk in 0..=12u64 {
            let off = blk * SECTOR_SIZE as u64;
            let byte = [blk as u8 + 1];
            assert_eq!(ino.write_at(&byte, off).unwrap(), 1);
            offsets.push((off, byte[0]));
        }
        for &(off, expect) in &offsets {
            let mut b = [0u8; 1];
            assert_eq!(ino.read_at(&mut b, off).unwrap(), 1);
            assert_eq!(b[0], expect);
        }
        assert_eq!(ino.len(), 12 * SECTOR_SIZE as u64 + 1);
    }

    #[test]
    fn indirect_to_double_indirect_crossover() {
        let fx = setup();
        let s0 = fx.new_file(0);
        let ino = Itable::open(&fx.itable, s0).unwrap();
        let off = (NDIRECT + NINDIRECT) as u64 * SECTOR_SIZE as u64;
        assert_eq!(ino.write_at(&[0x99], off).unwrap(), 1);
        let mut b = [0u8; 1];
        assert_eq!(ino.read_at(&mut b, off).unwrap(), 1);
        assert_eq!(b[0], 0x99);
        // Everything below the written byte reads as zeros.
        let mut body = vec![0xffu8; off as usize];
        assert_eq!(ino.read_at(&mut body, 0).unwrap(), off as usize);
        assert!(body.iter().all(|&b| b == 0));
        assert_eq!(ino.len(), off + 1);
    }

    #[test]
    fn max_size_create() {
        let fx = setup();
        let s0 = fx.fmap.allocate(1).unwrap();
        fx.itable.create(s0, MAXFILE as u64).unwrap();
        let ino = Itable::open(&fx.itable, s0).unwrap();
        assert_eq!(ino.len(), MAXFILE as u64);
        // The last byte is addressable.
        assert_eq!(ino.write_at(&[0xaa], MAXFILE as u64 - 1).unwrap(), 1);
        let mut b = [0u8; 1];
        assert_eq!(ino.read_at(&mut b, MAXFILE as u64 - 1).unwrap(), 1);
        assert_eq!(b[0], 0xaa);
        // One byte more is not.
        assert_eq!(ino.write_at(&[0xbb], MAXFILE as u64), Err(Error::TooLarge));
        let s1 = fx.fmap.allocate(1).unwrap();
        assert_eq!(
            fx.itable.create(s1, MAXFILE as u64 + 1),
            Err(Error::TooLarge)
        );
    }

    #[test]
    fn sparse_growth_reads_zero() {
        let fx = setup();
        let s0 = fx.new_file(0);
        let ino = Itable::open(&fx.itable, s0).unwrap();
        assert_eq!(ino.write_at(&[0x7f], 5000).unwrap(), 1);
        assert_eq!(ino.len(), 5001);
        let mut body = vec![0xffu8; 5000];
        assert_eq!(ino.read_at(&mut body, 0).unwrap(), 5000);
        assert!(body.iter().all(|&b| b == 0));
    }

    #[test]
    fn length_is_monotone() {
        let fx = setup();
        let s0 = fx.new_file(0);
        let ino = Itable::open(&fx.itable, s0).unwrap();
        ino.write_at(&[1u8; 3000], 0).unwrap();
        assert_eq!(ino.len(), 3000);
        ino.write_at(&[2u8; 10], 0).unwrap();
        assert_eq!(ino.len(), 3000);
        ino.write_at(&[3u8; 10], 2995).unwrap();
        assert_eq!(ino.len(), 3005);
    }

    #[test]
    fn unaligned_write_spanning_sectors() {
        let fx = setup();
        let s0 = fx.new_file(0);
        let ino = Itable::open(&fx.itable, s0).unwrap();
        let src: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
        assert_eq!(ino.write_at(&src, 300).unwrap(), 2000);
        let mut out = vec![0u8; 2000];
        assert_eq!(ino.read_at(&mut out, 300).unwrap(), 2000);
        assert_eq!(out, src);
        // Bytes ahead of the write are still zero.
        let mut head = [0u8; 300];
        assert_eq!(ino.read_at(&mut head, 0).unwrap(), 300);
        assert!(head.iter().all(|&b| b == 0));
    }

    #[test]
    fn data_survives_flush() {
        let fx = setup();
        let s0 = fx.new_file(0);
        let ino = Itable::open(&fx.itable, s0).unwrap();
        ino.write_at(b"persistent", 600).unwrap();
        fx.itable.cache.flush().unwrap();
        let mut out = [0u8; 10];
        assert_eq!(ino.read_at(&mut out, 600).unwrap(), 10);
        assert_eq!(&out, b"persistent");
        // After the flush the bytes are on the device itself. Offset
        // 600 lands in file block 1.
        let sector = {
            let data = ino.ip().data.lock();
            fx.itable.locate(&data.din, 1).unwrap()
        };
        let raw = fx.disk.raw(sector);
        assert_eq!(&raw[600 - SECTOR_SIZE..610 - SECTOR_SIZE], b"persistent");
    }

    #[test]
    fn deny_write_blocks_all_handles() {
        let fx = setup();
        let s0 = fx.new_file(100);
        let h1 = Itable::open(&fx.itable, s0).unwrap();
        let h2 = Itable::open(&fx.itable, s0).unwrap();
        h1.deny_write();
        assert_eq!(h2.write_at(b"xxxx", 0).unwrap(), 0);
        let mut b = [0u8; 4];
        h2.read_at(&mut b, 0).unwrap();
        assert_eq!(b, [0u8; 4]);
        h1.allow_write();
        assert_eq!(h2.write_at(b"xxxx", 0).unwrap(), 4);
        h2.read_at(&mut b, 0).unwrap();
        assert_eq!(&b, b"xxxx");
    }

    #[test]
    fn remove_frees_whole_tree_at_final_close() {
        let fx = setup();
        let before = fx.fmap.free_count();
        // 12 sectors of data: 10 direct + 2 through the indirect block.
        let s0 = fx.new_file(12 * SECTOR_SIZE as u64);
        assert_eq!(fx.fmap.free_count(), before - 14); // host + 12 data + indirect
        let h1 = Itable::open(&fx.itable, s0).unwrap();
        let h2 = h1.dup();
        h1.remove();
        drop(h1);
        // Still open through h2: nothing released yet.
        assert_eq!(fx.fmap.free_count(), before - 14);
        drop(h2);
        assert_eq!(fx.fmap.free_count(), before);
    }

    #[test]
    fn remove_frees_double_indirect_tree() {
        let fx = setup();
        let before = fx.fmap.free_count();
        // Two sectors into the double-indirect region.
        let n = (NDIRECT + NINDIRECT + 2) as u64;
        let s0 = fx.new_file(n * SECTOR_SIZE as u64);
        // host + data + indirect + double-indirect + one child
        assert_eq!(fx.fmap.free_count(), before - (n as usize + 4));
        let ino = Itable::open(&fx.itable, s0).unwrap();
        ino.remove();
        drop(ino);
        assert_eq!(fx.fmap.free_count(), before);
    }

    #[test]
    fn create_rolls_back_when_out_of_space() {
        let fx = setup_sized(64, 8);
        let s0 = fx.fmap.allocate(1).unwrap();
        let before = fx.fmap.free_count();
        // Needs 20 data sectors plus an indirect host; only 63 exist but
        // the map is sized to run dry first.
        for _ in 0..50 {
            fx.fmap.allocate(1).unwrap();
        }
        assert_eq!(
            fx.itable.create(s0, 20 * SECTOR_SIZE as u64),
            Err(Error::OutOfSpace)
        );
        assert_eq!(fx.fmap.free_count(), before - 50);
    }

    #[test]
    fn failed_growth_releases_and_keeps_length() {
        let fx = setup_sized(64, 8);
        let s0 = fx.new_file(SECTOR_SIZE as u64);
        let ino = Itable::open(&fx.itable, s0).unwrap();
        // Exhaust the map.
        while fx.fmap.allocate(1).is_some() {}
        let free = fx.fmap.free_count();
        assert_eq!(
            ino.write_at(&[1u8; 64], 4 * SECTOR_SIZE as u64),
            Err(Error::OutOfSpace)
        );
        assert_eq!(ino.len(), SECTOR_SIZE as u64);
        assert_eq!(fx.fmap.free_count(), free);
        // Writes inside the existing sector still work.
        assert_eq!(ino.write_at(b"ok", 0).unwrap(), 2);
    }

    #[test]
    fn open_table_is_bounded() {
        let fx = setup();
        let mut handles = Vec::new();
        let mut sectors = Vec::new();
        for _ in 0..NINODE {
            sectors.push(fx.new_file(0));
        }
        for &s in &sectors {
            handles.push(Itable::open(&fx.itable, s).unwrap());
        }
        let extra = fx.new_file(0);
        assert_eq!(
            Itable::open(&fx.itable, extra).err(),
            Some(Error::OutOfMemory)
        );
        // Duplicate opens share the record instead of a fresh slot.
        let shared = Itable::open(&fx.itable, sectors[0]).unwrap();
        assert_eq!(shared.sector(), sectors[0]);
        drop(handles);
        Itable::open(&fx.itable, extra).unwrap();
    }

    #[test]
    fn close_recycles_table_entry() {
        let fx = setup();
        let s0 = fx.new_file(100);
        let h1 = Itable::open(&fx.itable, s0).unwrap();
        h1.deny_write();
        let h2 = Itable::open(&fx.itable, s0).unwrap();
        assert_eq!(h2.write_at(b"a", 0).unwrap(), 0);
        drop(h1);
        // The record survives while h2 is open, deny count included.
        assert_eq!(h2.write_at(b"a", 0).unwrap(), 0);
        h2.allow_write();
        assert_eq!(h2.write_at(b"a", 0).unwrap(), 1);
        drop(h2);
        // A fresh open starts from a clean record.
        let h3 = Itable::open(&fx.itable, s0).unwrap();
        assert_eq!(h3.write_at(b"b", 0).unwrap(), 1);
    }

    #[test]
    fn budget_peeling() {
        assert_eq!(
            Budget::for_sectors(0).unwrap(),
            Budget { direct: 0, indirect: 0, full: 0, partial: 0 }
        );
        assert_eq!(
            Budget::for_sectors(7).unwrap(),
            Budget { direct: 7, indirect: 0, full: 0, partial: 0 }
        );
        assert_eq!(
            Budget::for_sectors(NDIRECT + 3).unwrap(),
            Budget { direct: NDIRECT, indirect: 3, full: 0, partial: 0 }
        );
        assert_eq!(
            Budget::for_sectors(NDIRECT + NINDIRECT + 2 * NINDIRECT + 5).unwrap(),
            Budget { direct: NDIRECT, indirect: NINDIRECT, full: 2, partial: 5 }
        );
        let max = NDIRECT + NINDIRECT + NDBL * NINDIRECT;
        assert_eq!(
            Budget::for_sectors(max).unwrap(),
            Budget { direct: NDIRECT, indirect: NINDIRECT, full: NDBL, partial: 0 }
        );
        assert!(Budget::for_sectors(max + 1).is_err());
    }
}
