// Buffer cache.
//
// A bounded set of sector-sized slots holding cached copies of disk
// sector contents, between the inode layer and the block device.
// Writes are deferred (write-back): a dirty slot reaches the device
// only when it is evicted or when the cache is flushed. Eviction picks
// the least recently used slot.
//
// Interface:
// * read/write move whole sectors through the cache.
// * read_partial/write_partial move a byte window within one sector,
//   staged through a bounce buffer so untouched bytes survive.
// * flush writes every dirty slot back and empties the cache.
// * clean_all writes dirty slots back but keeps them resident.
// * poll_flush runs flush once per FLUSH_INTERVAL of timer ticks.

use crate::{
    dev::{BlockDevice, TickSource},
    error::{Error, Result},
    param::{FLUSH_INTERVAL, SECTOR_SIZE},
};
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use bitflags::bitflags;
use spin::Mutex;

bitflags! {
    struct SlotFlags: u8 {
        const VALID = 1 << 0; // bytes mirror the sector's logical contents
        const DIRTY = 1 << 1; // bytes newer than the device copy
        const ACCESSED = 1 << 2; // touched since the slot was (re)filled
    }
}

const NIL: usize = usize::MAX;

// One resident sector. prev/next thread the recency list, MRU first.
struct Slot {
    sector: u32,
    flags: SlotFlags,
    data: Vec<u8>, // SECTOR_SIZE bytes while resident, empty once released
    prev: usize,
    next: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub hits: u64,
    pub misses: u64,
    pub device_reads: u64,
    pub device_writes: u64,
    pub evictions: u64,
}

struct Ctrl {
    cap: usize,
    slots: Vec<Slot>,
    free: Vec<usize>,
    map: BTreeMap<u32, usize>, // sector -> slot index
    head: usize,               // MRU
    tail: usize,               // LRU
    last_flush: u64,
    stats: Stats,
}

pub struct Bcache {
    dev: Arc<dyn BlockDevice>,
    ctrl: Mutex<Ctrl>,
}

impl Ctrl {
    fn detach(&mut self, i: usize) {
        let (p, n) = (self.slots[i].prev, self.slots[i].next);
        if p != NIL {
            self.slots[p].next = n;
        } else {
            self.head = n;
        }
        if n != NIL {
            self.slots[n].prev = p;
        } else {
            self.tail = p;
        }
        self.slots[i].prev = NIL;
        self.slots[i].next = NIL;
    }

    fn push_front(&mut self, i: usize) {
        self.slots[i].prev = NIL;
        self.slots[i].next = self.head;
        if self.head != NIL {
            self.slots[self.head].prev = i;
        } else {
            self.tail = i;
        }
        self.head = i;
    }

    fn touch(&mut self, i: usize) {
        self.detach(i);
        self.push_front(i);
    }

    // Write the LRU tail back if dirty, then drop it from the cache.
    // A failed write-back has nowhere to go; the slot is dropped anyway.
    fn evict_lru(&mut self, dev: &dyn BlockDevice) {
        let i = self.tail;
        assert!(i != NIL, "evict on empty cache");
        self.detach(i);
        let sector = self.slots[i].sector;
        self.map.remove(&sector);
        if self.slots[i].flags.contains(SlotFlags::DIRTY) {
            self.stats.device_writes += 1;
            if dev.write_sector(sector, &self.slots[i].data).is_err() {
                log::warn!("bcache: write-back of sector {} failed, dropping slot", sector);
            }
        }
        self.stats.evictions += 1;
        self.release_slot(i);
    }

    fn release_slot(&mut self, i: usize) {
        self.slots[i].flags = SlotFlags::empty();
        self.slots[i].data = Vec::new();
        self.free.push(i);
    }

    // Produce an unlinked slot with a fresh SECTOR_SIZE buffer, evicting
    // the LRU slot first when the cache is at capacity.
    fn take_slot(&mut self, dev: &dyn BlockDevice) -> Result<usize> {
        let mut data = Vec::new();
        data.try_reserve_exact(SECTOR_SIZE)
            .map_err(|_| Error::OutOfMemory)?;
        data.resize(SECTOR_SIZE, 0);
        if self.map.len() == self.cap {
            self.evict_lru(dev);
        }
        let i = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot {
                    sector: 0,
                    flags: SlotFlags::empty(),
                    data: Vec::new(),
                    prev: NIL,
                    next: NIL,
                });
                self.slots.len() - 1
            }
        };
        self.slots[i].data = data;
        Ok(i)
    }
}

impl Bcache {
    pub fn new(dev: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        assert!(capacity > 0, "bcache: zero capacity");
        Bcache {
            dev,
            ctrl: Mutex::new(Ctrl {
                cap: capacity,
                slots: Vec::new(),
                free: Vec::new(),
                map: BTreeMap::new(),
                head: NIL,
                tail: NIL,
                last_flush: 0,
                stats: Stats::default(),
            }),
        }
    }

    // Fill dst with the current logical contents of the sector.
    pub fn read(&self, sector: u32, dst: &mut [u8]) -> Result<()> {
        assert_eq!(dst.len(), SECTOR_SIZE);
        let mut ctrl = self.ctrl.lock();
        if let Some(&i) = ctrl.map.get(&sector) {
            ctrl.stats.hits += 1;
            ctrl.slots[i].flags.insert(SlotFlags::ACCESSED);
            ctrl.touch(i);
            dst.copy_from_slice(&ctrl.slots[i].data);
            return Ok(());
        }
        ctrl.stats.misses += 1;
        let i = ctrl.take_slot(&*self.dev)?;
        ctrl.stats.device_reads += 1;
        if let Err(e) = self.dev.read_sector(sector, &mut ctrl.slots[i].data) {
            // A failed load never becomes resident.
            ctrl.release_slot(i);
            return Err(e);
        }
        ctrl.slots[i].sector = sector;
        ctrl.slots[i].flags = SlotFlags::VALID | SlotFlags::ACCESSED;
        ctrl.map.insert(sector, i);
        ctrl.push_front(i);
        dst.copy_from_slice(&ctrl.slots[i].data);
        Ok(())
    }

    // Make future reads of the sector observe src. The device is not
    // touched until eviction or flush.
    pub fn write(&self, sector: u32, src: &[u8]) -> Result<()> {
        assert_eq!(src.len(), SECTOR_SIZE);
        let mut ctrl = self.ctrl.lock();
        if let Some(&i) = ctrl.map.get(&sector) {
            ctrl.stats.hits += 1;
            ctrl.slots[i].data.copy_from_slice(src);
            ctrl.slots[i].flags.insert(SlotFlags::DIRTY | SlotFlags::ACCESSED);
            ctrl.touch(i);
            return Ok(());
        }
        ctrl.stats.misses += 1;
        let i = ctrl.take_slot(&*self.dev)?;
        ctrl.slots[i].data.copy_from_slice(src);
        ctrl.slots[i].sector = sector;
        ctrl.slots[i].flags = SlotFlags::VALID | SlotFlags::DIRTY | SlotFlags::ACCESSED;
        ctrl.map.insert(sector, i);
        ctrl.push_front(i);
        Ok(())
    }

    // Copy dst.len() bytes out of the sector, starting at offset.
    pub fn read_partial(&self, sector: u32, dst: &mut [u8], offset: usize) -> Result<()> {
        assert!(offset + dst.len() <= SECTOR_SIZE);
        let mut bounce = [0u8; SECTOR_SIZE];
        self.read(sector, &mut bounce)?;
        dst.copy_from_slice(&bounce[offset..offset + dst.len()]);
        Ok(())
    }

    // Overlay src.len() bytes into the sector at offset. The sector is
    // first read into the bounce buffer unless src covers all of it.
    pub fn write_partial(&self, sector: u32, src: &[u8], offset: usize) -> Result<()> {
        assert!(offset + src.len() <= SECTOR_SIZE);
        let mut bounce = [0u8; SECTOR_SIZE];
        if !(offset == 0 && src.len() == SECTOR_SIZE) {
            self.read(sector, &mut bounce)?;
        }
        bounce[offset..offset + src.len()].copy_from_slice(src);
        self.write(sector, &bounce)
    }

    fn write_back(&self, ctrl: &mut Ctrl) -> Result<()> {
        let resident: Vec<usize> = ctrl.map.values().copied().collect();
        for i in resident {
            if ctrl.slots[i].flags.contains(SlotFlags::DIRTY) {
                ctrl.stats.device_writes += 1;
                self.dev
                    .write_sector(ctrl.slots[i].sector, &ctrl.slots[i].data)?;
                ctrl.slots[i].flags.remove(SlotFlags::DIRTY);
            }
        }
        Ok(())
    }

    // Write every dirty slot back, then drop all residency. Stops at
    // the first device error, leaving the remaining slots dirty.
    pub fn flush(&self) -> Result<()> {
        let mut ctrl = self.ctrl.lock();
        self.write_back(&mut ctrl)?;
        while ctrl.head != NIL {
            let i = ctrl.head;
            ctrl.detach(i);
            ctrl.release_slot(i);
        }
        ctrl.map.clear();
        log::debug!("bcache: flushed");
        Ok(())
    }

    // Write every dirty slot back but keep it resident.
    pub fn clean_all(&self) -> Result<()> {
        let mut ctrl = self.ctrl.lock();
        self.write_back(&mut ctrl)
    }

    // Flush once FLUSH_INTERVAL ticks have passed since the last
    // periodic flush. Meant to be driven from a timer tick.
    pub fn poll_flush(&self, timer: &dyn TickSource) -> Result<()> {
        {
            let ctrl = self.ctrl.lock();
            if timer.elapsed(ctrl.last_flush) < FLUSH_INTERVAL {
                return Ok(());
            }
        }
        let now = timer.ticks();
        let r = self.flush();
        self.ctrl.lock().last_flush = now;
        r
    }

    pub fn shutdown(&self) -> Result<()> {
        self.flush()
    }

    // Number of resident sectors.
    pub fn len(&self) -> usize {
        self.ctrl.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Stats {
        self.ctrl.lock().stats
    }
}

impl Drop for Bcache {
    fn drop(&mut self) {
        if self.flush().is_err() {
            log::warn!("bcache: final flush failed, dirty sectors lost");
        }
    }
}
