// Copyright (C) 2019-2021  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Cache of recently-transferred sectors.
//!
//! The driver keeps the payload of the last few sectors that crossed the
//! data port, so that repeated single-sector reads of hot sectors can be
//! answered without issuing a command.
//!
//! Entries live in an arena of slots allocated up front and are threaded
//! onto a doubly-linked list ordered from oldest to newest transfer. A
//! successful lookup moves the entry to the newest end of the list, and
//! admitting a sector while the arena is full evicts the entry at the
//! oldest end. All links are slot indices rather than pointers; slots not
//! currently holding an entry are kept on a free list.

use crate::SECTOR_SIZE;

struct Slot {
    sector: u32,
    payload: [u8; SECTOR_SIZE],
    prev: Option<usize>,
    next: Option<usize>,
}

pub struct SectorCache {
    slots: Box<[Slot]>,
    /// Oldest entry, the next eviction candidate.
    oldest: Option<usize>,
    /// Newest entry.
    newest: Option<usize>,
    /// Slots not currently holding an entry.
    free: Vec<usize>,
}

impl SectorCache {
    /// Initializes a cache able to hold `capacity` sectors.
    pub fn new(capacity: usize) -> SectorCache {
        assert!(capacity >= 1);
        let slots = (0..capacity)
            .map(|_| Slot {
                sector: 0,
                payload: [0; SECTOR_SIZE],
                prev: None,
                next: None,
            })
            .collect();
        SectorCache {
            slots,
            oldest: None,
            newest: None,
            free: (0..capacity).collect(),
        }
    }

    /// Number of sectors currently held.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of sectors the cache can hold.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the cached payload of `sector`, if any, and marks the entry
    /// as the most recent one.
    pub fn lookup(&mut self, sector: u32) -> Option<&[u8; SECTOR_SIZE]> {
        let index = self.find(sector)?;
        self.unlink(index);
        self.link_newest(index);
        Some(&self.slots[index].payload)
    }

    /// Admits `sector` as the newest entry.
    ///
    /// If the sector is already present, its payload is overwritten and the
    /// entry moves to the newest end; no duplicate is ever created. If the
    /// arena is full, the oldest entry is evicted first.
    pub fn insert(&mut self, sector: u32, payload: &[u8; SECTOR_SIZE]) {
        let index = if let Some(index) = self.find(sector) {
            self.unlink(index);
            index
        } else if let Some(index) = self.free.pop() {
            index
        } else {
            // Arena full. The oldest entry gives up its slot.
            let index = self.oldest.unwrap();
            self.unlink(index);
            index
        };

        let slot = &mut self.slots[index];
        slot.sector = sector;
        slot.payload = *payload;
        self.link_newest(index);
    }

    /// Drops every entry whose sector number falls within `start ..= end`.
    /// The relative age of the remaining entries is unchanged.
    pub fn invalidate_range(&mut self, start: u32, end: u32) {
        let mut cursor = self.oldest;
        while let Some(index) = cursor {
            cursor = self.slots[index].next;
            let sector = self.slots[index].sector;
            if sector >= start && sector <= end {
                self.unlink(index);
                self.free.push(index);
            }
        }
    }

    fn find(&self, sector: u32) -> Option<usize> {
        let mut cursor = self.oldest;
        while let Some(index) = cursor {
            if self.slots[index].sector == sector {
                return Some(index);
            }
            cursor = self.slots[index].next;
        }
        None
    }

    /// Detaches `index` from the recency list. `index` must be linked.
    fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let slot = &self.slots[index];
            (slot.prev, slot.next)
        };
        match prev {
            Some(prev) => self.slots[prev].next = next,
            None => self.oldest = next,
        }
        match next {
            Some(next) => self.slots[next].prev = prev,
            None => self.newest = prev,
        }
        self.slots[index].prev = None;
        self.slots[index].next = None;
    }

    /// Attaches `index` at the newest end of the recency list. `index` must
    /// not currently be linked.
    fn link_newest(&mut self, index: usize) {
        self.slots[index].prev = self.newest;
        self.slots[index].next = None;
        match self.newest {
            Some(newest) => self.slots[newest].next = Some(index),
            None => self.oldest = Some(index),
        }
        self.newest = Some(index);
    }
}
