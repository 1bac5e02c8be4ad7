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

//! MBR partition tables.
//!
//! The first sector of a drive carries four 16-byte partition entries at
//! byte offset `0x1be`. At most one of them normally designates an
//! *extended* partition, whose first sector carries a table in the same
//! format: entry 0 describes a logical partition, relative to that sector,
//! and entry 1, unless unused, locates the next link of the chain, relative
//! to the start of the extended partition. [`discover`] walks these tables
//! and fills a [`PartitionMap`] with what it finds.
//!
//! > **Note**: Table sectors are read straight from the hardware but are
//! >           *not* inserted into the sector cache; the payloads the cache
//! >           holds all come from transfer requests.

use crate::{ata, HwAccessRef, SECTOR_SIZE};

/// Number of entries in one partition table.
pub const ENTRIES_PER_TABLE: usize = 4;
/// Byte offset of the partition table inside its sector.
pub const TABLE_OFFSET: usize = 0x1be;
/// Partition slots per drive reachable without logical partitions: the
/// whole drive plus the four primary entries.
pub const PRIMARY_PER_DRIVE: usize = 5;
/// Logical-partition slots reserved for each primary ordinal.
pub const LOGICAL_PER_EXTENDED: usize = 16;
/// Logical-partition slots per drive.
pub const LOGICAL_PER_DRIVE: usize = (PRIMARY_PER_DRIVE - 1) * LOGICAL_PER_EXTENDED;

/// System id of an unused table entry.
pub const NO_PART: u8 = 0x00;
/// System id designating an extended partition.
pub const EXT_PART: u8 = 0x05;

/// Location of a partition on its drive, in sectors.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PartitionSlot {
    /// Absolute sector number of the first sector.
    pub base: u32,
    /// Number of sectors.
    pub size: u32,
}

/// Every partition of one drive, indexed the way minor numbers are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMap {
    /// Slot 0 is the whole drive; slots 1..=4 mirror the four MBR entries.
    pub primary: [PartitionSlot; PRIMARY_PER_DRIVE],
    /// Sixteen slots per primary ordinal: ordinal `j` owns the slots
    /// `(j - 1) * 16 .. j * 16`.
    pub logical: [PartitionSlot; LOGICAL_PER_DRIVE],
}

impl Default for PartitionMap {
    fn default() -> PartitionMap {
        PartitionMap {
            primary: [PartitionSlot::default(); PRIMARY_PER_DRIVE],
            logical: [PartitionSlot::default(); LOGICAL_PER_DRIVE],
        }
    }
}

/// One decoded 16-byte partition table entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub boot_indicator: u8,
    pub system_id: u8,
    /// First sector, relative to whatever the entry is relative to.
    pub start: u32,
    /// Number of sectors.
    pub count: u32,
}

impl TableEntry {
    pub fn is_unused(&self) -> bool {
        self.system_id == NO_PART
    }

    pub fn is_extended(&self) -> bool {
        self.system_id == EXT_PART
    }
}

/// Decodes the four entries of the partition table contained in `sector`.
pub fn decode_table(sector: &[u8]) -> [TableEntry; ENTRIES_PER_TABLE] {
    debug_assert_eq!(sector.len(), SECTOR_SIZE);
    let mut entries = [TableEntry {
        boot_indicator: 0,
        system_id: NO_PART,
        start: 0,
        count: 0,
    }; ENTRIES_PER_TABLE];

    for (n, entry) in entries.iter_mut().enumerate() {
        let raw = &sector[TABLE_OFFSET + n * 16..TABLE_OFFSET + (n + 1) * 16];
        entry.boot_indicator = raw[0];
        // Bytes 1..4 and 5..8 hold the CHS coordinates, which LBA-era code
        // has no use for.
        entry.system_id = raw[4];
        entry.start = le_u32(&raw[8..12]);
        entry.count = le_u32(&raw[12..16]);
    }

    entries
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Reason why partition discovery failed.
#[derive(Debug, derive_more::Display)]
pub enum DiscoverError {
    /// The MBR does not contain a single usable partition entry.
    #[display(fmt = "no primary partition found on the drive")]
    NoPartitions,
    /// A table sector could not be read.
    #[display(fmt = "{}", _0)]
    Ata(ata::Error),
}

impl From<ata::Error> for DiscoverError {
    fn from(err: ata::Error) -> DiscoverError {
        DiscoverError::Ata(err)
    }
}

/// Walks the partition tables of `drive` and fills `map` accordingly.
///
/// The four MBR entries land in the primary slots 1..=4; the logical
/// partitions of each extended chain land in the logical slots of the
/// corresponding ordinal. `map.primary[0]`, the whole drive, is left
/// untouched.
pub async fn discover<TAcc>(
    access: &TAcc,
    drive: u8,
    map: &mut PartitionMap,
) -> Result<(), DiscoverError>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    let table = read_table(access, drive, 0).await?;

    let mut num_used = 0;
    for (n, entry) in table.iter().enumerate() {
        if entry.is_unused() {
            continue;
        }
        num_used += 1;

        let ordinal = n + 1;
        map.primary[ordinal] = PartitionSlot {
            base: entry.start,
            size: entry.count,
        };
        if entry.is_extended() {
            walk_extended(access, drive, ordinal, map).await?;
        }
    }

    if num_used == 0 {
        return Err(DiscoverError::NoPartitions);
    }
    Ok(())
}

/// Follows the chain of logical partitions inside the extended partition
/// recorded at primary slot `ordinal`.
///
/// Each link claims one logical slot, starting at `(ordinal - 1) * 16`. A
/// chain longer than [`LOGICAL_PER_EXTENDED`] links is silently truncated.
async fn walk_extended<TAcc>(
    access: &TAcc,
    drive: u8,
    ordinal: usize,
    map: &mut PartitionMap,
) -> Result<(), DiscoverError>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    let ext_start = map.primary[ordinal].base;
    let mut link = ext_start;
    let first_slot = (ordinal - 1) * LOGICAL_PER_EXTENDED;

    for slot in first_slot..first_slot + LOGICAL_PER_EXTENDED {
        let table = read_table(access, drive, link).await?;

        // Entry 0 is recorded before entry 1 is examined, so a chain whose
        // last link carries a partition is not cut short.
        map.logical[slot] = PartitionSlot {
            base: link + table[0].start,
            size: table[0].count,
        };

        if table[1].is_unused() {
            break;
        }
        link = ext_start + table[1].start;
    }

    Ok(())
}

/// Reads the partition table located in sector `table_sector` of `drive`.
async fn read_table<TAcc>(
    access: &TAcc,
    drive: u8,
    table_sector: u32,
) -> Result<[TableEntry; ENTRIES_PER_TABLE], ata::Error>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    let mut sector = [0; SECTOR_SIZE];
    ata::read_sectors(access, drive, table_sector, &mut sector).await?;
    Ok(decode_table(&sector))
}

/// Logs the discovered layout, one line per slot plus one line per
/// populated logical slot.
pub fn log_partitions(map: &PartitionMap) {
    for (n, slot) in map.primary.iter().enumerate() {
        log::info!(
            "part {}: base {} ({:#x}), size {} ({:#x}) sectors",
            n,
            slot.base,
            slot.base,
            slot.size,
            slot.size
        );
    }
    for (n, slot) in map.logical.iter().enumerate() {
        if slot.size == 0 {
            continue;
        }
        log::info!(
            "  sub {}: base {} ({:#x}), size {} ({:#x}) sectors",
            n,
            slot.base,
            slot.base,
            slot.size,
            slot.size
        );
    }
}
