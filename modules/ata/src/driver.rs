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

//! Request dispatch.
//!
//! [`run`] is the driver task: a loop that owns the drive state and the
//! sector cache, pulls one encoded request at a time out of a channel, and
//! answers it before looking at the next one. Requests are therefore
//! serialized in arrival order, and the hardware never sees two commands in
//! flight at once.
//!
//! Positions and lengths are translated into absolute sector numbers using
//! the partition that the minor number designates, then handed to the
//! [`ata`](crate::ata) module. Malformed requests don't produce error
//! responses; they are protocol violations that halt the task. See
//! [`FatalError`].

use crate::cache::SectorCache;
use crate::partitions::{
    self, DiscoverError, PartitionMap, PartitionSlot, LOGICAL_PER_DRIVE, PRIMARY_PER_DRIVE,
};
use crate::{ata, HwAccessRef, SECTOR_SIZE, SECTOR_SIZE_SHIFT};
use futures::channel::{mpsc, oneshot};
use futures::prelude::*;
use opal_block_interface::ffi::{self, BlockDeviceMessage, BlockDeviceResponse, PartitionGeometry};
use parity_scale_codec::{DecodeAll, Encode};

/// Number of sector payloads the driver task keeps in its cache.
pub const SECTOR_CACHE_CAPACITY: usize = 8;

/// Number of drives an ATA channel pair can expose. Only drive 0 is
/// actually served; minor numbers that resolve to any other drive are
/// rejected.
const MAX_DRIVES: u32 = 2;

/// Highest minor number designating a whole drive or a primary partition.
const MAX_PRIMARY_MINOR: u32 = MAX_DRIVES * PRIMARY_PER_DRIVE as u32 - 1;

/// One request for the driver task.
pub struct Request {
    /// SCALE-encoded [`BlockDeviceMessage`](ffi::BlockDeviceMessage).
    pub message: Vec<u8>,
    /// Where the SCALE-encoded
    /// [`BlockDeviceResponse`](ffi::BlockDeviceResponse) must be sent.
    /// Dropped without an answer if the driver halts.
    pub response: oneshot::Sender<Vec<u8>>,
}

/// State of the drive, owned exclusively by the driver task.
#[derive(Debug, Default)]
struct DriveInfo {
    /// Partition layout. Slot 0 and the tables are populated on the first
    /// open.
    partitions: PartitionMap,
    /// Number of times the drive is currently open.
    open_count: u32,
}

impl DriveInfo {
    fn slot(&self, index: SlotIndex) -> PartitionSlot {
        match index {
            SlotIndex::Primary(n) => self.partitions.primary[n],
            SlotIndex::Logical(n) => self.partitions.logical[n],
        }
    }
}

/// Partition slot addressed by a minor number.
#[derive(Debug, Copy, Clone)]
enum SlotIndex {
    Primary(usize),
    Logical(usize),
}

/// Condition that halts the driver task.
///
/// None of these is recoverable. The driver answers well-formed requests
/// addressed to the drive it owns; anything else means the caller or the
/// hardware broke the protocol, and the task stops rather than guess.
#[derive(Debug, derive_more::Display)]
pub enum FatalError {
    /// A request designated a drive other than drive 0.
    #[display(fmt = "device {} belongs to an unsupported drive", device)]
    UnsupportedDrive { device: u32 },
    /// A transfer position was not on a sector boundary.
    #[display(fmt = "position {:#x} is not sector-aligned", position)]
    UnalignedPosition { position: u64 },
    /// A write carried a payload that is not a whole number of sectors.
    #[display(fmt = "write length {} is not a whole number of sectors", length)]
    UnalignedLength { length: u32 },
    /// A transfer would touch sectors beyond what 28-bit LBA addressing can
    /// reach.
    #[display(fmt = "sector {} is outside the 28-bit address space", sector)]
    SectorOutOfRange { sector: u64 },
    /// A transfer was longer than the sector count register can express.
    #[display(fmt = "transfer of {} sectors exceeds what one command can carry", count)]
    TransferTooLong { count: u32 },
    /// A request message failed to decode.
    #[display(fmt = "unknown request message")]
    UnknownOperation,
    /// An ioctl used a request code the driver does not implement.
    #[display(fmt = "unsupported ioctl request code {}", code)]
    UnsupportedIoctl { code: u32 },
    /// The hardware misbehaved.
    #[display(fmt = "{}", _0)]
    Ata(ata::Error),
    /// The drive has no usable partition table.
    #[display(fmt = "{}", _0)]
    Discovery(DiscoverError),
}

impl From<ata::Error> for FatalError {
    fn from(err: ata::Error) -> FatalError {
        FatalError::Ata(err)
    }
}

impl From<DiscoverError> for FatalError {
    fn from(err: DiscoverError) -> FatalError {
        FatalError::Discovery(err)
    }
}

/// Runs the driver task.
///
/// Returns `Ok` once `requests` closes, and `Err` if a request or the
/// hardware violates the protocol; in the latter case the offending
/// request, and any request still queued, is dropped without an answer.
pub async fn run<TAcc>(
    access: &TAcc,
    mut requests: mpsc::Receiver<Request>,
) -> Result<(), FatalError>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    let mut drive = DriveInfo::default();
    let mut sector_cache = SectorCache::new(SECTOR_CACHE_CAPACITY);

    while let Some(request) = requests.next().await {
        let outcome = match BlockDeviceMessage::decode_all(&request.message) {
            Ok(BlockDeviceMessage::Open { device }) => {
                handle_open(access, &mut drive, device).await
            }
            Ok(BlockDeviceMessage::Close { device }) => handle_close(&mut drive, device),
            Ok(BlockDeviceMessage::Read {
                device,
                position,
                length,
            }) => handle_read(access, &drive, &mut sector_cache, device, position, length).await,
            Ok(BlockDeviceMessage::Write {
                device,
                position,
                data,
            }) => handle_write(access, &drive, &mut sector_cache, device, position, &data).await,
            Ok(BlockDeviceMessage::Ioctl { device, request }) => {
                handle_ioctl(&drive, device, request)
            }
            Err(_) => Err(FatalError::UnknownOperation),
        };

        match outcome {
            Ok(response) => {
                // The requester may have lost interest in the meantime;
                // that is not our problem.
                let _ = request.response.send(response.encode());
            }
            Err(err) => {
                log::error!("fatal error: {}; halting", err);
                return Err(err);
            }
        }
    }

    Ok(())
}

async fn handle_open<TAcc>(
    access: &TAcc,
    drive: &mut DriveInfo,
    device: u32,
) -> Result<BlockDeviceResponse, FatalError>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    let (drive_index, _) = resolve_device(device)?;

    // The drive is identified on every open, and its tables are read on
    // the first one.
    let info = ata::identify(access, drive_index as u8).await?;
    log::info!("serial number: {}", info.serial);
    log::info!("model: {}", info.model);
    log::info!(
        "LBA supported: {}, LBA48 supported: {}",
        info.lba_supported,
        info.lba48_supported
    );
    log::info!(
        "size: {} MB ({} sectors)",
        u64::from(info.num_sectors) * SECTOR_SIZE as u64 / 1_000_000,
        info.num_sectors
    );
    drive.partitions.primary[0] = PartitionSlot {
        base: 0,
        size: info.num_sectors,
    };

    if drive.open_count == 0 {
        partitions::discover(access, drive_index as u8, &mut drive.partitions).await?;
        partitions::log_partitions(&drive.partitions);
    }
    drive.open_count += 1;

    Ok(BlockDeviceResponse::Open)
}

fn handle_close(drive: &mut DriveInfo, device: u32) -> Result<BlockDeviceResponse, FatalError> {
    let _ = resolve_device(device)?;
    drive.open_count = drive.open_count.saturating_sub(1);
    Ok(BlockDeviceResponse::Close)
}

async fn handle_read<TAcc>(
    access: &TAcc,
    drive: &DriveInfo,
    sector_cache: &mut SectorCache,
    device: u32,
    position: u64,
    length: u32,
) -> Result<BlockDeviceResponse, FatalError>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    if length == 0 {
        return Ok(BlockDeviceResponse::Read(Vec::new()));
    }

    let (drive_index, first_sector, num_sectors) =
        resolve_transfer(drive, device, position, length)?;

    // Requests no longer than one sector can be answered from the cache.
    if length as usize <= SECTOR_SIZE {
        if let Some(payload) = sector_cache.lookup(first_sector) {
            return Ok(BlockDeviceResponse::Read(payload[..length as usize].to_vec()));
        }
    }

    let mut buffer = vec![0; num_sectors as usize * SECTOR_SIZE];
    ata::read_sectors(access, drive_index as u8, first_sector, &mut buffer).await?;

    // Every sector that crossed the data port becomes the newest cache
    // entry.
    for (n, chunk) in buffer.chunks_exact(SECTOR_SIZE).enumerate() {
        let mut payload = [0; SECTOR_SIZE];
        payload.copy_from_slice(chunk);
        sector_cache.insert(first_sector + n as u32, &payload);
    }

    buffer.truncate(length as usize);
    Ok(BlockDeviceResponse::Read(buffer))
}

async fn handle_write<TAcc>(
    access: &TAcc,
    drive: &DriveInfo,
    sector_cache: &mut SectorCache,
    device: u32,
    position: u64,
    data: &[u8],
) -> Result<BlockDeviceResponse, FatalError>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    if data.is_empty() {
        return Ok(BlockDeviceResponse::Write);
    }
    if data.len() % SECTOR_SIZE != 0 {
        return Err(FatalError::UnalignedLength {
            length: data.len() as u32,
        });
    }

    let (drive_index, first_sector, num_sectors) =
        resolve_transfer(drive, device, position, data.len() as u32)?;

    // Cached copies of the touched range must be gone before the hardware
    // starts writing.
    sector_cache.invalidate_range(first_sector, first_sector + num_sectors);

    ata::write_sectors(access, drive_index as u8, first_sector, data).await?;

    for (n, chunk) in data.chunks_exact(SECTOR_SIZE).enumerate() {
        let mut payload = [0; SECTOR_SIZE];
        payload.copy_from_slice(chunk);
        sector_cache.insert(first_sector + n as u32, &payload);
    }

    Ok(BlockDeviceResponse::Write)
}

fn handle_ioctl(
    drive: &DriveInfo,
    device: u32,
    request: u32,
) -> Result<BlockDeviceResponse, FatalError> {
    let (_, slot) = resolve_device(device)?;
    if request != ffi::DIOCTL_GET_GEOMETRY {
        return Err(FatalError::UnsupportedIoctl { code: request });
    }

    let slot = drive.slot(slot);
    Ok(BlockDeviceResponse::Geometry(PartitionGeometry {
        base: slot.base,
        size: slot.size,
    }))
}

/// Splits a minor number into its drive and partition-slot components.
///
/// Minor numbers up to [`MAX_PRIMARY_MINOR`] address the whole-drive and
/// primary slots, five per drive. Minor numbers starting at
/// [`ffi::FIRST_LOGICAL_MINOR`] address the logical slots, sixty-four per
/// drive. Anything in between, or resolving to a drive other than 0, is
/// rejected.
fn resolve_device(device: u32) -> Result<(u32, SlotIndex), FatalError> {
    let (drive, slot) = if device <= MAX_PRIMARY_MINOR {
        let drive = device / PRIMARY_PER_DRIVE as u32;
        let slot = SlotIndex::Primary((device % PRIMARY_PER_DRIVE as u32) as usize);
        (drive, slot)
    } else {
        let index = match device.checked_sub(ffi::FIRST_LOGICAL_MINOR) {
            Some(index) => index,
            None => return Err(FatalError::UnsupportedDrive { device }),
        };
        let drive = index / LOGICAL_PER_DRIVE as u32;
        let slot = SlotIndex::Logical((index % LOGICAL_PER_DRIVE as u32) as usize);
        (drive, slot)
    };

    if drive != 0 {
        return Err(FatalError::UnsupportedDrive { device });
    }
    Ok((drive, slot))
}

/// Validates a transfer request and translates its position into an
/// absolute starting sector and a sector count.
fn resolve_transfer(
    drive: &DriveInfo,
    device: u32,
    position: u64,
    length: u32,
) -> Result<(u32, u32, u32), FatalError> {
    let (drive_index, slot) = resolve_device(device)?;

    if position & (SECTOR_SIZE as u64 - 1) != 0 {
        return Err(FatalError::UnalignedPosition { position });
    }

    let base = drive.slot(slot).base;
    let first_sector = u64::from(base) + (position >> SECTOR_SIZE_SHIFT);
    let num_sectors = (u64::from(length) + SECTOR_SIZE as u64 - 1) >> SECTOR_SIZE_SHIFT;

    // The device register only carries bits 24..28 of the sector number;
    // reject what the addressing mode cannot express.
    if first_sector + num_sectors > 1 << 28 {
        return Err(FatalError::SectorOutOfRange {
            sector: first_sector,
        });
    }
    if num_sectors > 256 {
        return Err(FatalError::TransferTooLong {
            count: num_sectors as u32,
        });
    }

    Ok((drive_index, first_sector as u32, num_sectors as u32))
}
