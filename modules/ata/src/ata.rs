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

//! ATA command protocol.
//!
//! A command is issued by programming the command block registers (features,
//! sector count, the three LBA bytes and the device register) and then
//! writing the command code, which starts execution. The controller raises
//! its interrupt line every time one sector worth of data is ready to cross
//! the data port, and expects the host to transfer exactly that much before
//! the next interrupt can happen.
//!
//! This module implements that state machine for the three commands the
//! driver uses: [`read_sectors`] (READ SECTORS), [`write_sectors`] (WRITE
//! SECTORS) and [`identify`] (IDENTIFY DEVICE). The status-register polls
//! that the protocol requires are bounded by [`HD_TIMEOUT_MS`] against the
//! monotonic clock, so that a dead drive turns into an [`Error`] rather than
//! a hang.

use crate::{HwAccessRef, SECTOR_SIZE};

/// I/O ports of the command block of the primary ATA channel.
pub const REG_DATA: u32 = 0x1f0;
pub const REG_FEATURES: u32 = 0x1f1;
pub const REG_NSECTOR: u32 = 0x1f2;
pub const REG_LBA_LOW: u32 = 0x1f3;
pub const REG_LBA_MID: u32 = 0x1f4;
pub const REG_LBA_HIGH: u32 = 0x1f5;
pub const REG_DEVICE: u32 = 0x1f6;
pub const REG_STATUS: u32 = 0x1f7;
/// Same port as [`REG_STATUS`]; writing to it selects the command to run.
pub const REG_CMD: u32 = 0x1f7;
/// Device control register, in the control block.
pub const REG_DEV_CTRL: u32 = 0x3f6;

/// Controller is busy. No other status bit is valid while this one is set.
pub const STATUS_BSY: u8 = 0x80;
/// Drive is ready to accept a command.
pub const STATUS_DRDY: u8 = 0x40;
/// Drive is ready to exchange a sector on the data port.
pub const STATUS_DRQ: u8 = 0x08;

pub const ATA_IDENTIFY: u8 = 0xec;
pub const ATA_READ: u8 = 0x20;
pub const ATA_WRITE: u8 = 0x30;

/// Deadline applied to the bounded status-register waits.
pub const HD_TIMEOUT_MS: u64 = 10_000;

/// Register image of a command, written to the command block just before the
/// command code itself.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Command {
    pub features: u8,
    pub count: u8,
    pub lba_low: u8,
    pub lba_mid: u8,
    pub lba_high: u8,
    pub device: u8,
    pub command: u8,
}

impl Command {
    /// Builds a READ SECTORS command for `count` sectors starting at `lba`.
    ///
    /// `lba` must fit in 28 bits, and `count` must be between 1 and 256.
    pub fn read(drive: u8, lba: u32, count: u32) -> Command {
        Command::transfer(drive, lba, count, ATA_READ)
    }

    /// Builds a WRITE SECTORS command for `count` sectors starting at `lba`.
    ///
    /// Same restrictions as [`Command::read`].
    pub fn write(drive: u8, lba: u32, count: u32) -> Command {
        Command::transfer(drive, lba, count, ATA_WRITE)
    }

    /// Builds an IDENTIFY DEVICE command.
    pub fn identify(drive: u8) -> Command {
        Command {
            features: 0,
            count: 0,
            lba_low: 0,
            lba_mid: 0,
            lba_high: 0,
            device: device_register(false, drive, 0),
            command: ATA_IDENTIFY,
        }
    }

    fn transfer(drive: u8, lba: u32, count: u32, command: u8) -> Command {
        debug_assert!(lba < 1 << 28);
        debug_assert!(count >= 1 && count <= 256);
        Command {
            features: 0,
            // The sector count register encodes 256 as 0.
            count: count as u8,
            lba_low: lba as u8,
            lba_mid: (lba >> 8) as u8,
            lba_high: (lba >> 16) as u8,
            device: device_register(true, drive, (lba >> 24) as u8),
            command,
        }
    }
}

/// Builds the value of the device register. Bit 6 selects LBA addressing,
/// bit 4 selects the drive, and the low nibble carries bits 24..28 of the
/// sector number.
fn device_register(lba: bool, drive: u8, lba_top: u8) -> u8 {
    0xa0 | (u8::from(lba) << 6) | ((drive & 1) << 4) | (lba_top & 0xf)
}

/// Error while driving the controller.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum Error {
    /// The controller kept its busy flag raised past the deadline.
    #[display(fmt = "timeout waiting for the busy flag to clear")]
    BusyTimeout,
    /// The drive never signalled readiness to transfer data words.
    #[display(fmt = "timeout waiting for the data request flag")]
    DataRequestTimeout,
}

/// Reads `dest.len() / 512` sectors starting at `lba` into `dest`.
///
/// `dest.len()` must be a whole number of sectors, between 1 and 256 of
/// them, and `lba` must fit in 28 bits.
pub async fn read_sectors<TAcc>(
    access: &TAcc,
    drive: u8,
    lba: u32,
    dest: &mut [u8],
) -> Result<(), Error>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    debug_assert!(!dest.is_empty());
    debug_assert_eq!(dest.len() % SECTOR_SIZE, 0);

    let count = (dest.len() / SECTOR_SIZE) as u32;

    // Listen before the command starts. The first sector's interrupt can
    // fire as soon as the command code is written.
    let mut interrupt = access.next_interrupt();
    command_out(access, &Command::read(drive, lba, count)).await?;

    for chunk in dest.chunks_mut(SECTOR_SIZE) {
        interrupt.await;
        // Reading the status register de-asserts the interrupt line.
        let _ = unsafe { access.read_port_u8(REG_STATUS) }.await;
        // Listen for the next sector before draining this one, for the same
        // reason as above.
        interrupt = access.next_interrupt();
        unsafe { access.read_port_u16s(REG_DATA, chunk) }.await;
    }

    Ok(())
}

/// Writes `data` starting at sector `lba`.
///
/// Same restrictions on the length of `data` and on `lba` as for
/// [`read_sectors`].
pub async fn write_sectors<TAcc>(
    access: &TAcc,
    drive: u8,
    lba: u32,
    data: &[u8],
) -> Result<(), Error>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    debug_assert!(!data.is_empty());
    debug_assert_eq!(data.len() % SECTOR_SIZE, 0);

    let count = (data.len() / SECTOR_SIZE) as u32;
    command_out(access, &Command::write(drive, lba, count)).await?;

    for chunk in data.chunks(SECTOR_SIZE) {
        // The drive raises DRQ when it is ready to accept the words of this
        // sector. No interrupt announces that edge.
        if !wait_for_status(access, STATUS_DRQ, STATUS_DRQ).await {
            return Err(Error::DataRequestTimeout);
        }
        let interrupt = access.next_interrupt();
        unsafe { access.write_port_u16s(REG_DATA, chunk) }.await;
        interrupt.await;
        let _ = unsafe { access.read_port_u8(REG_STATUS) }.await;
    }

    Ok(())
}

/// Information reported by the drive in answer to IDENTIFY DEVICE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyInfo {
    /// Serial number (words 10..20 of the payload), space padding removed.
    pub serial: String,
    /// Model name (words 27..47 of the payload), space padding removed.
    pub model: String,
    /// The drive understands LBA addressing (word 49, bit 9).
    pub lba_supported: bool,
    /// The drive understands 48-bit LBA addressing (word 83, bit 10).
    pub lba48_supported: bool,
    /// Total number of user-addressable sectors (words 60 and 61).
    pub num_sectors: u32,
}

/// Issues IDENTIFY DEVICE and parses the drive's answer.
pub async fn identify<TAcc>(access: &TAcc, drive: u8) -> Result<IdentifyInfo, Error>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    let mut payload = [0; SECTOR_SIZE];

    let interrupt = access.next_interrupt();
    command_out(access, &Command::identify(drive)).await?;
    interrupt.await;
    let _ = unsafe { access.read_port_u8(REG_STATUS) }.await;
    unsafe { access.read_port_u16s(REG_DATA, &mut payload) }.await;

    Ok(parse_identify(&payload))
}

/// Programs the command block registers and starts `cmd`.
async fn command_out<TAcc>(access: &TAcc, cmd: &Command) -> Result<(), Error>
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    // The command block registers must not be touched while the controller
    // has its busy flag raised.
    if !wait_for_status(access, STATUS_BSY, 0).await {
        return Err(Error::BusyTimeout);
    }

    // Writing 0 keeps the interrupt line enabled.
    unsafe { access.write_port_u8(REG_DEV_CTRL, 0) }.await;
    unsafe { access.write_port_u8(REG_FEATURES, cmd.features) }.await;
    unsafe { access.write_port_u8(REG_NSECTOR, cmd.count) }.await;
    unsafe { access.write_port_u8(REG_LBA_LOW, cmd.lba_low) }.await;
    unsafe { access.write_port_u8(REG_LBA_MID, cmd.lba_mid) }.await;
    unsafe { access.write_port_u8(REG_LBA_HIGH, cmd.lba_high) }.await;
    unsafe { access.write_port_u8(REG_DEVICE, cmd.device) }.await;
    // Writing the command code starts execution.
    unsafe { access.write_port_u8(REG_CMD, cmd.command) }.await;

    Ok(())
}

/// Polls the status register until `status & mask == value`, or until
/// [`HD_TIMEOUT_MS`] milliseconds of the monotonic clock have elapsed.
/// Returns whether the condition was reached.
async fn wait_for_status<TAcc>(access: &TAcc, mask: u8, value: u8) -> bool
where
    for<'r> &'r TAcc: HwAccessRef<'r>,
{
    let deadline = access.monotonic_clock() + u128::from(HD_TIMEOUT_MS) * 1_000_000;
    while access.monotonic_clock() < deadline {
        let status = unsafe { access.read_port_u8(REG_STATUS) }.await;
        if status & mask == value {
            return true;
        }
    }
    false
}

/// The ASCII fields of the identify payload store two characters per 16-bit
/// word, high byte first.
fn ascii_field(payload: &[u8], first_word: usize, num_words: usize) -> String {
    let mut bytes = Vec::with_capacity(num_words * 2);
    for word in payload[first_word * 2..(first_word + num_words) * 2].chunks(2) {
        bytes.push(word[1]);
        bytes.push(word[0]);
    }
    String::from_utf8_lossy(&bytes).trim().to_owned()
}

fn word(payload: &[u8], index: usize) -> u16 {
    u16::from_le_bytes([payload[index * 2], payload[index * 2 + 1]])
}

fn parse_identify(payload: &[u8; SECTOR_SIZE]) -> IdentifyInfo {
    IdentifyInfo {
        serial: ascii_field(payload, 10, 10),
        model: ascii_field(payload, 27, 20),
        lba_supported: word(payload, 49) & 0x0200 != 0,
        lba48_supported: word(payload, 83) & 0x0400 != 0,
        num_sectors: u32::from(word(payload, 60)) | (u32::from(word(payload, 61)) << 16),
    }
}
