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

//! Register-level emulation of an IDE drive, for the tests.
//!
//! [`EmulatedDrive`] implements [`HwAccessRef`] for shared references to
//! itself. Commands written through the fake ports are executed against an
//! in-memory disk image, one interrupt per transferred sector, like the
//! real protocol. Only the command subset the driver issues is covered;
//! anything else panics, on the grounds that a test reaching it is broken.
//!
//! The emulated monotonic clock advances by one millisecond every time it
//! is read, so that the bounded status waits can expire without wall-clock
//! time being involved.

use crate::partitions::TABLE_OFFSET;
use crate::{ata, HwAccessRef, SECTOR_SIZE};

use core::future::Future;
use core::pin::Pin;
use futures::future::{self, Ready};
use futures::task::{AtomicWaker, Context, Poll};
use spinning_top::Spinlock;
use std::collections::VecDeque;

/// Serial number every emulated drive reports.
pub const SERIAL: &str = "EMU0001-042";
/// Model name every emulated drive reports.
pub const MODEL: &str = "OPAL EMULATED HARDDISK";

pub struct EmulatedDrive {
    state: Spinlock<State>,
    waker: AtomicWaker,
}

struct State {
    image: Vec<u8>,
    regs: Registers,
    phase: Phase,
    interrupts_pending: u32,
    commands_issued: u32,
    clock_ns: u64,
    stuck_busy: bool,
    stuck_drq: bool,
}

#[derive(Default)]
struct Registers {
    features: u8,
    count: u8,
    lba_low: u8,
    lba_mid: u8,
    lba_high: u8,
    device: u8,
    dev_ctrl: u8,
}

enum Phase {
    Idle,
    /// Sectors waiting to be drained through the data port.
    Read { queue: VecDeque<Vec<u8>> },
    /// Sectors the host still has to push through the data port.
    Write { next_lba: u32, remaining: u32 },
}

impl EmulatedDrive {
    /// Builds a drive backed by `image`, which must be a whole number of
    /// sectors.
    pub fn new(image: Vec<u8>) -> EmulatedDrive {
        assert_eq!(image.len() % SECTOR_SIZE, 0);
        EmulatedDrive {
            state: Spinlock::new(State {
                image,
                regs: Registers::default(),
                phase: Phase::Idle,
                interrupts_pending: 0,
                commands_issued: 0,
                clock_ns: 0,
                stuck_busy: false,
                stuck_drq: false,
            }),
            waker: AtomicWaker::new(),
        }
    }

    /// Builds a drive whose busy flag never clears.
    pub fn stuck_busy() -> EmulatedDrive {
        let drive = EmulatedDrive::new(blank_image(16));
        drive.state.lock().stuck_busy = true;
        drive
    }

    /// Builds a drive, backed by `image`, whose data request flag never
    /// rises. It accepts commands, and interrupt-paced transfers still
    /// complete, but a write transfer stalls before its first sector.
    pub fn stuck_drq(image: Vec<u8>) -> EmulatedDrive {
        let drive = EmulatedDrive::new(image);
        drive.state.lock().stuck_drq = true;
        drive
    }

    /// Number of commands written to the command register so far.
    pub fn commands_issued(&self) -> u32 {
        self.state.lock().commands_issued
    }

    /// Copy of the given sector of the image.
    pub fn sector(&self, lba: u32) -> Vec<u8> {
        let state = self.state.lock();
        let offset = lba as usize * SECTOR_SIZE;
        state.image[offset..offset + SECTOR_SIZE].to_vec()
    }

    fn port_read_u8(&self, port: u32) -> u8 {
        let state = self.state.lock();
        match port {
            ata::REG_STATUS => state.status(),
            _ => panic!("byte read from unexpected port {:#x}", port),
        }
    }

    fn port_write_u8(&self, port: u32, value: u8) {
        let mut wake = false;
        {
            let mut state = self.state.lock();
            match port {
                ata::REG_FEATURES => state.regs.features = value,
                ata::REG_NSECTOR => state.regs.count = value,
                ata::REG_LBA_LOW => state.regs.lba_low = value,
                ata::REG_LBA_MID => state.regs.lba_mid = value,
                ata::REG_LBA_HIGH => state.regs.lba_high = value,
                ata::REG_DEVICE => state.regs.device = value,
                ata::REG_DEV_CTRL => state.regs.dev_ctrl = value,
                ata::REG_CMD => {
                    state.execute(value);
                    wake = true;
                }
                _ => panic!("byte write to unexpected port {:#x}", port),
            }
        }
        if wake {
            self.waker.wake();
        }
    }

    fn port_read_u16s(&self, port: u32, dest: &mut [u8]) {
        assert_eq!(port, ata::REG_DATA);
        let mut wake = false;
        {
            let mut state = self.state.lock();
            let sector = match &mut state.phase {
                Phase::Read { queue } => {
                    queue.pop_front().expect("data port drained while empty")
                }
                _ => panic!("data port read outside of a read transfer"),
            };
            assert_eq!(dest.len(), sector.len());
            dest.copy_from_slice(&sector);

            let drained = matches!(&state.phase, Phase::Read { queue } if queue.is_empty());
            if drained {
                state.phase = Phase::Idle;
            } else {
                // Next sector ready.
                state.interrupts_pending += 1;
                wake = true;
            }
        }
        if wake {
            self.waker.wake();
        }
    }

    fn port_write_u16s(&self, port: u32, data: &[u8]) {
        assert_eq!(port, ata::REG_DATA);
        assert_eq!(data.len(), SECTOR_SIZE);
        {
            let mut state = self.state.lock();
            let (lba, remaining) = match &mut state.phase {
                Phase::Write {
                    next_lba,
                    remaining,
                } => {
                    let lba = *next_lba;
                    *next_lba += 1;
                    *remaining -= 1;
                    (lba, *remaining)
                }
                _ => panic!("data port written outside of a write transfer"),
            };
            let offset = lba as usize * SECTOR_SIZE;
            state.image[offset..offset + SECTOR_SIZE].copy_from_slice(data);
            state.interrupts_pending += 1;
            if remaining == 0 {
                state.phase = Phase::Idle;
            }
        }
        self.waker.wake();
    }

    fn try_consume_interrupt(&self) -> bool {
        let mut state = self.state.lock();
        if state.interrupts_pending > 0 {
            state.interrupts_pending -= 1;
            true
        } else {
            false
        }
    }

    fn clock(&self) -> u128 {
        let mut state = self.state.lock();
        state.clock_ns += 1_000_000;
        u128::from(state.clock_ns)
    }
}

impl State {
    fn status(&self) -> u8 {
        if self.stuck_busy {
            return ata::STATUS_BSY;
        }
        if self.stuck_drq {
            return ata::STATUS_DRDY;
        }
        match self.phase {
            Phase::Idle => ata::STATUS_DRDY,
            Phase::Read { .. } | Phase::Write { .. } => ata::STATUS_DRDY | ata::STATUS_DRQ,
        }
    }

    fn execute(&mut self, command: u8) {
        self.commands_issued += 1;
        assert_eq!((self.regs.device >> 4) & 1, 0, "only drive 0 is emulated");
        assert_eq!(self.regs.features, 0);
        // The driver must keep the interrupt line enabled.
        assert_eq!(self.regs.dev_ctrl, 0);

        let lba = u32::from(self.regs.lba_low)
            | u32::from(self.regs.lba_mid) << 8
            | u32::from(self.regs.lba_high) << 16
            | u32::from(self.regs.device & 0xf) << 24;
        let count = if self.regs.count == 0 {
            256
        } else {
            u32::from(self.regs.count)
        };

        match command {
            ata::ATA_IDENTIFY => {
                let payload = self.identify_payload();
                let mut queue = VecDeque::new();
                queue.push_back(payload);
                self.phase = Phase::Read { queue };
                self.interrupts_pending += 1;
            }
            ata::ATA_READ => {
                let mut queue = VecDeque::new();
                for n in 0..count {
                    let offset = (lba + n) as usize * SECTOR_SIZE;
                    queue.push_back(self.image[offset..offset + SECTOR_SIZE].to_vec());
                }
                self.phase = Phase::Read { queue };
                self.interrupts_pending += 1;
            }
            ata::ATA_WRITE => {
                self.phase = Phase::Write {
                    next_lba: lba,
                    remaining: count,
                };
            }
            _ => panic!("unsupported command {:#x}", command),
        }
    }

    fn identify_payload(&self) -> Vec<u8> {
        let mut payload = vec![0; SECTOR_SIZE];
        write_ascii_field(&mut payload, 10, 10, SERIAL);
        write_ascii_field(&mut payload, 27, 20, MODEL);
        // Word 49 bit 9: LBA supported. Word 83 is left zero, so the drive
        // reports no 48-bit addressing.
        payload[49 * 2 + 1] = 0x02;
        let sectors = (self.image.len() / SECTOR_SIZE) as u32;
        payload[60 * 2..60 * 2 + 2].copy_from_slice(&((sectors & 0xffff) as u16).to_le_bytes());
        payload[61 * 2..61 * 2 + 2].copy_from_slice(&((sectors >> 16) as u16).to_le_bytes());
        payload
    }
}

unsafe impl<'a> HwAccessRef<'a> for &'a EmulatedDrive {
    type PortReadU8Future = Ready<u8>;
    type PortReadU16sFuture = Ready<()>;
    type PortWriteU8Future = Ready<()>;
    type PortWriteU16sFuture = Ready<()>;
    type InterruptFuture = InterruptFuture<'a>;

    unsafe fn read_port_u8(self, port: u32) -> Self::PortReadU8Future {
        future::ready(self.port_read_u8(port))
    }

    unsafe fn read_port_u16s(self, port: u32, dest: &'a mut [u8]) -> Self::PortReadU16sFuture {
        self.port_read_u16s(port, dest);
        future::ready(())
    }

    unsafe fn write_port_u8(self, port: u32, data: u8) -> Self::PortWriteU8Future {
        self.port_write_u8(port, data);
        future::ready(())
    }

    unsafe fn write_port_u16s(self, port: u32, data: &'a [u8]) -> Self::PortWriteU16sFuture {
        self.port_write_u16s(port, data);
        future::ready(())
    }

    fn next_interrupt(self) -> Self::InterruptFuture {
        InterruptFuture { drive: self }
    }

    fn monotonic_clock(self) -> u128 {
        self.clock()
    }
}

pub struct InterruptFuture<'a> {
    drive: &'a EmulatedDrive,
}

impl<'a> Future for InterruptFuture<'a> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.drive.try_consume_interrupt() {
            return Poll::Ready(());
        }
        self.drive.waker.register(cx.waker());
        // A second check, in case an interrupt arrived between the first
        // one and the registration.
        if self.drive.try_consume_interrupt() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

/// A zeroed disk image of `num_sectors` sectors.
pub fn blank_image(num_sectors: u32) -> Vec<u8> {
    vec![0; num_sectors as usize * SECTOR_SIZE]
}

/// Writes entry `index` of the partition table located in sector
/// `table_sector` of `image`.
pub fn set_partition_entry(
    image: &mut [u8],
    table_sector: u32,
    index: usize,
    system_id: u8,
    start: u32,
    count: u32,
) {
    assert!(index < 4);
    let offset = table_sector as usize * SECTOR_SIZE + TABLE_OFFSET + index * 16;
    image[offset + 4] = system_id;
    image[offset + 8..offset + 12].copy_from_slice(&start.to_le_bytes());
    image[offset + 12..offset + 16].copy_from_slice(&count.to_le_bytes());
}

/// Fills one sector of `image` with `byte`.
pub fn fill_sector(image: &mut [u8], lba: u32, byte: u8) {
    let offset = lba as usize * SECTOR_SIZE;
    for b in image[offset..offset + SECTOR_SIZE].iter_mut() {
        *b = byte;
    }
}

/// Writes `text` into a byte-swapped ASCII field of an identify payload,
/// padding with spaces: two characters per word, high byte first.
fn write_ascii_field(payload: &mut [u8], first_word: usize, num_words: usize, text: &str) {
    let mut chars = text.bytes().chain(core::iter::repeat(b' '));
    for word in 0..num_words {
        let first = chars.next().unwrap();
        let second = chars.next().unwrap();
        payload[(first_word + word) * 2] = second;
        payload[(first_word + word) * 2 + 1] = first;
    }
}
