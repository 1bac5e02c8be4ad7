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

//! Driver for ATA/IDE hard disks.
//!
//! This library contains the storage driver of the system. It owns the drive
//! attached to the primary ATA channel, discovers its MBR partition layout
//! when the drive is first opened, and serves the requests defined in the
//! `opal-block-interface` crate: opening and closing devices, reading and
//! writing ranges of bytes, and reporting partition geometry.
//!
//! The code of this library doesn't assume that it can directly perform port
//! I/O or receive interrupts. Instead, every access to the machine goes
//! through the [`HwAccessRef`] trait, implemented by the embedder. This also
//! makes it possible to exercise the driver against an emulated drive.
//!
//! The entry point is [`run`]: hand it a hardware handle and the receiving
//! side of a channel of [`Request`]s, and it serves requests one by one until
//! the channel closes or the hardware or a caller violates the protocol.
//!
//! > **Note**: All transfers happen in units of 512-byte sectors, using
//! >           28-bit LBA addressing. Recently-transferred sectors are kept
//! >           in a small cache so that repeated reads of hot sectors do not
//! >           touch the hardware.

use core::future::Future;

pub use self::driver::{run, FatalError, Request};

pub mod ata;
pub mod cache;
pub mod driver;
pub mod partitions;

#[cfg(test)]
mod emulated;

/// Size of a disk sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Base-2 logarithm of [`SECTOR_SIZE`], to convert between byte offsets and
/// sector numbers.
pub const SECTOR_SIZE_SHIFT: u32 = 9;

/// Abstraction over the I/O ports and the interrupt line of the disk
/// controller.
///
/// The driver never touches the hardware directly. Every port access and
/// every interrupt notification goes through an implementation of this
/// trait, which the embedder provides.
///
/// # Safety
///
/// Implementations must perform the accesses they describe, on the ports
/// they are given, without caching or reordering them. The driver issues
/// port writes that make the controller move data; an implementation that
/// lies about having performed them leads to undefined behaviour in the
/// code that relies on it.
pub unsafe trait HwAccessRef<'a>: Copy + Clone {
    type PortReadU8Future: Future<Output = u8> + 'a;
    type PortReadU16sFuture: Future<Output = ()> + 'a;
    type PortWriteU8Future: Future<Output = ()> + 'a;
    type PortWriteU16sFuture: Future<Output = ()> + 'a;
    type InterruptFuture: Future<Output = ()> + 'a;

    /// Reads a single byte from `port`.
    unsafe fn read_port_u8(self, port: u32) -> Self::PortReadU8Future;

    /// Reads `dest.len() / 2` consecutive 16-bit words from `port`, storing
    /// each word into `dest` in little-endian order.
    ///
    /// `dest.len()` must be even.
    unsafe fn read_port_u16s(self, port: u32, dest: &'a mut [u8]) -> Self::PortReadU16sFuture;

    /// Writes a single byte to `port`.
    unsafe fn write_port_u8(self, port: u32, data: u8) -> Self::PortWriteU8Future;

    /// Writes `data.len() / 2` consecutive 16-bit words to `port`, taking
    /// each word from `data` in little-endian order.
    ///
    /// `data.len()` must be even.
    unsafe fn write_port_u16s(self, port: u32, data: &'a [u8]) -> Self::PortWriteU16sFuture;

    /// Returns a future that resolves once the next interrupt of the disk
    /// controller has been delivered.
    ///
    /// The returned future starts listening as soon as it is created. Always
    /// obtain it *before* performing the operation whose completion it
    /// reports, then await it afterwards, otherwise an interrupt delivered
    /// in between would be missed. Interrupts delivered while no future is
    /// listening must be queued. Dropping the future before completion has
    /// no effect.
    fn next_interrupt(self) -> Self::InterruptFuture;

    /// Value of a monotonic clock, in nanoseconds. Used to put an upper
    /// bound on the busy-waits against the status register.
    fn monotonic_clock(self) -> u128;
}
