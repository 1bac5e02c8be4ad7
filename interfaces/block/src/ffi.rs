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

use parity_scale_codec::{Decode, Encode};

// TODO: this has been randomly generated; instead should be a hash or something
pub const INTERFACE: [u8; 32] = [
    0x3d, 0xd1, 0x5b, 0x0a, 0xe4, 0x92, 0x3f, 0x6c, 0x21, 0x8a, 0xcd, 0x57, 0x01, 0xbe, 0x74, 0xf0,
    0x4a, 0x9d, 0x63, 0x88, 0x2b, 0xc5, 0x1e, 0x72, 0xd9, 0x40, 0xab, 0x16, 0xe8, 0x35, 0x9f, 0x07,
];

/// Ioctl request code asking for the geometry of a device.
///
/// Must be answered with a [`BlockDeviceResponse::Geometry`].
pub const DIOCTL_GET_GEOMETRY: u32 = 1;

/// First minor number designating a logical (extended) partition.
///
/// Minors below this value refer to a whole disk or one of its four primary
/// partitions: minor `drive * 5` is the whole disk, minors `drive * 5 + 1`
/// to `drive * 5 + 4` are the primaries. Starting at this value, each drive
/// owns 64 consecutive minors, one per logical partition slot.
pub const FIRST_LOGICAL_MINOR: u32 = 0x10;

/// Message that can be sent to the block device driver.
#[derive(Debug, Encode, Decode)]
pub enum BlockDeviceMessage {
    /// Take a reference on a device. The first opening of a drive triggers
    /// partition discovery.
    ///
    /// Must be answered with a [`BlockDeviceResponse::Open`].
    Open {
        /// Minor number of the device to open.
        device: u32,
    },

    /// Release a reference previously acquired with [`BlockDeviceMessage::Open`].
    ///
    /// Must be answered with a [`BlockDeviceResponse::Close`].
    Close {
        /// Minor number of the device to close.
        device: u32,
    },

    /// Read `length` bytes from the device.
    ///
    /// Must be answered with a [`BlockDeviceResponse::Read`] containing
    /// exactly `length` bytes.
    Read {
        /// Minor number of the device to read from.
        device: u32,
        /// Offset in bytes within the device. Must be a multiple of the
        /// sector size (512).
        position: u64,
        /// Number of bytes to read.
        length: u32,
    },

    /// Write `data` to the device.
    ///
    /// Must be answered with a [`BlockDeviceResponse::Write`].
    Write {
        /// Minor number of the device to write to.
        device: u32,
        /// Offset in bytes within the device. Must be a multiple of the
        /// sector size (512).
        position: u64,
        /// Data to write. The length must be a multiple of the sector
        /// size (512).
        data: Vec<u8>,
    },

    /// Device-specific control request.
    ///
    /// The only supported request code is [`DIOCTL_GET_GEOMETRY`], answered
    /// with a [`BlockDeviceResponse::Geometry`].
    Ioctl {
        /// Minor number of the device the request applies to.
        device: u32,
        /// Request code.
        request: u32,
    },
}

/// Answer to a [`BlockDeviceMessage`].
#[derive(Debug, Encode, Decode)]
pub enum BlockDeviceResponse {
    /// The device has been opened.
    Open,
    /// The device has been closed.
    Close,
    /// Data read from the device.
    Read(Vec<u8>),
    /// The write has reached the device.
    Write,
    /// Location of the device on its drive.
    Geometry(PartitionGeometry),
}

/// Location of a partition on a drive, in sectors.
#[derive(Debug, Encode, Decode, Copy, Clone, PartialEq, Eq)]
pub struct PartitionGeometry {
    /// Absolute number of the first sector.
    pub base: u32,
    /// Number of sectors.
    pub size: u32,
}
