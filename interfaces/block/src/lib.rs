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

//! Block devices.
//!
//! This interface is served by the hard disk driver. Callers address a disk
//! or one of its partitions through a *minor number* (see
//! [`ffi::FIRST_LOGICAL_MINOR`] for the numbering scheme), open it, then
//! exchange sector-aligned reads and writes. The data always travels inside
//! the messages themselves; there is no shared memory involved.
//!
//! > **Note**: Positions are expressed in bytes but must fall on a sector
//! >           boundary. The sector size of the devices served by this
//! >           interface is always 512 bytes.
//!
//! The [`ffi::BlockDeviceMessage::Ioctl`] message gives access to
//! device-specific requests. The only one defined at the moment is
//! [`ffi::DIOCTL_GET_GEOMETRY`], which reports where a partition sits on its
//! drive.

pub mod ffi;

pub use self::ffi::PartitionGeometry;
