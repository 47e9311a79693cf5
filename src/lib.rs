// SPDX-License-Identifier: MIT

//! User-space driver for a memory-mapped AXI UART Lite.
//!
//! The peripheral sits in a physical-memory aperture reached through
//! `/dev/mem`. [`mapper::RegionMapper`] owns the device handle and the mmap
//! lifecycle, [`driver::UartLite`] is the typed register view over one mapped
//! window, and [`driver::UartDriver`] runs the two polling loops that move
//! bytes between the hardware FIFOs and a pair of shared [`queue::ByteQueue`]s.
//!
//! The design is polling-only: no interrupts, no flow control, no baud or
//! parity configuration. Hardware error flags (overrun, frame, parity) are
//! observable through [`driver::Status`] but never acted upon by the loops.

pub mod driver;
pub mod mapper;
pub mod queue;

pub use driver::{DriverError, Status, UartDriver, UartLite};
pub use mapper::{MapError, MapInitError, MappedRegion, RegionMapper};
pub use queue::ByteQueue;
