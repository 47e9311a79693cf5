// SPDX-License-Identifier: MIT

//! UART driver core: register access seam, status bits, and the polling
//! driver itself.

pub use uart::*;

mod uart;

use std::marker::PhantomData;
use std::ops;

use bitflags::bitflags;
use thiserror::Error;

use crate::mapper::{MapError, MapInitError, MappedRegion};

pub mod interface {
    use super::Status;

    /// Access to the four UART Lite registers.
    ///
    /// The hardware implementation performs volatile MMIO word accesses; a
    /// simulated backend can stand in for it in tests. Every access is a
    /// hardware side effect: one RX read consumes one FIFO entry, one TX
    /// write enqueues one.
    pub trait UartRegisters {
        /// Read the low 8 bits of the receive FIFO register, consuming one
        /// entry. Callers must check [`Status::DATA_VALID`] first.
        fn read_rx_fifo(&self) -> u8;

        /// Write the low 8 bits of the transmit FIFO register, enqueueing
        /// one entry. Callers must check [`Status::TX_FULL`] first.
        fn write_tx_fifo(&self, byte: u8);

        /// Read the status register.
        fn status(&self) -> Status;

        /// Write the control register with exactly these bits, all reserved
        /// bits zero.
        fn reset_control(&self, enable_intr: bool, reset_tx: bool, reset_rx: bool);
    }
}

bitflags! {
    /// Status register bits.
    ///
    /// The error bits (overrun, frame, parity) are observable but the
    /// polling loops never act on them; bytes are still consumed and
    /// produced while they are set.
    pub struct Status: u32 {
        const DATA_VALID   = 1 << 0;
        const RX_FULL      = 1 << 1;
        const TX_EMPTY     = 1 << 2;
        const TX_FULL      = 1 << 3;
        const INTR_ENABLED = 1 << 4;
        const OVERRUN_ERR  = 1 << 5;
        const FRAME_ERR    = 1 << 6;
        const PARITY_ERR   = 1 << 7;
    }
}

/// Errors that can abort driver construction. No partial driver is ever
/// returned; mapping must fully succeed before the loops may run.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Init(#[from] MapInitError),

    #[error(transparent)]
    Map(#[from] MapError),
}

/// Typed view over one MMIO register window.
///
/// Dereferences to a `tock-registers` register block, so every register
/// access is a volatile read or write of the underlying hardware word; no
/// caching, no reordering by the compiler.
pub struct MMIODerefWrapper<T> {
    start_addr: usize,
    phantom: PhantomData<fn() -> T>,
}

impl<T> MMIODerefWrapper<T> {
    /// Create a view over a mapped window.
    ///
    /// The window must be at least as large as the register block and stay
    /// mapped for as long as the view is used.
    pub fn new(region: &MappedRegion) -> Self {
        assert!(
            region.len() >= std::mem::size_of::<T>(),
            "window of {:#x} bytes is smaller than the register block",
            region.len(),
        );

        Self {
            start_addr: region.virtual_address() as usize,
            phantom: PhantomData,
        }
    }
}

impl<T> ops::Deref for MMIODerefWrapper<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*(self.start_addr as *const _) }
    }
}
