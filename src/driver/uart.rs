// SPDX-License-Identifier: MIT

//! AXI UART Lite: register block and polling driver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::debug;
use tock_registers::{
    interfaces::{Readable, Writeable},
    register_bitfields, register_structs,
    registers::{ReadOnly, WriteOnly},
};

use crate::driver::{interface::UartRegisters, DriverError, MMIODerefWrapper, Status};
use crate::mapper::RegionMapper;
use crate::queue::ByteQueue;

//--------------------------------------------------------------------------------------------------
// Private definitions
//--------------------------------------------------------------------------------------------------

register_bitfields! {
    u32,

    /// Receive FIFO. A read consumes one FIFO entry.
    RX_FIFO [
        DATA OFFSET(0) NUMBITS(8) []
    ],

    /// Transmit FIFO. A write enqueues one FIFO entry.
    TX_FIFO [
        DATA OFFSET(0) NUMBITS(8) []
    ],

    /// Status Register
    STAT [
        RX_FIFO_VALID_DATA OFFSET(0) NUMBITS(1) [],
        RX_FIFO_FULL OFFSET(1) NUMBITS(1) [],
        TX_FIFO_EMPTY OFFSET(2) NUMBITS(1) [],
        TX_FIFO_FULL OFFSET(3) NUMBITS(1) [],
        INTR_ENABLED OFFSET(4) NUMBITS(1) [],
        OVERRUN_ERROR OFFSET(5) NUMBITS(1) [],
        FRAME_ERROR OFFSET(6) NUMBITS(1) [],
        PARITY_ERROR OFFSET(7) NUMBITS(1) []
    ],

    /// Control Register
    CTRL [
        RST_TX_FIFO OFFSET(0) NUMBITS(1) [],
        RST_RX_FIFO OFFSET(1) NUMBITS(1) [],
        ENABLE_INTR OFFSET(4) NUMBITS(1) []
    ]
}

register_structs! {
    #[allow(non_snake_case)]
    pub RegisterBlock {
        (0x00 => RX_FIFO: ReadOnly<u32, RX_FIFO::Register>),
        (0x04 => TX_FIFO: WriteOnly<u32, TX_FIFO::Register>),
        (0x08 => STAT: ReadOnly<u32, STAT::Register>),
        (0x0C => CTRL: WriteOnly<u32, CTRL::Register>),
        (0x10 => @END),
    }
}

/// Abstraction for the associated MMIO registers.
type Registers = MMIODerefWrapper<RegisterBlock>;

//--------------------------------------------------------------------------------------------------
// Public definitions
//--------------------------------------------------------------------------------------------------

/// Poll interval of the two hardware-facing loops. Cancellation latency is
/// bounded by one interval per loop.
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// How long the driver's teardown waits after raising the stop flag, so that
/// both loops can observe it before the register window goes away.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(20);

/// The memory-mapped UART Lite peripheral.
///
/// Owns the mapped register window for its whole lifetime; the window is
/// unmapped when the peripheral is dropped.
pub struct UartLite {
    registers: Registers,
    // Keeps the register window alive. Dropped last, after the view above
    // can no longer be used.
    mapper: RegionMapper,
}

/// Polling driver for one [`UartLite`] (or a simulated register backend).
///
/// The receive loop moves bytes from the hardware RX FIFO into the receive
/// queue; the transmit loop moves bytes from the transmit queue into the
/// hardware TX FIFO. Both loops run until [`UartDriver::stop`] is called.
pub struct UartDriver<R> {
    registers: R,
    rx_queue: Arc<ByteQueue>,
    tx_queue: Arc<ByteQueue>,
    stop_flag: AtomicBool,
}

//--------------------------------------------------------------------------------------------------
// Public code
//--------------------------------------------------------------------------------------------------

impl UartLite {
    /// Map `[base_address, base_address + aperture_size)` through a freshly
    /// opened physical-memory handle.
    pub fn map(base_address: u64, aperture_size: usize) -> Result<Self, DriverError> {
        Self::map_with(RegionMapper::open()?, base_address, aperture_size)
    }

    /// Map the aperture through an already constructed mapper, e.g. one that
    /// adopted an externally supplied device handle.
    pub fn map_with(
        mut mapper: RegionMapper,
        base_address: u64,
        aperture_size: usize,
    ) -> Result<Self, DriverError> {
        let region = mapper.map(base_address, aperture_size)?;
        let registers = Registers::new(&region);

        Ok(Self { registers, mapper })
    }

    /// The physical-memory windows backing this peripheral.
    pub fn mapped_regions(&self) -> &[crate::mapper::MappedRegion] {
        self.mapper.regions()
    }
}

/// # Safety
///
/// The register words are hardware FIFOs and flags, not plain memory: every
/// access is a volatile side effect and the peripheral tolerates concurrent
/// access to distinct registers. The receive loop only touches RX_FIFO/STAT,
/// the transmit loop only TX_FIFO/STAT, so sharing `&UartLite` across the two
/// worker threads is sound.
unsafe impl Send for UartLite {}
unsafe impl Sync for UartLite {}

impl UartRegisters for UartLite {
    fn read_rx_fifo(&self) -> u8 {
        self.registers.RX_FIFO.read(RX_FIFO::DATA) as u8
    }

    fn write_tx_fifo(&self, byte: u8) {
        self.registers.TX_FIFO.write(TX_FIFO::DATA.val(u32::from(byte)));
    }

    fn status(&self) -> Status {
        Status::from_bits_truncate(self.registers.STAT.get())
    }

    fn reset_control(&self, enable_intr: bool, reset_tx: bool, reset_rx: bool) {
        self.registers.CTRL.write(
            CTRL::RST_TX_FIFO.val(u32::from(reset_tx))
                + CTRL::RST_RX_FIFO.val(u32::from(reset_rx))
                + CTRL::ENABLE_INTR.val(u32::from(enable_intr)),
        );
    }
}

impl UartDriver<UartLite> {
    /// Bring up the driver over the hardware: map the aperture, build the
    /// register view, and reset both FIFOs.
    ///
    /// A mapping failure aborts construction; no partial driver is returned
    /// and no loop may run.
    pub fn open(
        base_address: u64,
        aperture_size: usize,
        rx_queue: Arc<ByteQueue>,
        tx_queue: Arc<ByteQueue>,
    ) -> Result<Self, DriverError> {
        let uart = UartLite::map(base_address, aperture_size)?;
        Ok(Self::new(uart, rx_queue, tx_queue))
    }
}

impl<R> UartDriver<R>
where
    R: UartRegisters,
{
    /// Wrap an already accessible register backend.
    ///
    /// Resets both hardware FIFOs and leaves interrupts disabled; the design
    /// is polling-only.
    pub fn new(registers: R, rx_queue: Arc<ByteQueue>, tx_queue: Arc<ByteQueue>) -> Self {
        registers.reset_control(false, true, true);
        debug!("uart fifos reset; status = {:?}", registers.status());

        Self {
            registers,
            rx_queue,
            tx_queue,
            stop_flag: AtomicBool::new(false),
        }
    }

    /// Poll the RX FIFO until stopped, appending every received byte to the
    /// receive queue. Returns the number of bytes transferred.
    pub fn receive_loop(&self) -> usize {
        let mut read = 0;

        loop {
            if self.should_stop() {
                break;
            }

            if self.registers.status().contains(Status::DATA_VALID) {
                let byte = self.registers.read_rx_fifo();
                self.rx_queue.push(byte);
                read += 1;
            } else {
                thread::sleep(POLL_INTERVAL);
            }
        }

        debug!("receive loop stopped, {read} bytes read");
        read
    }

    /// Poll the transmit queue until stopped, writing every queued byte to
    /// the TX FIFO as soon as it has space. Returns the number of bytes
    /// transferred.
    pub fn transmit_loop(&self) -> usize {
        let mut written = 0;

        loop {
            if self.should_stop() {
                break;
            }

            if self.registers.status().contains(Status::TX_FULL) {
                thread::sleep(POLL_INTERVAL);
                continue;
            }

            match self.tx_queue.pop() {
                Some(byte) => {
                    self.registers.write_tx_fifo(byte);
                    written += 1;
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        }

        debug!("transmit loop stopped, {written} bytes written");
        written
    }

    /// Raise the stop flag. Does not block; each loop returns after at most
    /// one more poll interval.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
    }

    /// The register backend. Hardware error flags (overrun, frame, parity)
    /// stay observable here; the loops never act on them.
    pub fn registers(&self) -> &R {
        &self.registers
    }
}

impl<R> Drop for UartDriver<R> {
    fn drop(&mut self) {
        // Give running loops one last chance to observe the flag before the
        // register window is torn down.
        if !self.stop_flag.swap(true, Ordering::AcqRel) {
            thread::sleep(SHUTDOWN_GRACE);
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Private code
//--------------------------------------------------------------------------------------------------

impl<R> UartDriver<R> {
    fn should_stop(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Instant;

    struct MockState {
        rx: VecDeque<u8>,
        writes: Vec<u8>,
        tx_full: bool,
        error_flags: Status,
        control_writes: Vec<(bool, bool, bool)>,
    }

    /// Simulated register backend: DATA_VALID tracks the scripted RX bytes,
    /// TX writes are recorded in order.
    #[derive(Default)]
    struct MockRegisters {
        state: Mutex<MockState>,
    }

    impl MockRegisters {
        fn with_rx(bytes: &[u8]) -> Self {
            let mock = Self::default();
            mock.state.lock().unwrap().rx.extend(bytes);
            mock
        }

        fn set_tx_full(&self, full: bool) {
            self.state.lock().unwrap().tx_full = full;
        }

        fn set_error_flags(&self, flags: Status) {
            self.state.lock().unwrap().error_flags = flags;
        }

        fn writes(&self) -> Vec<u8> {
            self.state.lock().unwrap().writes.clone()
        }

        fn control_writes(&self) -> Vec<(bool, bool, bool)> {
            self.state.lock().unwrap().control_writes.clone()
        }
    }

    impl Default for MockState {
        fn default() -> Self {
            Self {
                rx: VecDeque::new(),
                writes: Vec::new(),
                tx_full: false,
                error_flags: Status::empty(),
                control_writes: Vec::new(),
            }
        }
    }

    impl UartRegisters for MockRegisters {
        fn read_rx_fifo(&self) -> u8 {
            self.state.lock().unwrap().rx.pop_front().unwrap_or(0)
        }

        fn write_tx_fifo(&self, byte: u8) {
            self.state.lock().unwrap().writes.push(byte);
        }

        fn status(&self) -> Status {
            let state = self.state.lock().unwrap();
            let mut status = state.error_flags;
            if !state.rx.is_empty() {
                status |= Status::DATA_VALID;
            }
            if state.tx_full {
                status |= Status::TX_FULL;
            }
            status
        }

        fn reset_control(&self, enable_intr: bool, reset_tx: bool, reset_rx: bool) {
            self.state
                .lock()
                .unwrap()
                .control_writes
                .push((enable_intr, reset_tx, reset_rx));
        }
    }

    fn driver_with(mock: MockRegisters) -> (Arc<UartDriver<MockRegisters>>, Arc<ByteQueue>, Arc<ByteQueue>) {
        let rx_queue = Arc::new(ByteQueue::new());
        let tx_queue = Arc::new(ByteQueue::new());
        let driver = Arc::new(UartDriver::new(
            mock,
            Arc::clone(&rx_queue),
            Arc::clone(&tx_queue),
        ));
        (driver, rx_queue, tx_queue)
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn construction_resets_fifos_and_disables_interrupts() {
        let (driver, _, _) = driver_with(MockRegisters::default());
        assert_eq!(driver.registers().control_writes(), vec![(false, true, true)]);
        driver.stop();
    }

    #[test]
    fn receive_loop_captures_one_byte() {
        let (driver, rx_queue, _) = driver_with(MockRegisters::with_rx(&[0x41]));

        let worker = thread::spawn({
            let driver = Arc::clone(&driver);
            move || driver.receive_loop()
        });

        assert!(wait_for(|| rx_queue.len() == 1));
        driver.stop();

        assert_eq!(worker.join().expect("receive worker panicked"), 1);
        assert_eq!(rx_queue.pop(), Some(0x41));
        assert_eq!(rx_queue.pop(), None);
    }

    #[test]
    fn receive_loop_preserves_arrival_order() {
        let bytes = *b"uartlite";
        let (driver, rx_queue, _) = driver_with(MockRegisters::with_rx(&bytes));

        let worker = thread::spawn({
            let driver = Arc::clone(&driver);
            move || driver.receive_loop()
        });

        assert!(wait_for(|| rx_queue.len() == bytes.len()));
        driver.stop();

        assert_eq!(worker.join().expect("receive worker panicked"), bytes.len());
        let received: Vec<u8> = std::iter::from_fn(|| rx_queue.pop()).collect();
        assert_eq!(received, bytes);
    }

    #[test]
    fn transmit_loop_drains_queue_in_order() {
        let (driver, _, tx_queue) = driver_with(MockRegisters::default());
        for byte in [0x10, 0x20, 0x30] {
            tx_queue.push(byte);
        }

        let worker = thread::spawn({
            let driver = Arc::clone(&driver);
            move || driver.transmit_loop()
        });

        assert!(wait_for(|| driver.registers().writes().len() == 3));
        driver.stop();

        assert_eq!(worker.join().expect("transmit worker panicked"), 3);
        assert_eq!(driver.registers().writes(), vec![0x10, 0x20, 0x30]);
        assert!(tx_queue.is_empty());
    }

    #[test]
    fn transmit_loop_waits_while_fifo_full() {
        let mock = MockRegisters::default();
        mock.set_tx_full(true);
        let (driver, _, tx_queue) = driver_with(mock);
        tx_queue.push(0xAA);

        let worker = thread::spawn({
            let driver = Arc::clone(&driver);
            move || driver.transmit_loop()
        });

        thread::sleep(POLL_INTERVAL * 3);
        assert!(driver.registers().writes().is_empty());
        assert_eq!(tx_queue.len(), 1);

        driver.registers().set_tx_full(false);
        assert!(wait_for(|| driver.registers().writes() == vec![0xAA]));

        driver.stop();
        assert_eq!(worker.join().expect("transmit worker panicked"), 1);
    }

    #[test]
    fn stop_bounds_loop_exit() {
        let (driver, _, _) = driver_with(MockRegisters::default());

        let rx_worker = thread::spawn({
            let driver = Arc::clone(&driver);
            move || driver.receive_loop()
        });
        let tx_worker = thread::spawn({
            let driver = Arc::clone(&driver);
            move || driver.transmit_loop()
        });

        thread::sleep(POLL_INTERVAL);
        let stopped_at = Instant::now();
        driver.stop();

        assert_eq!(rx_worker.join().expect("receive worker panicked"), 0);
        assert_eq!(tx_worker.join().expect("transmit worker panicked"), 0);

        // Cancellation latency is one poll interval per loop; allow generous
        // scheduler slack on loaded machines.
        assert!(stopped_at.elapsed() < POLL_INTERVAL * 10);
    }

    #[test]
    fn error_flags_do_not_interrupt_reception() {
        let mock = MockRegisters::with_rx(&[0x55, 0x56]);
        mock.set_error_flags(Status::OVERRUN_ERR | Status::FRAME_ERR);
        let (driver, rx_queue, _) = driver_with(mock);

        let worker = thread::spawn({
            let driver = Arc::clone(&driver);
            move || driver.receive_loop()
        });

        // Bytes keep flowing while the error bits are asserted.
        assert!(wait_for(|| rx_queue.len() == 2));
        assert!(driver.registers().status().contains(Status::OVERRUN_ERR));

        driver.stop();
        assert_eq!(worker.join().expect("receive worker panicked"), 2);
    }
}
