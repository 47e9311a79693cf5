// SPDX-License-Identifier: MIT

//! `uartlite-loop`: bring up the UART Lite driver and loop every received
//! byte back out of the transmitter until interrupted.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use pl_uartlite::{ByteQueue, UartDriver};

/// How long the loopback loop sleeps when nothing has been received.
const LOOPBACK_POLL: Duration = Duration::from_millis(20);

#[derive(Parser)]
#[command(name = "uartlite-loop", about = "Loop back bytes through a memory-mapped AXI UART Lite")]
struct Cli {
    /// Physical base address of the UART aperture, hex or decimal
    #[arg(short = 'b', long, default_value = "0x42C00000", value_parser = parse_address)]
    base_address: u64,

    /// Aperture size in bytes, hex or decimal
    #[arg(long, default_value = "0x10000", value_parser = parse_address)]
    aperture_size: u64,
}

fn parse_address(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address {s:?}: {e}"))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))
        .context("failed to install the SIGINT handler")?;

    let rx_queue = Arc::new(ByteQueue::new());
    let tx_queue = Arc::new(ByteQueue::new());

    let uart = Arc::new(
        UartDriver::open(
            cli.base_address,
            cli.aperture_size as usize,
            Arc::clone(&rx_queue),
            Arc::clone(&tx_queue),
        )
        .with_context(|| {
            format!(
                "failed to bring up the UART at {:#x} (aperture {:#x} bytes)",
                cli.base_address, cli.aperture_size
            )
        })?,
    );

    info!(
        "uart mapped at {:#x}, aperture {:#x} bytes; press Ctrl-C to exit",
        cli.base_address, cli.aperture_size
    );

    let rx_worker = thread::spawn({
        let uart = Arc::clone(&uart);
        move || uart.receive_loop()
    });
    let tx_worker = thread::spawn({
        let uart = Arc::clone(&uart);
        move || uart.transmit_loop()
    });

    while !shutdown.load(Ordering::Acquire) {
        if rx_queue.is_empty() {
            thread::sleep(LOOPBACK_POLL);
            continue;
        }

        // Fixed lock order whenever both queues are held: receive queue
        // first, then transmit queue.
        let drained = rx_queue.with(|rx| {
            tx_queue.with(|tx| {
                let mut moved = Vec::with_capacity(rx.len());
                while let Some(byte) = rx.pop_front() {
                    tx.push_back(byte);
                    moved.push(byte);
                }
                moved
            })
        });

        let mut stdout = io::stdout();
        stdout
            .write_all(&drained)
            .and_then(|()| stdout.flush())
            .context("failed to echo received bytes")?;
    }

    uart.stop();
    let read = rx_worker
        .join()
        .map_err(|_| anyhow::anyhow!("receive worker panicked"))?;
    let written = tx_worker
        .join()
        .map_err(|_| anyhow::anyhow!("transmit worker panicked"))?;

    info!("shut down; {read} bytes read, {written} bytes written");
    Ok(())
}
