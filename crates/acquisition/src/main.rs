//! Event DAQ bench simulator
//!
//! Runs the full acquisition pipeline against the mock board: a ticker
//! stands in for the 200 Hz clock interrupt, a generator fires synthetic
//! triggers with correlated timing pairs, and the ground side starts a run
//! over the command channel exactly as the real ground system would.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use acquisition::{init_logging, AcquisitionConfig, BoardIo, Pipeline};
use board_hal::{Clock, LoopbackPort, SerialPort};
use command_channel::{address_byte, encode_block, BOARD_ADDRESS};
use tof_correlator::TofSample;

fn send_command(port: &LoopbackPort, opcode: u8, data: &[u8]) {
    for byte in encode_block(opcode, address_byte(BOARD_ADDRESS, data.len() as u8)) {
        let _ = port.write(byte);
    }
    for (index, &value) in data.iter().enumerate() {
        for byte in encode_block(value, address_byte(BOARD_ADDRESS, index as u8 + 1)) {
            let _ = port.write(byte);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    info!("=== Event DAQ simulator v{} ===", env!("CARGO_PKG_VERSION"));

    let config = AcquisitionConfig::load().unwrap_or_default();
    let (io, mocks) = BoardIo::mock();
    mocks.analog.set_values([512, 480, 530, 505, 90, 0]);

    let mut pipeline = Pipeline::new(io, config);
    let handles = pipeline.interrupts();
    let shutdown = Arc::new(AtomicBool::new(false));

    // The ticker stands in for the periodic clock interrupt.
    let clock = Arc::clone(&mocks.clock);
    clock.auto_advance(0);
    let ticker = {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(5));
            while !shutdown.load(Ordering::SeqCst) {
                interval.tick().await;
                clock.advance(1);
            }
        })
    };

    // Synthetic trigger source: one GO every 50 ms with a correlated
    // timing pair landing in both capture channels.
    let generator = {
        let shutdown = Arc::clone(&shutdown);
        let clock = Arc::clone(&mocks.clock);
        let handles = handles.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(50));
            let mut n = 0u32;
            while !shutdown.load(Ordering::SeqCst) {
                interval.tick().await;
                let tag = clock.now() as u16;
                let reference = 1000 + (n % 40000) as u16;
                let stop = (n * 37 % 8333) as u16;
                handles
                    .tof_a
                    .capture(TofSample::new(reference, stop, tag).raw, tag);
                handles
                    .tof_b
                    .capture(TofSample::new(reference, stop.wrapping_add(40), tag).raw, tag);
                handles.singles.increment(1 + (n as usize % 5));
                handles.arbiter.on_trigger_edge();
                n += 1;
            }
        })
    };

    // Ground side: start run 1 without detector readout.
    send_command(&mocks.ground, 0x3C, &[0x00, 0x01, 0x00]);

    let loop_handle = {
        let shutdown = Arc::clone(&shutdown);
        tokio::task::spawn_blocking(move || {
            pipeline.run(&shutdown);
            pipeline
        })
    };

    // Periodic telemetry drain, as the ground system would read the port.
    let drain = {
        let shutdown = Arc::clone(&shutdown);
        let host = Arc::clone(&mocks.host);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            while !shutdown.load(Ordering::SeqCst) {
                interval.tick().await;
                let bytes = host.taken();
                if !bytes.is_empty() {
                    host.clear();
                    info!(bytes = bytes.len(), "telemetry emitted");
                }
            }
        })
    };

    info!("running, stop with ctrl-c");
    tokio::signal::ctrl_c().await?;
    shutdown.store(true, Ordering::SeqCst);

    let pipeline = loop_handle.await?;
    let _ = tokio::join!(ticker, generator, drain);

    let faults = pipeline.error_log().drain();
    info!(faults = faults.len(), "simulator stopped");
    Ok(())
}
