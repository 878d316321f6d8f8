//! Acquisition core
//!
//! Owns the cooperative main loop: trigger readout through the event
//! builder, envelope output, command decode and dispatch, detector
//! housekeeping forwarding. Nothing in the loop blocks; every wait is a
//! bounded tick poll against the injected clock.

mod config;
mod dispatch;
mod io;
mod pipeline;

pub use config::AcquisitionConfig;
pub use io::{BoardIo, MockBoard};
pub use pipeline::{InterruptHandles, OutputMode, Pipeline};

/// Version byte reported by the version command.
pub const FIRMWARE_VERSION: u8 = 1;

/// Install the global tracing subscriber for the binary.
pub fn init_logging() {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}
