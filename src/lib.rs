//! # SerialPlot RS
//!
//! A Rust library for acquiring multiplexed analog channels from a device
//! attached over a serial line.
//!
//! The device announces its channels in a small binary handshake and then
//! streams one sample per channel per frame. This crate performs the
//! handshake, decodes every sample to a normalized `f32` and hands it to a
//! per-channel sink, on a background thread that can be started and stopped
//! at any time.
//!
//! ## Features
//!
//! - **Handshake**: configuration request, marker synchronization and channel parsing
//! - **Decoding**: 1, 2 and 4 byte little-endian samples mapped onto `[-0.5, 0.5)`
//! - **Sinks**: scrolling traces, lock-free ring buffers, or your own [`SampleSink`]
//! - **Lifecycle**: [`SessionController`] with start/stop that joins cleanly
//! - **DataFrame output**: traces export to `polars` for analysis
//!
//! ## Examples
//!
//! ### Streaming into traces
//!
//! ```rust,no_run
//! use serialplot_rs::{LinkSettings, SerialConnector, SessionController, TraceFactory};
//! use std::time::Duration;
//!
//! let connector = SerialConnector::new(LinkSettings::new("/dev/ttyUSB0"));
//! let mut controller = SessionController::new(connector, TraceFactory::default());
//!
//! controller.start()?;
//! std::thread::sleep(Duration::from_secs(1));
//! let end = controller.stop()?;
//! println!("Session ended: {:?}", end);
//!
//! for (title, trace) in controller.sinks().snapshot().iter() {
//!     println!("{}: {:?}", title, trace.lock().unwrap().latest());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Decoding a raw sample
//!
//! ```rust
//! use serialplot_rs::sample_decoder::{decode, SampleWidth};
//!
//! assert_eq!(decode(&[0x80], 1), 0.0);
//! assert_eq!(SampleWidth::Two.decode(&[0x00, 0x00]), -0.5);
//! ```
//!
//! ### Ring buffer bookkeeping
//!
//! ```rust
//! use serialplot_rs::CircularBuffer;
//!
//! let mut buffer = CircularBuffer::<f32>::new(8);
//! assert!(buffer.write(&[0.1, 0.2, 0.3]));
//! assert_eq!(buffer.amount_written(), 3);
//!
//! let mut out = [0.0; 3];
//! assert!(buffer.read(&mut out));
//! assert_eq!(buffer.readable(), 0);
//! ```

pub mod acquisition;
pub mod circular_buffer;
pub mod config_protocol;
pub mod sample_decoder;
pub mod session_controller;
pub mod sinks;
pub mod transport;

// Re-export the main types for convenience
pub use circular_buffer::{CircularBuffer, Consumer, Producer, RingElement};

pub use sample_decoder::SampleWidth;

pub use config_protocol::{
    ChannelConfig, ChannelDescriptor, ConfigProtocol, HandshakeState, SyncDetector,
    CONFIG_REQUEST, SYNC_MARKER,
};

pub use acquisition::{AcquisitionSession, Sample, SessionEnd};

pub use session_controller::{SessionController, SessionState};

pub use sinks::{
    traces_to_dataframe, BufferFactory, BufferSink, ChannelSlot, SampleSink, SharedSink,
    SinkDirectory, SinkFactory, SinkMap, Trace, TraceFactory,
};

pub use transport::{
    available_ports, AcquisitionError, Connect, LinkReader, LinkSettings, PortInfo, ReadStage,
    RunFlag, SerialConnector, SerialTransport, Transport,
};
