//! # Instrument Session Core
//!
//! Shared command/response machinery for serial laboratory instruments: a
//! pipette pump, a balance and a DMA instrument all talk to their host the
//! same way. A framed command goes out, the session waits for the matching
//! reply within a timeout, and a background poller reads status in between.
//! This crate implements that pattern once.
//!
//! ## Crate Structure
//!
//! - **`transport`**: the line-oriented byte channel (`Transport`) and the
//!   connectors that open one over a serial port or a TCP socket.
//! - **`codec`**: the `FrameCodec` trait and the two wire formats,
//!   address-framed (`"1RI100º\r"`) and template (`"DMA,SN1,CLR,0,END"`).
//! - **`session`**: `InstrumentSession`, which owns the transport behind a
//!   single mutex and implements `connect`, `query` and `disconnect`.
//! - **`feedback`**: the background status poller and its samples.
//! - **`config`**: Figment-based configuration with per-device profiles.
//! - **`error`**: `SessionError`, `TransportError` and the `Reply` type that
//!   carries device faults as data.
//! - **`logging`**: `tracing-subscriber` initialisation for binaries.
//! - **`sim`**: simulated instruments over in-memory pipes.

pub mod codec;
pub mod config;
pub mod error;
pub mod feedback;
pub mod logging;
pub mod session;
pub mod sim;
pub mod transport;

pub use codec::{Classification, CodecKind, FrameCodec, Value};
pub use config::{DeviceProfile, SessionConfig};
pub use error::{DeviceFault, Reply, SessionError, SessionResult};
pub use feedback::FeedbackSample;
pub use session::InstrumentSession;
