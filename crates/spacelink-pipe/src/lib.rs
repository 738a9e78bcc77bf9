//! Byte splicing between live connections
//!
//! A [`BytePump`] moves bytes in one direction; a [`Pipe`] pairs two
//! connections and runs one pump per side until either side fails.

pub mod pipe;
pub mod pump;

pub use pipe::{Pipe, PipeClosed, PipeReport, Side, DEFAULT_BUFFER_SIZE};
pub use pump::{BytePump, PumpStopped};
