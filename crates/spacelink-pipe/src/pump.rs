//! Unidirectional byte pump

use bytes::Bytes;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

/// Why a pump stopped reading
#[derive(Debug)]
pub enum PumpStopped {
    /// The peer shut down its write side
    Eof,
    /// The read itself failed
    Failed(io::Error),
    /// Nobody is receiving chunks any more
    SinkClosed,
}

/// Reads from one connection and hands every chunk to a sink
///
/// Each successful read of `n > 0` bytes is copied into a fresh [`Bytes`],
/// so the read buffer is reused without aliasing what the sink holds.
pub struct BytePump<R> {
    reader: R,
    buffer_size: usize,
}

impl<R> BytePump<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, buffer_size: usize) -> Self {
        Self {
            reader,
            buffer_size: buffer_size.max(1),
        }
    }

    /// Pump until EOF, a read error, or the sink going away
    pub async fn run(mut self, sink: mpsc::Sender<Bytes>) -> PumpStopped {
        let mut buffer = vec![0u8; self.buffer_size];

        loop {
            match self.reader.read(&mut buffer).await {
                Ok(0) => return PumpStopped::Eof,
                Ok(n) => {
                    if sink.send(Bytes::copy_from_slice(&buffer[..n])).await.is_err() {
                        return PumpStopped::SinkClosed;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return PumpStopped::Failed(e),
            }
        }
    }
}
