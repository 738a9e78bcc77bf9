//! Bidirectional pipe between two connections

use crate::pump::{BytePump, PumpStopped};
use bytes::Bytes;
use std::fmt;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Read buffer size used when none is configured
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// One of the two connections joined by a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::A => write!(f, "A"),
            Side::B => write!(f, "B"),
        }
    }
}

/// The failure signal that ended a pipe
#[derive(Debug, Error)]
pub enum PipeClosed {
    #[error("side {0} closed the connection")]
    Eof(Side),

    #[error("read from side {0} failed: {1}")]
    ReadFailed(Side, #[source] io::Error),

    #[error("write to side {0} failed: {1}")]
    WriteFailed(Side, #[source] io::Error),

    #[error("pipe cancelled")]
    Cancelled,
}

/// Outcome of a finished pipe
#[derive(Debug)]
pub struct PipeReport {
    pub closed: PipeClosed,
    pub bytes_a_to_b: u64,
    pub bytes_b_to_a: u64,
}

impl PipeReport {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.closed, PipeClosed::Cancelled)
    }
}

/// Pairs exactly two connections and splices bytes between them
///
/// A pipe is consumed by [`Pipe::run`]; once the first failure fires both
/// connections are shut down and dropped, so a pipe is never reused.
pub struct Pipe<A, B> {
    a: A,
    b: B,
    buffer_size: usize,
}

impl<A, B> Pipe<A, B>
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(a: A, b: B) -> Self {
        Self {
            a,
            b,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Set the per-read buffer size (zero falls back to the default)
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = if buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            buffer_size
        };
        self
    }

    /// Run until either side fails or `cancel` fires
    ///
    /// Chunks read from A are written to B in order and vice versa. Both
    /// connections are closed exactly once before this returns.
    pub async fn run(self, cancel: CancellationToken) -> PipeReport {
        let (read_a, mut write_a) = tokio::io::split(self.a);
        let (read_b, mut write_b) = tokio::io::split(self.b);

        let (a_tx, mut a_rx) = mpsc::channel::<Bytes>(1);
        let (b_tx, mut b_rx) = mpsc::channel::<Bytes>(1);
        let (fail_tx, mut fail_rx) = mpsc::channel::<(Side, PumpStopped)>(2);

        let pump_a = spawn_pump(Side::A, read_a, self.buffer_size, a_tx, fail_tx.clone());
        let pump_b = spawn_pump(Side::B, read_b, self.buffer_size, b_tx, fail_tx);

        let mut bytes_a_to_b = 0u64;
        let mut bytes_b_to_a = 0u64;

        // Chunk branches come before the failure branch so that data read
        // ahead of an EOF is flushed to the other side first.
        let closed = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break PipeClosed::Cancelled,
                Some(chunk) = a_rx.recv() => {
                    // A write blocked on a peer that stopped reading must not
                    // hide a failure on the other side.
                    tokio::select! {
                        biased;
                        result = write_b.write_all(&chunk) => {
                            if let Err(e) = result {
                                break PipeClosed::WriteFailed(Side::B, e);
                            }
                            bytes_a_to_b += chunk.len() as u64;
                        }
                        _ = cancel.cancelled() => break PipeClosed::Cancelled,
                        Some((side, stopped)) = fail_rx.recv() => break stopped.into_closed(side),
                    }
                }
                Some(chunk) = b_rx.recv() => {
                    tokio::select! {
                        biased;
                        result = write_a.write_all(&chunk) => {
                            if let Err(e) = result {
                                break PipeClosed::WriteFailed(Side::A, e);
                            }
                            bytes_b_to_a += chunk.len() as u64;
                        }
                        _ = cancel.cancelled() => break PipeClosed::Cancelled,
                        Some((side, stopped)) = fail_rx.recv() => break stopped.into_closed(side),
                    }
                }
                Some((side, stopped)) = fail_rx.recv() => break stopped.into_closed(side),
            }
        };

        pump_a.abort();
        pump_b.abort();
        let _ = pump_a.await;
        let _ = pump_b.await;

        let _ = write_a.shutdown().await;
        let _ = write_b.shutdown().await;

        debug!(
            reason = %closed,
            bytes_a_to_b,
            bytes_b_to_a,
            "Pipe closed"
        );

        PipeReport {
            closed,
            bytes_a_to_b,
            bytes_b_to_a,
        }
    }
}

impl PumpStopped {
    fn into_closed(self, side: Side) -> PipeClosed {
        match self {
            PumpStopped::Eof => PipeClosed::Eof(side),
            PumpStopped::Failed(e) => PipeClosed::ReadFailed(side, e),
            // The coordinator owns both receivers, so this only happens while
            // it is already tearing down.
            PumpStopped::SinkClosed => PipeClosed::Cancelled,
        }
    }
}

fn spawn_pump<R>(
    side: Side,
    reader: R,
    buffer_size: usize,
    sink: mpsc::Sender<Bytes>,
    failures: mpsc::Sender<(Side, PumpStopped)>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let stopped = BytePump::new(reader, buffer_size).run(sink).await;
        let _ = failures.send((side, stopped)).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    fn init_tracing() {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init()
            .ok();
    }

    #[tokio::test]
    async fn test_bytes_flow_both_directions() {
        let (mut client, a) = duplex(256);
        let (b, mut service) = duplex(256);

        let cancel = CancellationToken::new();
        let pipe = tokio::spawn(Pipe::new(a, b).run(cancel.clone()));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        service.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        service.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        cancel.cancel();
        let report = pipe.await.unwrap();
        assert!(report.is_cancelled());
        assert_eq!(report.bytes_a_to_b, 4);
        assert_eq!(report.bytes_b_to_a, 4);
    }

    #[tokio::test]
    async fn test_eof_on_one_side_closes_the_other() {
        let (client, a) = duplex(256);
        let (b, mut service) = duplex(256);

        let pipe = tokio::spawn(Pipe::new(a, b).run(CancellationToken::new()));

        drop(client);

        let report = tokio::time::timeout(Duration::from_secs(1), pipe)
            .await
            .expect("pipe did not tear down")
            .unwrap();
        assert!(matches!(report.closed, PipeClosed::Eof(Side::A)));

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(1), service.read(&mut buf))
            .await
            .expect("service side not closed")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_data_before_eof_is_delivered() {
        let (mut client, a) = duplex(256);
        let (b, mut service) = duplex(256);

        let pipe = tokio::spawn(Pipe::new(a, b).with_buffer_size(3).run(CancellationToken::new()));

        client.write_all(b"last words").await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        service.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"last words");

        let report = pipe.await.unwrap();
        assert!(matches!(report.closed, PipeClosed::Eof(Side::A)));
        assert_eq!(report.bytes_a_to_b, 10);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (_client, a) = duplex(64);
        let (b, _service) = duplex(64);

        let cancel = CancellationToken::new();
        let pipe = tokio::spawn(Pipe::new(a, b).run(cancel.clone()));

        cancel.cancel();
        cancel.cancel();
        let report = pipe.await.unwrap();
        assert!(report.is_cancelled());

        // Closing again after teardown is a no-op
        cancel.cancel();
    }

    #[test]
    fn test_zero_buffer_size_uses_default() {
        let (_, a) = duplex(8);
        let (b, _) = duplex(8);
        let pipe = Pipe::new(a, b).with_buffer_size(0);
        assert_eq!(pipe.buffer_size, DEFAULT_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_close_during_blocked_write_tears_down() {
        init_tracing();

        let (mut client, a) = duplex(256);
        // The service never reads, so writes into B stall once 16 bytes are buffered
        let (b, _service) = duplex(16);

        let pipe = tokio::spawn(Pipe::new(a, b).run(CancellationToken::new()));

        client.write_all(&[7u8; 48]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(client);

        let report = tokio::time::timeout(Duration::from_secs(2), pipe)
            .await
            .expect("pipe did not tear down after side A closed")
            .unwrap();
        assert!(matches!(report.closed, PipeClosed::Eof(Side::A)));
        assert!(report.bytes_a_to_b < 48);
    }

    #[tokio::test]
    async fn test_random_payload_arrives_intact() {
        init_tracing();

        let (client, a) = duplex(4096);
        let (b, service) = duplex(4096);

        let cancel = CancellationToken::new();
        let pipe = tokio::spawn(Pipe::new(a, b).run(cancel.clone()));

        let mut payload = vec![0u8; 10 * 1024];
        rand::thread_rng().fill(&mut payload[..]);

        // Echo everything the service receives back through the pipe
        let (mut service_rx, mut service_tx) = tokio::io::split(service);
        let echo = tokio::spawn(async move {
            let _ = tokio::io::copy(&mut service_rx, &mut service_tx).await;
        });

        let (mut client_rx, mut client_tx) = tokio::io::split(client);
        let to_send = payload.clone();
        let writer = tokio::spawn(async move {
            client_tx.write_all(&to_send).await.unwrap();
            client_tx
        });

        let mut echoed = vec![0u8; payload.len()];
        tokio::time::timeout(Duration::from_secs(5), client_rx.read_exact(&mut echoed))
            .await
            .expect("echo timed out")
            .unwrap();
        assert_eq!(echoed, payload);

        cancel.cancel();
        let report = pipe.await.unwrap();
        assert_eq!(report.bytes_a_to_b, payload.len() as u64);
        assert_eq!(report.bytes_b_to_a, payload.len() as u64);

        drop(writer.await.unwrap());
        echo.abort();
    }
}
