//! Bidirectional byte pump.
//!
//! Copies `a -> b` and `b -> a` concurrently. As soon as either direction
//! finishes (EOF or error) both write halves are shut down and the other
//! direction is cancelled, so the call never leaves a copy running behind it.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

const BUFFER_SIZE: usize = 8192;

/// Which direction finished first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `a -> b` finished first.
    AToB,
    /// `b -> a` finished first.
    BToA,
}

/// Bytes moved by a pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpStats {
    /// Bytes copied from `a` to `b`.
    pub to_b: u64,
    /// Bytes copied from `b` to `a`.
    pub from_b: u64,
    /// Direction that ended the pump.
    pub finished: Direction,
}

/// A pump that ended on an IO error. Carries the bytes moved before it failed.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct PumpError {
    pub stats: PumpStats,
    pub source: io::Error,
}

/// Pump bytes between `a` and `b` until either side closes.
///
/// Returns the error of the direction that finished first, if it failed.
pub async fn pump<A, B>(
    a: A,
    b: B,
    idle_timeout: Option<Duration>,
) -> Result<PumpStats, PumpError>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let mut to_b = 0u64;
    let mut from_b = 0u64;

    let (finished, result) = {
        let a_to_b = copy_half(&mut a_read, &mut b_write, &mut to_b, idle_timeout);
        let b_to_a = copy_half(&mut b_read, &mut a_write, &mut from_b, idle_timeout);
        tokio::pin!(a_to_b, b_to_a);

        tokio::select! {
            res = &mut a_to_b => (Direction::AToB, res),
            res = &mut b_to_a => (Direction::BToA, res),
        }
    };

    // The losing copy was dropped above; release both peers.
    let _ = b_write.shutdown().await;
    let _ = a_write.shutdown().await;

    trace!(
        to_b = to_b,
        from_b = from_b,
        finished = ?finished,
        "Pump finished"
    );

    let stats = PumpStats {
        to_b,
        from_b,
        finished,
    };
    match result {
        Ok(()) => Ok(stats),
        Err(source) => Err(PumpError { stats, source }),
    }
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    total: &mut u64,
    idle_timeout: Option<Duration>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let read_result = if let Some(timeout) = idle_timeout {
            match tokio::time::timeout(timeout, reader.read(&mut buf)).await {
                Ok(result) => result,
                Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
            }
        } else {
            reader.read(&mut buf).await
        };

        match read_result? {
            0 => return Ok(()),
            n => {
                writer.write_all(&buf[..n]).await?;
                writer.flush().await?;
                *total += n as u64;
            }
        }
    }
}
