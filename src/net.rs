//! Connection plumbing shared by replicas and the coordinator.
//!
//! Every frame exchange in the system is line-oriented over TCP, usually
//! one-shot: open a connection, send a frame, read the reply, close. The
//! optional wide-area delay emulation sleeps a uniform random interval
//! before every outbound send; it is disabled unless `enable_delay` is
//! called at startup, so tests and production runs pay nothing.

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::{CorkboardError, Result};

static DELAY_RANGE: OnceLock<(u64, u64)> = OnceLock::new();

/// Turns on the simulated wide-area delay for this process.
///
/// Every subsequent outbound send sleeps a uniform random number of
/// milliseconds in `[min_ms, max_ms]` first. May only be enabled once.
pub fn enable_delay(min_ms: u64, max_ms: u64) {
    let _ = DELAY_RANGE.set((min_ms, max_ms));
}

async fn emulate_delay() {
    if let Some(&(min, max)) = DELAY_RANGE.get() {
        let ms = rand::thread_rng().gen_range(min..=max);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

/// A line-oriented TCP connection.
pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    /// Opens a new connection to the given address.
    pub async fn open(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(stream))
    }

    /// Wraps an accepted connection.
    pub fn from_stream(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Sends one line, delay emulation included.
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        emulate_delay().await;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    /// Reads one line, without its terminator. `None` means the peer
    /// closed the connection.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    /// Reads one line, treating early close as a protocol error.
    pub async fn expect_line(&mut self) -> Result<String> {
        self.read_line()
            .await?
            .ok_or_else(|| CorkboardError::protocol("connection closed before reply"))
    }
}

/// One-shot exchange: connect, send a single frame, read a single reply.
pub async fn request_line(addr: SocketAddr, line: &str) -> Result<String> {
    let mut conn = Connection::open(addr).await?;
    conn.send_line(line).await?;
    conn.expect_line().await
}
