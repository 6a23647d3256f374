//! In-memory serial port for driver tests and device simulators.
//!
//! [`MockSerialPort`] implements `AsyncRead`/`AsyncWrite` and is handed to a
//! driver in place of a real port. [`MockDeviceHarness`] stays with the test (or
//! with a simulator task) and plays the device side.
//!
//! Two unbounded channels carry the bytes, one per direction. Dropping the
//! harness makes the port read EOF and fail writes with `BrokenPipe`, which is
//! how a pulled USB cable looks to the driver.
//!
//! # Example
//!
//! ```rust,ignore
//! let (port, mut harness) = phantom_core::mock_serial::new();
//! let driver = CylinderDriver::with_port(Box::new(port), config);
//!
//! harness.expect_and_respond(b"GET\n", b"12.5\r\n").await;
//! ```

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{timeout, Duration};

/// How long harness expectations wait before failing the test.
const EXPECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Driver-facing side of the mock serial port.
#[derive(Debug)]
pub struct MockSerialPort {
    writes_tx: UnboundedSender<Vec<u8>>,
    reads_rx: UnboundedReceiver<Vec<u8>>,
    read_buffer: VecDeque<u8>,
}

/// Device-facing side of the mock serial port.
#[derive(Debug)]
pub struct MockDeviceHarness {
    writes_rx: UnboundedReceiver<Vec<u8>>,
    reads_tx: UnboundedSender<Vec<u8>>,
    write_buffer: Vec<u8>,
}

/// Creates a connected `MockSerialPort` / `MockDeviceHarness` pair.
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (client_to_harness_tx, client_to_harness_rx) = mpsc::unbounded_channel();
    let (harness_to_client_tx, harness_to_client_rx) = mpsc::unbounded_channel();

    let port = MockSerialPort {
        writes_tx: client_to_harness_tx,
        reads_rx: harness_to_client_rx,
        read_buffer: VecDeque::new(),
    };

    let harness = MockDeviceHarness {
        writes_rx: client_to_harness_rx,
        reads_tx: harness_to_client_tx,
        write_buffer: Vec::new(),
    };

    (port, harness)
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.read_buffer.is_empty() {
            match self.reads_rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.read_buffer.extend(chunk),
                // harness gone: EOF
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let to_read = buf.remaining().min(self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..to_read).collect();
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device harness disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl MockDeviceHarness {
    /// Queue bytes for the driver to read.
    ///
    /// # Errors
    /// Returns error if the driver side has been dropped.
    pub fn send_response(&self, data: &[u8]) -> Result<(), &'static str> {
        self.reads_tx
            .send(data.to_vec())
            .map_err(|_| "client port disconnected")
    }

    /// Wait for the next complete `\n`-terminated line written by the driver.
    ///
    /// The terminator and any trailing `\r` are stripped. Returns `None` once
    /// the driver side is dropped and no complete line is left. Cancel-safe:
    /// bytes of a partial line stay buffered for the next call.
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(end) = self.write_buffer.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = self.write_buffer.drain(..=end).collect();
                let line = String::from_utf8_lossy(&raw);
                return Some(line.trim_end_matches(['\r', '\n']).to_string());
            }

            let chunk = self.writes_rx.recv().await?;
            self.write_buffer.extend_from_slice(&chunk);
        }
    }

    /// Wait for exactly `n` written bytes. Returns `None` once the driver side
    /// is dropped before `n` bytes arrived.
    pub async fn next_frame(&mut self, n: usize) -> Option<Vec<u8>> {
        while self.write_buffer.len() < n {
            let chunk = self.writes_rx.recv().await?;
            self.write_buffer.extend_from_slice(&chunk);
        }
        Some(self.write_buffer.drain(..n).collect())
    }

    /// Assert the driver writes exactly `expected` next.
    ///
    /// # Panics
    /// Panics if the bytes do not arrive within 2 seconds or differ.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        while self.write_buffer.len() < expected.len() {
            match timeout(EXPECT_TIMEOUT, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("client port closed while expecting a write"),
                Err(_) => panic!(
                    "timeout waiting for write: expected {:?}, received {:?}",
                    String::from_utf8_lossy(expected),
                    String::from_utf8_lossy(&self.write_buffer),
                ),
            }
        }

        let actual = &self.write_buffer[..expected.len()];
        assert_eq!(
            actual,
            expected,
            "unexpected write: expected {:?}, got {:?}",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(actual)
        );
        self.write_buffer.drain(..expected.len());
    }

    /// [`expect_write`](Self::expect_write) followed by
    /// [`send_response`](Self::send_response).
    ///
    /// # Panics
    /// Panics on a mismatched write or a dropped driver side.
    pub async fn expect_and_respond(&mut self, expected: &[u8], response: &[u8]) {
        self.expect_write(expected).await;
        if let Err(e) = self.send_response(response) {
            panic!("failed to send response: {e}");
        }
    }

    /// Assert the driver wrote nothing for `window`.
    ///
    /// # Panics
    /// Panics if any byte arrives.
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(Some(chunk)) = timeout(window, self.writes_rx.recv()).await {
            self.write_buffer.extend_from_slice(&chunk);
        }
        assert!(
            self.write_buffer.is_empty(),
            "expected no writes, got {:?}",
            String::from_utf8_lossy(&self.write_buffer)
        );
    }

    /// Discard pending writes without asserting on them.
    pub async fn drain_writes(&mut self) {
        let short_timeout = Duration::from_millis(50);
        while let Ok(Some(_)) = timeout(short_timeout, self.writes_rx.recv()).await {}
        self.write_buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn command_response() {
        let (port, mut harness) = new();
        let mut port = BufReader::new(port);

        let app_task = tokio::spawn(async move {
            port.write_all(b"GET\n").await.unwrap();
            let mut response = String::new();
            port.read_line(&mut response).await.unwrap();
            response
        });

        harness.expect_and_respond(b"GET\n", b"7.5\r\n").await;
        assert_eq!(app_task.await.unwrap(), "7.5\r\n");
    }

    #[tokio::test]
    async fn next_line_joins_split_writes() {
        let (mut port, mut harness) = new();

        port.write_all(b"Z=1").await.unwrap();
        port.write_all(b"2.5\nREACHED\n").await.unwrap();

        assert_eq!(harness.next_line().await.as_deref(), Some("Z=12.5"));
        assert_eq!(harness.next_line().await.as_deref(), Some("REACHED"));

        drop(port);
        assert_eq!(harness.next_line().await, None);
    }

    #[tokio::test]
    async fn next_frame_returns_fixed_size_chunks() {
        let (mut port, mut harness) = new();
        port.write_all(&[1, 2, 3, 4, 5]).await.unwrap();

        assert_eq!(harness.next_frame(2).await, Some(vec![1, 2]));
        assert_eq!(harness.next_frame(3).await, Some(vec![3, 4, 5]));
    }

    #[tokio::test]
    async fn dropped_harness_reads_eof() {
        let (port, harness) = new();
        let mut port = BufReader::new(port);
        drop(harness);

        let mut line = String::new();
        assert_eq!(port.read_line(&mut line).await.unwrap(), 0);
        assert!(port.get_mut().write_all(b"GET\n").await.is_err());
    }

    #[tokio::test]
    async fn silence_passes_without_writes() {
        let (_port, mut harness) = new();
        harness.expect_silence(Duration::from_millis(20)).await;
    }
}
