//! In-memory transport with a scriptable controller end.
//!
//! [`MockTransport::pair`] returns the host side, to hand to
//! [`crate::Stack::open`], and a [`MockController`] that injects bytes toward
//! the host and captures every packet the host writes.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::framer::PacketFramer;
use crate::opcode::Opcode;
use crate::packet::{CommandPacket, Packet};
use crate::status::StatusCode;

use super::Transport;

/// How long a mock read waits before reporting `TimedOut`.
pub const MOCK_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Host side of the in-memory link.
pub struct MockTransport {
    reader: MockReader,
    writer: MockWriter,
}

impl MockTransport {
    /// Connected host/controller pair.
    #[must_use]
    pub fn pair() -> (Self, MockController) {
        let (to_host, host_rx) = mpsc::channel();
        let (host_tx, from_host) = mpsc::channel();
        let fail_writes = Arc::new(AtomicBool::new(false));
        let transport = Self {
            reader: MockReader {
                rx: host_rx,
                pending: Vec::new(),
                pos: 0,
            },
            writer: MockWriter {
                tx: host_tx,
                buffer: Vec::new(),
                fail: Arc::clone(&fail_writes),
            },
        };
        let controller = MockController {
            to_host: Some(to_host),
            from_host,
            framer: PacketFramer::default(),
            fail_writes,
        };
        (transport, controller)
    }
}

impl Transport for MockTransport {
    type Reader = MockReader;
    type Writer = MockWriter;

    fn split(self) -> io::Result<(MockReader, MockWriter)> {
        Ok((self.reader, self.writer))
    }
}

/// Read half: yields injected chunks, `TimedOut` when idle, EOF on hang-up.
pub struct MockReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
}

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.pending.len() {
            match self.rx.recv_timeout(MOCK_POLL_INTERVAL) {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no controller data"));
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let available = self.pending.get(self.pos..).unwrap_or_default();
        let n = available.len().min(buf.len());
        if let (Some(dst), Some(src)) = (buf.get_mut(..n), available.get(..n)) {
            dst.copy_from_slice(src);
        }
        self.pos = self.pos.saturating_add(n);
        Ok(n)
    }
}

/// Write half: each flush delivers one chunk to the controller end.
pub struct MockWriter {
    tx: Sender<Vec<u8>>,
    buffer: Vec<u8>,
    fail: Arc<AtomicBool>,
}

impl Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock link failed"));
        }
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.tx
            .send(std::mem::take(&mut self.buffer))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "controller end dropped"))
    }
}

/// Controller end of a [`MockTransport`].
pub struct MockController {
    to_host: Option<Sender<Vec<u8>>>,
    from_host: Receiver<Vec<u8>>,
    framer: PacketFramer,
    fail_writes: Arc<AtomicBool>,
}

impl MockController {
    /// Send raw bytes to the host. Silently dropped once the host is gone.
    pub fn inject(&self, bytes: &[u8]) {
        if let Some(tx) = &self.to_host {
            let _ = tx.send(bytes.to_vec());
        }
    }

    /// Send an encoded packet to the host.
    pub fn inject_packet(&self, packet: &Packet) {
        if let Ok(bytes) = packet.encode() {
            self.inject(&bytes);
        }
    }

    /// Send an event with raw parameters.
    pub fn inject_event(&self, code: u8, parameters: &[u8]) {
        let len = u8::try_from(parameters.len()).unwrap_or(u8::MAX);
        let mut bytes = vec![0x04, code, len];
        bytes.extend_from_slice(parameters.get(..usize::from(len)).unwrap_or_default());
        self.inject(&bytes);
    }

    /// Command Complete for `opcode` with one command credit.
    pub fn complete_command(&self, opcode: Opcode, status: StatusCode, return_parameters: &[u8]) {
        let mut params = vec![0x01];
        params.extend_from_slice(&opcode.to_le_bytes());
        params.push(status.raw());
        params.extend_from_slice(return_parameters);
        self.inject_event(0x0E, &params);
    }

    /// Command Status for `opcode` with one command credit.
    pub fn command_status(&self, opcode: Opcode, status: StatusCode) {
        let [lo, hi] = opcode.to_le_bytes();
        self.inject_event(0x0F, &[status.raw(), 0x01, lo, hi]);
    }

    /// Make every further host write fail with `BrokenPipe`.
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::Release);
    }

    /// Close the controller → host direction; the host reads end of stream.
    pub fn hang_up(&mut self) {
        self.to_host = None;
    }

    /// Next chunk the host flushed, raw.
    pub fn next_written(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        self.from_host.recv_timeout(timeout).ok()
    }

    /// Next packet the host wrote, decoded.
    pub fn next_packet(&mut self, timeout: Duration) -> Option<Packet> {
        let deadline = Instant::now().checked_add(timeout)?;
        loop {
            if let Ok(Some(packet)) = self.framer.next_packet() {
                return Some(packet);
            }
            let left = deadline.checked_duration_since(Instant::now())?;
            let chunk = self.from_host.recv_timeout(left).ok()?;
            self.framer.push(&chunk);
        }
    }

    /// Next command the host wrote, skipping data packets.
    pub fn next_command(&mut self, timeout: Duration) -> Option<CommandPacket> {
        let deadline = Instant::now().checked_add(timeout)?;
        loop {
            let left = deadline.checked_duration_since(Instant::now())?;
            if let Packet::Command(cmd) = self.next_packet(left)? {
                return Some(cmd);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)] // Tests use expect() for readable assertions
mod tests {
    use super::*;

    #[test]
    fn host_write_reaches_controller() {
        let (transport, mut controller) = MockTransport::pair();
        let (_reader, mut writer) = transport.split().expect("split");
        writer.write_all(&[0x01, 0x03, 0x0C, 0x00]).expect("write");
        writer.flush().expect("flush");
        let cmd = controller.next_command(Duration::from_secs(1)).expect("command");
        assert_eq!(cmd.opcode, Opcode::RESET);
    }

    #[test]
    fn idle_read_times_out_and_hang_up_is_eof() {
        let (transport, mut controller) = MockTransport::pair();
        let (mut reader, _writer) = transport.split().expect("split");
        let mut buf = [0u8; 8];
        let err = reader.read(&mut buf).expect_err("nothing injected");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        controller.inject(&[0xAB]);
        assert_eq!(reader.read(&mut buf).expect("data"), 1);
        controller.hang_up();
        assert_eq!(reader.read(&mut buf).expect("eof"), 0);
    }

    #[test]
    fn failed_writes_surface_broken_pipe() {
        let (transport, controller) = MockTransport::pair();
        let (_reader, mut writer) = transport.split().expect("split");
        controller.fail_writes();
        let err = writer.write(&[0x01]).expect_err("link failed");
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
