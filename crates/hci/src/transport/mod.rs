//! Byte-stream transports to the controller.
//!
//! A [`Transport`] splits into a read half, owned by the dispatch thread, and
//! a write half, shared by command and data senders behind a lock. The read
//! half must not block forever: it should return `WouldBlock`/`TimedOut` on a
//! read timeout, or `Ok(0)` at end of stream, so the dispatch thread notices
//! shutdown.

pub mod mock;

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// Read timeout applied to socket transports.
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A duplex byte stream to an HCI controller (UART, USB bridge, socket).
pub trait Transport: Send + 'static {
    /// Receive half.
    type Reader: Read + Send + 'static;
    /// Transmit half.
    type Writer: Write + Send + 'static;

    /// Separate the two halves.
    ///
    /// # Errors
    ///
    /// Any I/O error raised while duplicating or configuring the stream.
    fn split(self) -> io::Result<(Self::Reader, Self::Writer)>;
}

/// Pre-split halves, e.g. two ends of a serial port handle.
impl<R, W> Transport for (R, W)
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    type Reader = R;
    type Writer = W;

    fn split(self) -> io::Result<(R, W)> {
        Ok(self)
    }
}

/// H4 over TCP, as exposed by controller emulators.
impl Transport for TcpStream {
    type Reader = TcpStream;
    type Writer = TcpStream;

    fn split(self) -> io::Result<(TcpStream, TcpStream)> {
        self.set_nodelay(true)?;
        self.set_read_timeout(Some(READ_POLL_INTERVAL))?;
        let writer = self.try_clone()?;
        Ok((self, writer))
    }
}
