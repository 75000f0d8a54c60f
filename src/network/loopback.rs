//! In-memory transports for tests and same-process play.
//!
//! ```
//! use lockstep_netplay::network::loopback::listener;
//! use lockstep_netplay::StreamAcceptor;
//! use std::io::{Read, Write};
//!
//! let (mut acceptor, connector) = listener();
//! let mut client_end = connector.connect();
//! let mut server_end = acceptor.accept_stream()?.expect("pending stream");
//!
//! client_end.write_all(b"hi")?;
//! let mut buf = [0u8; 2];
//! server_end.read_exact(&mut buf)?;
//! assert_eq!(&buf, b"hi");
//! # Ok::<(), std::io::Error>(())
//! ```

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{StreamAcceptor, Transport};

#[derive(Debug, Default)]
struct Pipe {
    bytes: VecDeque<u8>,
    closed: bool,
}

/// One end of an in-memory byte stream.
///
/// Reads return `WouldBlock` while the stream is empty and open, and `Ok(0)` once
/// the other end has closed it and all bytes were read. Dropping an end closes it.
#[derive(Debug)]
pub struct LoopbackTransport {
    inbound: Arc<Mutex<Pipe>>,
    outbound: Arc<Mutex<Pipe>>,
    max_chunk: Option<usize>,
    yield_next_read: bool,
}

impl LoopbackTransport {
    /// Creates two connected ends.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let a_to_b = Arc::new(Mutex::new(Pipe::default()));
        let b_to_a = Arc::new(Mutex::new(Pipe::default()));
        let a = Self {
            inbound: Arc::clone(&b_to_a),
            outbound: Arc::clone(&a_to_b),
            max_chunk: None,
            yield_next_read: false,
        };
        let b = Self {
            inbound: a_to_b,
            outbound: b_to_a,
            max_chunk: None,
            yield_next_read: false,
        };
        (a, b)
    }

    /// Limits every read and write to `max_chunk` bytes and makes the read after a
    /// delivered chunk report `WouldBlock`, so messages trickle in across polls.
    #[must_use]
    pub fn with_max_chunk(mut self, max_chunk: usize) -> Self {
        self.max_chunk = Some(max_chunk.max(1));
        self
    }

    /// Closes both directions. The other end reads EOF once it has drained its bytes.
    pub fn close(&self) {
        self.inbound.lock().closed = true;
        self.outbound.lock().closed = true;
    }

    /// Returns `true` once either end has closed the stream.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.outbound.lock().closed
    }

    /// Bytes written by the other end that have not been read yet.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.inbound.lock().bytes.len()
    }
}

impl Read for LoopbackTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if std::mem::take(&mut self.yield_next_read) {
            return Err(ErrorKind::WouldBlock.into());
        }
        let mut pipe = self.inbound.lock();
        if pipe.bytes.is_empty() {
            return if pipe.closed {
                Ok(0)
            } else {
                Err(ErrorKind::WouldBlock.into())
            };
        }
        let limit = self.max_chunk.unwrap_or(usize::MAX);
        let n = buf.len().min(limit).min(pipe.bytes.len());
        for (dst, src) in buf.iter_mut().zip(pipe.bytes.drain(..n)) {
            *dst = src;
        }
        self.yield_next_read = self.max_chunk.is_some();
        Ok(n)
    }
}

impl Write for LoopbackTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut pipe = self.outbound.lock();
        if pipe.closed {
            return Err(ErrorKind::BrokenPipe.into());
        }
        let n = buf.len().min(self.max_chunk.unwrap_or(usize::MAX));
        pipe.bytes.extend(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.close();
    }
}

type Backlog = Arc<Mutex<VecDeque<LoopbackTransport>>>;

/// Creates a connected acceptor/connector pair, the in-memory analogue of a listening socket.
#[must_use]
pub fn listener() -> (LoopbackAcceptor, LoopbackConnector) {
    let backlog: Backlog = Arc::default();
    (
        LoopbackAcceptor {
            backlog: Arc::clone(&backlog),
        },
        LoopbackConnector { backlog },
    )
}

/// Hands out the server ends of streams opened through its [`LoopbackConnector`].
#[derive(Debug)]
pub struct LoopbackAcceptor {
    backlog: Backlog,
}

impl StreamAcceptor for LoopbackAcceptor {
    fn accept_stream(&mut self) -> io::Result<Option<Box<dyn Transport>>> {
        Ok(self
            .backlog
            .lock()
            .pop_front()
            .map(|end| Box::new(end) as Box<dyn Transport>))
    }
}

/// Opens streams to a [`LoopbackAcceptor`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    backlog: Backlog,
}

impl LoopbackConnector {
    /// Opens a stream; the server end waits in the acceptor's backlog.
    #[must_use]
    pub fn connect(&self) -> LoopbackTransport {
        let (client, server) = LoopbackTransport::pair();
        self.backlog.lock().push_back(server);
        client
    }

    /// Like [`connect`](Self::connect), with both ends limited to `max_chunk` bytes per call.
    #[must_use]
    pub fn connect_with_max_chunk(&self, max_chunk: usize) -> LoopbackTransport {
        let (client, server) = LoopbackTransport::pair();
        self.backlog
            .lock()
            .push_back(server.with_max_chunk(max_chunk));
        client.with_max_chunk(max_chunk)
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn empty_read_would_block() {
        let (mut a, _b) = LoopbackTransport::pair();
        let err = a.read(&mut [0u8; 4]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn bytes_flow_both_ways() {
        let (mut a, mut b) = LoopbackTransport::pair();
        a.write_all(b"ping").unwrap();
        b.write_all(b"pong").unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn close_drains_then_eof() {
        let (mut a, b) = LoopbackTransport::pair();
        let mut b = b;
        b.write_all(b"xy").unwrap();
        b.close();
        let mut buf = [0u8; 8];
        assert_eq!(a.read(&mut buf).unwrap(), 2);
        assert_eq!(a.read(&mut buf).unwrap(), 0);
        assert_eq!(a.write(b"z").unwrap_err().kind(), ErrorKind::BrokenPipe);
        assert!(a.is_closed());
    }

    #[test]
    fn drop_closes() {
        let (mut a, b) = LoopbackTransport::pair();
        drop(b);
        assert_eq!(a.read(&mut [0u8; 1]).unwrap(), 0);
    }

    #[test]
    fn chunked_reads_yield_between_chunks() {
        let (a, b) = LoopbackTransport::pair();
        let (mut a, mut b) = (a, b.with_max_chunk(2));
        a.write_all(b"abcde").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).unwrap(), 2);
        assert_eq!(b.read(&mut buf).unwrap_err().kind(), ErrorKind::WouldBlock);
        assert_eq!(b.read(&mut buf).unwrap(), 2);
        assert_eq!(b.pending_bytes(), 1);
    }

    #[test]
    fn acceptor_hands_out_connected_streams() {
        let (mut acceptor, connector) = listener();
        assert!(acceptor.accept_stream().unwrap().is_none());
        let mut client = connector.connect();
        let mut server = acceptor.accept_stream().unwrap().unwrap();
        client.write_all(&[7]).unwrap();
        let mut buf = [0u8; 1];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [7]);
    }
}
