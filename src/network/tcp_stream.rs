use std::io::{self, ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use tracing::{debug, info};
use web_time::Duration;

use crate::{StreamAcceptor, Transport};

/// A non-blocking TCP stream to one peer.
///
/// Nagle's algorithm is disabled: netplay sends one small message per tick and
/// every millisecond of latency counts against the delay depth.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Connects to the first reachable address of `addr`, waiting at most `timeout`
    /// per address, then switches the stream to non-blocking mode.
    pub fn connect<A: ToSocketAddrs>(addr: A, timeout: Duration) -> Result<Self, io::Error> {
        let mut last_error = None;
        for candidate in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(stream) => {
                    info!("Connected to {}", candidate);
                    return Self::from_stream(stream);
                },
                Err(e) => {
                    debug!("Connecting to {} failed: {}", candidate, e);
                    last_error = Some(e);
                },
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(ErrorKind::AddrNotAvailable, "address resolved to nothing")
        }))
    }

    /// Wraps an already connected stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self, io::Error> {
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        Ok(Self { stream })
    }

    /// The address of the other end.
    pub fn peer_addr(&self) -> Result<SocketAddr, io::Error> {
        self.stream.peer_addr()
    }
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

/// A non-blocking TCP listener. Listens to 0.0.0.0 on a given port.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Binds to 0.0.0.0:port and sets the listener to non-blocking mode. Port 0 picks a free port.
    pub fn bind(port: u16) -> Result<Self, io::Error> {
        Self::bind_addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    /// Binds to a specific address.
    pub fn bind_addr(addr: SocketAddr) -> Result<Self, io::Error> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!("Listening for netplay connections on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    /// The bound address, useful after binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.listener.local_addr()
    }
}

impl StreamAcceptor for TcpAcceptor {
    fn accept_stream(&mut self) -> io::Result<Option<Box<dyn Transport>>> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                debug!("Accepted TCP connection from {}", addr);
                Ok(Some(Box::new(TcpTransport::from_stream(stream)?)))
            },
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
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
    use web_time::Instant;

    fn accept_within(acceptor: &mut TcpAcceptor, timeout: Duration) -> Box<dyn Transport> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(stream) = acceptor.accept_stream().unwrap() {
                return stream;
            }
            assert!(Instant::now() < deadline, "no connection accepted");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn nothing_pending_is_none() {
        let mut acceptor = TcpAcceptor::bind_addr("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(acceptor.accept_stream().unwrap().is_none());
    }

    #[test]
    fn connect_and_exchange_bytes() {
        let mut acceptor = TcpAcceptor::bind_addr("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = acceptor.local_addr().unwrap();
        let mut client = TcpTransport::connect(addr, Duration::from_secs(2)).unwrap();
        assert_eq!(client.peer_addr().unwrap(), addr);
        let mut server = accept_within(&mut acceptor, Duration::from_secs(2));

        client.write_all(b"lockstep").unwrap();
        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut buf = [0u8; 16];
        while received.len() < 8 && Instant::now() < deadline {
            match server.read(&mut buf) {
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1));
                },
                Err(e) => panic!("read failed: {e}"),
            }
        }
        assert_eq!(received, b"lockstep");
    }
}
