//! Blocking TCP transport
//!
//! One reader thread per connection decodes replies and hands them to the
//! engine; writes happen on the submitting thread through a buffered writer.
//! Closing goes through a separate handle on the socket so it never waits
//! behind a write stuck on a peer that stopped reading.

use std::io::{self, BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::transport::{ConnectTarget, Connector, Transport, TransportEvents};
use crate::utils::{ConnectionError, RespDecoder};

const BUFFER_SIZE: usize = 65536;

/// Connector producing [`TcpTransport`]s
#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }

    fn resolve(target: &ConnectTarget) -> Result<SocketAddr, ConnectionError> {
        if let Some(addr) = target.resolved {
            return Ok(addr);
        }
        let address = target.address.to_string();
        (target.address.host.as_str(), target.address.port)
            .to_socket_addrs()
            .map_err(|e| ConnectionError::connect_failed(&address, e))?
            .next()
            .ok_or_else(|| {
                ConnectionError::connect_failed(
                    &address,
                    io::Error::new(io::ErrorKind::NotFound, "No addresses found"),
                )
            })
    }
}

impl Connector for TcpConnector {
    fn connect(
        &self,
        target: &ConnectTarget,
        events: Arc<dyn TransportEvents>,
    ) -> Result<Box<dyn Transport>, ConnectionError> {
        let address = target.address.to_string();
        let addr = Self::resolve(target)?;

        let stream = TcpStream::connect_timeout(&addr, target.timeout)
            .map_err(|e| ConnectionError::connect_failed(&address, e))?;

        // Disable Nagle's algorithm
        stream.set_nodelay(true).ok();
        if target.write_timeout > Duration::ZERO {
            stream.set_write_timeout(Some(target.write_timeout)).ok();
        }

        let read_half = stream
            .try_clone()
            .map_err(|e| ConnectionError::connect_failed(&address, e))?;
        let control = stream
            .try_clone()
            .map_err(|e| ConnectionError::connect_failed(&address, e))?;

        let closed = Arc::new(AtomicBool::new(false));
        let reader_closed = Arc::clone(&closed);
        let reader_address = address.clone();

        thread::Builder::new()
            .name(format!("mux-read-{}", address))
            .spawn(move || read_loop(read_half, reader_address, events, reader_closed))
            .map_err(|e| ConnectionError::connect_failed(&address, e))?;

        Ok(Box::new(TcpTransport {
            writer: Mutex::new(BufWriter::with_capacity(BUFFER_SIZE, stream)),
            control,
            peer: addr,
            address,
            closed,
        }))
    }
}

fn read_loop(
    stream: TcpStream,
    address: String,
    events: Arc<dyn TransportEvents>,
    closed: Arc<AtomicBool>,
) {
    let mut decoder = RespDecoder::new(BufReader::with_capacity(BUFFER_SIZE, stream));
    loop {
        match decoder.decode() {
            Ok(reply) => events.on_reply(reply),
            Err(e) => {
                if closed.load(Ordering::Acquire) {
                    debug!("Reader for {} stopped after close", address);
                } else {
                    events.on_error(ConnectionError::SocketFailure {
                        address: address.clone(),
                        reason: e.to_string(),
                    });
                }
                return;
            }
        }
    }
}

/// Write half of a TCP connection
pub struct TcpTransport {
    writer: Mutex<BufWriter<TcpStream>>,
    /// Same socket, used only for shutdown
    control: TcpStream,
    peer: SocketAddr,
    address: String,
    closed: Arc<AtomicBool>,
}

impl Transport for TcpTransport {
    fn send(&self, bytes: &[u8]) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed);
        }
        let mut writer = self.writer.lock();
        writer
            .write_all(bytes)
            .and_then(|_| writer.flush())
            .map_err(|e| ConnectionError::SocketFailure {
                address: self.address.clone(),
                reason: e.to_string(),
            })
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // fails any write blocked under the writer lock
            self.control.shutdown(Shutdown::Both).ok();
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}
