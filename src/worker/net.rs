//! Network kernel: TCP or UDP send/recv at a specified packet size.
//!
//! The TCP listener accepts exactly one connection and reuses it for the
//! worker's lifetime, rather than closing and re-accepting on every epoch.

use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::registry::{NetMode, Proto};

use super::{EpochResult, Kernel};

/// How many wrong-peer UDP datagrams may be discarded before an epoch gives
/// up.
pub const MAX_RECV_TRIES: u32 = 5;

const ACCEPT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

enum Endpoint {
    Tcp(TcpStream),
    Udp { socket: UdpSocket, peer: SocketAddr },
}

pub struct NetKernel {
    endpoint: Endpoint,
    mode: NetMode,
    pktsize: u64,
    bytes: u64,
    usecs: u64,
}

impl NetKernel {
    /// Binds the listening socket only; fast and synchronous, so a bad
    /// address/port surfaces to the caller immediately instead of after a
    /// thread is already spawned.
    pub fn bind_tcp(addr: IpAddr, port: u16) -> Result<TcpListener> {
        let listener = TcpListener::bind(SocketAddr::new(addr, port))?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    /// Blocks (checking `exiting` every [`ACCEPT_POLL_TIMEOUT`]) on an
    /// already-bound listener until exactly one TCP peer connects.
    fn accept_on(listener: &TcpListener, exiting: &AtomicBool) -> Result<TcpStream> {
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    return Ok(stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if exiting.load(Ordering::Relaxed) {
                        return Err(EngineError::Kernel(
                            "exiting before a TCP peer connected".to_string(),
                        ));
                    }
                    std::thread::sleep(ACCEPT_POLL_TIMEOUT);
                }
                Err(e) => return Err(EngineError::Io(e)),
            }
        }
    }

    /// Listens on `addr:port` and blocks until exactly one TCP peer
    /// connects, then drops the listener; the accepted stream is reused for
    /// the worker's whole lifetime. Binds and accepts in one call, so
    /// callers that can tolerate blocking on the accept (tests, the
    /// deferred-open path in a worker thread) can use this directly.
    pub fn new_tcp(
        addr: IpAddr,
        port: u16,
        mode: NetMode,
        pktsize: u64,
        exiting: &AtomicBool,
    ) -> Result<Self> {
        let listener = Self::bind_tcp(addr, port)?;
        Self::from_listener(&listener, mode, pktsize, exiting)
    }

    /// Finishes opening a TCP kernel against an already-bound listener:
    /// blocks (checking `exiting` every [`ACCEPT_POLL_TIMEOUT`]) until a
    /// peer connects. Splitting the bind out lets a caller validate the
    /// address/port synchronously and defer only the blocking accept.
    pub fn from_listener(
        listener: &TcpListener,
        mode: NetMode,
        pktsize: u64,
        exiting: &AtomicBool,
    ) -> Result<Self> {
        let stream = Self::accept_on(listener, exiting)?;
        stream.set_read_timeout(Some(ACCEPT_POLL_TIMEOUT))?;
        stream.set_write_timeout(Some(ACCEPT_POLL_TIMEOUT))?;
        Ok(NetKernel {
            endpoint: Endpoint::Tcp(stream),
            mode,
            pktsize,
            bytes: 0,
            usecs: 0,
        })
    }

    /// In read mode we bind to `addr:port` and listen for datagrams from
    /// that peer. In write mode we bind an ephemeral local port and send to
    /// `addr:port`. Both sides of a test are configured with the same
    /// `(addr, port)` pair, one in each mode.
    pub fn new_udp(addr: IpAddr, port: u16, mode: NetMode, pktsize: u64) -> Result<Self> {
        let (bind_addr, peer) = match mode {
            NetMode::Read => (SocketAddr::new(addr, port), SocketAddr::new(addr, port)),
            NetMode::Write => (SocketAddr::new(addr, 0), SocketAddr::new(addr, port)),
        };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_read_timeout(Some(ACCEPT_POLL_TIMEOUT))?;
        Ok(NetKernel {
            endpoint: Endpoint::Udp { socket, peer },
            mode,
            pktsize,
            bytes: 0,
            usecs: 0,
        })
    }

    pub fn open(proto: Proto, addr: IpAddr, port: u16, mode: NetMode, pktsize: u64, exiting: &AtomicBool) -> Result<Self> {
        match proto {
            Proto::Tcp => Self::new_tcp(addr, port, mode, pktsize, exiting),
            Proto::Udp => Self::new_udp(addr, port, mode, pktsize),
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn usecs(&self) -> u64 {
        self.usecs
    }

    fn one_op(&mut self) -> std::io::Result<bool> {
        let mut buf = vec![0u8; self.pktsize as usize];
        match &mut self.endpoint {
            Endpoint::Tcp(stream) => match self.mode {
                NetMode::Write => {
                    stream.write_all(&buf)?;
                    self.bytes += buf.len() as u64;
                    Ok(true)
                }
                NetMode::Read => {
                    stream.read_exact(&mut buf)?;
                    self.bytes += buf.len() as u64;
                    Ok(true)
                }
            },
            Endpoint::Udp { socket, peer } => match self.mode {
                NetMode::Write => {
                    socket.send_to(&buf, *peer)?;
                    self.bytes += buf.len() as u64;
                    Ok(true)
                }
                NetMode::Read => {
                    for _try in 0..MAX_RECV_TRIES {
                        match socket.recv_from(&mut buf) {
                            Ok((_n, from)) => {
                                if from == *peer {
                                    self.bytes += buf.len() as u64;
                                    return Ok(true);
                                }
                                // wrong peer: discard and retry this epoch.
                            }
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                                return Ok(false);
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    Ok(false)
                }
            },
        }
    }
}

impl Kernel for NetKernel {
    fn run_epoch(&mut self, units: u64, exiting: &AtomicBool) -> EpochResult {
        let mut done = 0u64;
        for _ in 0..units {
            if exiting.load(Ordering::Relaxed) {
                break;
            }
            let start = std::time::Instant::now();
            match self.one_op() {
                Ok(true) => {
                    done += 1;
                    self.usecs += start.elapsed().as_micros() as u64;
                }
                Ok(false) => {
                    // timed out / gave up this op; re-check exiting next loop
                    if exiting.load(Ordering::Relaxed) {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    tracing::warn!(error = %e, "network kernel I/O error");
                    break;
                }
            }
        }
        EpochResult {
            done,
            stalled: false,
        }
    }

    fn teardown(&mut self) {
        if let Endpoint::Tcp(stream) = &self.endpoint {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}
