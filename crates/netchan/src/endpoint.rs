use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::MAX_PACKETLEN;
use crate::wire::BASE_HEADER_LEN;

/// Where a channel hands its finished datagrams.
pub trait DatagramSocket {
    fn send_datagram(&mut self, addr: SocketAddr, datagram: &[u8]) -> io::Result<usize>;

    /// Returns the next queued datagram, or `None` when nothing is waiting.
    fn recv_datagram(&mut self) -> io::Result<Option<(SocketAddr, Vec<u8>)>>;
}

/// Counters for one socket, independent of the channels multiplexed on it.
#[derive(Debug, Clone, Default)]
pub struct SocketStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub runts: u64,
}

/// Non-blocking UDP socket shared by every channel on one side.
pub struct NetworkEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    stats: SocketStats,
    recv_buffer: Box<[u8; MAX_PACKETLEN]>,
    running: Arc<AtomicBool>,
}

impl NetworkEndpoint {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;
        log::debug!("netchan socket bound to {}", local_addr);

        Ok(Self {
            socket,
            local_addr,
            stats: SocketStats::default(),
            recv_buffer: Box::new([0u8; MAX_PACKETLEN]),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &SocketStats {
        &self.stats
    }

    /// Drains everything currently queued on the socket.
    pub fn receive_all(&mut self) -> io::Result<Vec<(SocketAddr, Vec<u8>)>> {
        let mut datagrams = Vec::new();
        while let Some(datagram) = self.recv_datagram()? {
            datagrams.push(datagram);
        }
        Ok(datagrams)
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl DatagramSocket for NetworkEndpoint {
    fn send_datagram(&mut self, addr: SocketAddr, datagram: &[u8]) -> io::Result<usize> {
        if datagram.len() > MAX_PACKETLEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "datagram exceeds MAX_PACKETLEN",
            ));
        }

        let bytes = self.socket.send_to(datagram, addr)?;

        self.stats.packets_sent += 1;
        self.stats.bytes_sent += bytes as u64;

        Ok(bytes)
    }

    fn recv_datagram(&mut self) -> io::Result<Option<(SocketAddr, Vec<u8>)>> {
        loop {
            match self.socket.recv_from(&mut self.recv_buffer[..]) {
                Ok((size, addr)) => {
                    if size < BASE_HEADER_LEN {
                        self.stats.runts += 1;
                        continue;
                    }

                    self.stats.packets_received += 1;
                    self.stats.bytes_received += size as u64;
                    return Ok(Some((addr, self.recv_buffer[..size].to_vec())));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }
}
