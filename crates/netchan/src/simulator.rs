use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::stats::PacketLossSimulation;

#[derive(Debug)]
struct DelayedDatagram {
    release_time: Instant,
    order: u64,
    datagram: Vec<u8>,
    addr: SocketAddr,
}

impl PartialEq for DelayedDatagram {
    fn eq(&self, other: &Self) -> bool {
        self.release_time == other.release_time && self.order == other.order
    }
}

impl Eq for DelayedDatagram {}

impl PartialOrd for DelayedDatagram {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedDatagram {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap
        other
            .release_time
            .cmp(&self.release_time)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// Lossy link in front of a socket: drops, delays and reorders datagrams per
/// destination address according to its [`PacketLossSimulation`].
#[derive(Debug, Default)]
pub struct NetworkSimulator {
    configs: HashMap<SocketAddr, PacketLossSimulation>,
    queue: BinaryHeap<DelayedDatagram>,
    next_order: u64,
    dropped: u64,
}

impl NetworkSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_config(&mut self, addr: SocketAddr, config: PacketLossSimulation) {
        if config.enabled {
            self.configs.insert(addr, config);
        } else {
            self.configs.remove(&addr);
        }
    }

    pub fn get_config(&self, addr: &SocketAddr) -> Option<&PacketLossSimulation> {
        self.configs.get(addr)
    }

    pub fn should_drop(&self, addr: &SocketAddr) -> bool {
        self.configs.get(addr).is_some_and(|sim| sim.should_drop())
    }

    pub fn delay_for(&self, addr: &SocketAddr) -> Duration {
        self.configs.get(addr).map_or(Duration::ZERO, |sim| {
            Duration::from_millis(sim.delay_ms() as u64)
        })
    }

    /// Datagrams discarded so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Queues a datagram bound for `addr`, or drops it.
    pub fn enqueue(&mut self, datagram: Vec<u8>, addr: SocketAddr) {
        self.enqueue_at(datagram, addr, Instant::now());
    }

    pub fn enqueue_at(&mut self, datagram: Vec<u8>, addr: SocketAddr, now: Instant) {
        if self.should_drop(&addr) {
            log::trace!("simulator dropped {} bytes to {}", datagram.len(), addr);
            self.dropped += 1;
            return;
        }

        let order = self.next_order;
        self.next_order += 1;
        self.queue.push(DelayedDatagram {
            release_time: now + self.delay_for(&addr),
            order,
            datagram,
            addr,
        });
    }

    /// Datagrams whose delay has elapsed, earliest first.
    pub fn take_ready(&mut self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.take_ready_at(Instant::now())
    }

    pub fn take_ready_at(&mut self, now: Instant) -> Vec<(Vec<u8>, SocketAddr)> {
        let mut ready = Vec::new();
        while self
            .queue
            .peek()
            .is_some_and(|delayed| delayed.release_time <= now)
        {
            if let Some(delayed) = self.queue.pop() {
                ready.push((delayed.datagram, delayed.addr));
            }
        }
        ready
    }
}
