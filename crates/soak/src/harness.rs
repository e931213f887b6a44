use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Result, ensure};

use netchan::stats::rand_u64;
use netchan::{
    Channel, ChannelConfig, ChannelId, ChannelRegistry, ChannelStats, DatagramSocket, NetSource,
    NetchanError, NetworkEndpoint, NetworkSimulator, PROTOCOL_VERSION_R1Q2, RegistryConfig,
    ReliableState,
};

use crate::config::SoakConfig;
use crate::events::{Direction, SoakEvent};

const STREAM_HEADER_LEN: usize = 8;

/// A UDP socket whose outgoing datagrams cross a simulated lossy link first.
struct LossySocket {
    endpoint: NetworkEndpoint,
    simulator: NetworkSimulator,
}

impl LossySocket {
    fn bind(addr: &str) -> io::Result<Self> {
        Ok(Self {
            endpoint: NetworkEndpoint::bind(addr)?,
            simulator: NetworkSimulator::new(),
        })
    }

    fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    /// Puts every datagram whose simulated delay elapsed on the wire.
    fn flush(&mut self) -> io::Result<()> {
        for (datagram, addr) in self.simulator.take_ready() {
            self.endpoint.send_datagram(addr, &datagram)?;
        }
        Ok(())
    }
}

impl DatagramSocket for LossySocket {
    fn send_datagram(&mut self, addr: SocketAddr, datagram: &[u8]) -> io::Result<usize> {
        self.simulator.enqueue(datagram.to_vec(), addr);
        Ok(datagram.len())
    }

    fn recv_datagram(&mut self) -> io::Result<Option<(SocketAddr, Vec<u8>)>> {
        self.endpoint.recv_datagram()
    }
}

/// Progress of one reliable stream.
#[derive(Debug, Default, Clone, Copy)]
struct Stream {
    queued: u32,
    delivered: u32,
}

impl Stream {
    /// Checks `message` is the next one expected on stream `id`.
    fn deliver(&mut self, id: u32, message: &[u8], size: usize) -> Result<(), String> {
        let expected = message_payload(id, self.delivered, size);
        if message != expected.as_slice() {
            return Err(describe_mismatch(message, &expected));
        }
        self.delivered += 1;
        Ok(())
    }
}

struct SoakClient {
    index: usize,
    socket: LossySocket,
    channel: Channel,
    server_channel: ChannelId,
    upstream: Stream,
    downstream: Stream,
    unreliable_received: u64,
    failed: bool,
}

impl SoakClient {
    fn stream_id(&self, direction: Direction) -> u32 {
        let base = self.index as u32 * 2;
        match direction {
            Direction::ClientToServer => base,
            Direction::ServerToClient => base + 1,
        }
    }

    fn transmit(&mut self, config: &SoakConfig, usercmd: &[u8]) -> netchan::Result<()> {
        if self.upstream.queued < config.messages
            && self.channel.reliable_state() == ReliableState::Idle
        {
            let payload = message_payload(
                self.stream_id(Direction::ClientToServer),
                self.upstream.queued,
                config.message_size,
            );
            self.channel.queue_reliable(&payload)?;
            self.upstream.queued += 1;
        }

        self.channel
            .transmit(&mut self.socket, usercmd, config.redundancy)?;
        Ok(())
    }

    fn is_done(&self, messages: u32) -> bool {
        self.upstream.delivered == messages && self.downstream.delivered == messages
    }
}

/// Drives a set of client channels against a server registry over loopback
/// UDP and checks both reliable streams of every channel arrive intact.
pub struct SoakHarness {
    server: LossySocket,
    registry: ChannelRegistry,
    clients: Vec<SoakClient>,
    channel_owner: HashMap<ChannelId, usize>,
    config: SoakConfig,
    tick: u64,
    tick_duration: Duration,
    last_tick_time: Instant,
    accumulator: Duration,
    running: Arc<AtomicBool>,
    start_time: Instant,
    finished: Option<Duration>,
    pending_events: VecDeque<SoakEvent>,
}

impl SoakHarness {
    pub fn new(config: SoakConfig) -> Result<Self> {
        ensure!(config.clients > 0, "at least one client is required");
        ensure!(config.tick_rate > 0, "tick rate must be positive");
        ensure!(
            config.message_size >= STREAM_HEADER_LEN,
            "message size must be at least {} bytes",
            STREAM_HEADER_LEN
        );

        let mut server = LossySocket::bind("127.0.0.1:0")?;
        let server_addr = server.local_addr();
        let mut registry = ChannelRegistry::new(RegistryConfig {
            max_channels: config.clients,
            ..Default::default()
        });

        let mut clients = Vec::with_capacity(config.clients);
        let mut channel_owner = HashMap::new();
        let mut pending_events = VecDeque::new();

        for index in 0..config.clients {
            let mut socket = LossySocket::bind("127.0.0.1:0")?;
            let client_addr = socket.local_addr();

            if let Some(sim) = &config.packet_loss {
                socket.simulator.set_config(server_addr, sim.clone());
                server.simulator.set_config(client_addr, sim.clone());
            }

            let qport = make_qport(config.protocol);
            let channel_config = ChannelConfig {
                variant: config.variant,
                source: NetSource::Client,
                protocol: config.protocol,
                qport,
                max_packet_len: config.max_packet_len,
            };

            let channel = Channel::setup(server_addr, channel_config);
            let server_channel = registry.setup(
                client_addr,
                ChannelConfig {
                    source: NetSource::Server,
                    ..channel_config
                },
            )?;

            let limit = registry
                .get(server_channel)
                .map_or(0, |c| c.max_message_len())
                .min(channel.max_message_len());
            ensure!(
                config.message_size <= limit,
                "message size {} exceeds the {} byte reliable limit of a {:?} channel",
                config.message_size,
                limit,
                config.variant
            );

            pending_events.push_back(SoakEvent::ChannelOpened {
                client: index,
                channel: server_channel,
                addr: client_addr,
            });
            channel_owner.insert(server_channel, index);
            clients.push(SoakClient {
                index,
                socket,
                channel,
                server_channel,
                upstream: Stream::default(),
                downstream: Stream::default(),
                unreliable_received: 0,
                failed: false,
            });
        }

        let tick_duration = Duration::from_secs_f64(1.0 / config.tick_rate as f64);

        Ok(Self {
            server,
            registry,
            clients,
            channel_owner,
            tick: 0,
            tick_duration,
            last_tick_time: Instant::now(),
            accumulator: Duration::ZERO,
            running: Arc::new(AtomicBool::new(true)),
            start_time: Instant::now(),
            finished: None,
            pending_events,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = SoakEvent> + '_ {
        self.pending_events.drain(..)
    }

    pub fn run(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            self.tick_once();
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn tick_once(&mut self) {
        let now = Instant::now();
        let delta = now - self.last_tick_time;
        self.last_tick_time = now;
        self.accumulator += delta;

        if let Err(e) = self.process_network() {
            self.pending_events.push_back(SoakEvent::Error {
                message: format!("Network error: {}", e),
            });
        }

        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            self.tick();
        }

        let messages = self.config.messages;
        let elapsed = self.start_time.elapsed();
        if self.clients.iter().all(|c| c.is_done(messages)) {
            self.finished = Some(elapsed);
            self.pending_events.push_back(SoakEvent::Finished { elapsed });
            self.running.store(false, Ordering::SeqCst);
        } else if self.clients.iter().any(|c| c.failed) {
            self.running.store(false, Ordering::SeqCst);
        } else if elapsed > Duration::from_secs(self.config.max_duration_secs) {
            self.pending_events.push_back(SoakEvent::Error {
                message: format!("gave up after {:.1}s", elapsed.as_secs_f32()),
            });
            self.running.store(false, Ordering::SeqCst);
        }
    }

    fn tick(&mut self) {
        self.tick += 1;
        let usercmd = self.tick.to_le_bytes();
        let frame = vec![self.tick as u8; self.config.unreliable_size];

        for client in self.clients.iter_mut().filter(|c| !c.failed) {
            if let Err(e) = client.transmit(&self.config, &usercmd) {
                client.failed |= e.is_fatal();
                self.pending_events.push_back(SoakEvent::ChannelFailed {
                    client: client.index,
                    reason: format!("client side: {}", e),
                });
            }
        }

        for (id, channel) in self.registry.iter_mut() {
            let Some(client) = self
                .channel_owner
                .get(&id)
                .and_then(|&index| self.clients.get_mut(index))
            else {
                continue;
            };
            if client.failed || channel.is_fatal() {
                continue;
            }

            if client.downstream.queued < self.config.messages
                && channel.reliable_state() == ReliableState::Idle
            {
                let payload = message_payload(
                    client.stream_id(Direction::ServerToClient),
                    client.downstream.queued,
                    self.config.message_size,
                );
                if let Err(e) = channel.queue_reliable(&payload) {
                    self.pending_events.push_back(SoakEvent::ChannelFailed {
                        client: client.index,
                        reason: format!("server side: {}", e),
                    });
                    continue;
                }
                client.downstream.queued += 1;
            }

            if let Err(e) = channel.transmit(&mut self.server, &frame, self.config.redundancy) {
                self.pending_events.push_back(SoakEvent::ChannelFailed {
                    client: client.index,
                    reason: format!("server side: {}", e),
                });
            }
        }
    }

    fn process_network(&mut self) -> io::Result<()> {
        self.server.flush()?;
        for client in &mut self.clients {
            client.socket.flush()?;
        }

        let size = self.config.message_size;
        let messages = self.config.messages;

        for (from, datagram) in self.server.endpoint.receive_all()? {
            let (id, incoming) = match self.registry.dispatch(from, &datagram) {
                Ok(routed) => routed,
                Err(NetchanError::UnknownChannel(addr)) => {
                    log::debug!("datagram from unknown address {}", addr);
                    continue;
                }
                Err(e) => {
                    let owner = self
                        .registry
                        .id_by_addr(&from)
                        .and_then(|id| self.channel_owner.get(&id).copied());
                    if let Some(client) = owner.and_then(|index| self.clients.get_mut(index)) {
                        client.failed = true;
                        self.pending_events.push_back(SoakEvent::ChannelFailed {
                            client: client.index,
                            reason: format!("server side: {}", e),
                        });
                    }
                    continue;
                }
            };

            let Some(message) = incoming.reliable else {
                continue;
            };
            let Some(client) = self
                .channel_owner
                .get(&id)
                .and_then(|&index| self.clients.get_mut(index))
            else {
                continue;
            };

            let stream_id = client.stream_id(Direction::ClientToServer);
            let expected = client.upstream.delivered;
            match client.upstream.deliver(stream_id, &message, size) {
                Ok(()) if client.upstream.delivered == messages => {
                    self.pending_events.push_back(SoakEvent::StreamComplete {
                        client: client.index,
                        direction: Direction::ClientToServer,
                    });
                }
                Ok(()) => {}
                Err(reason) => {
                    client.failed = true;
                    self.pending_events.push_back(SoakEvent::Corrupted {
                        client: client.index,
                        direction: Direction::ClientToServer,
                        expected,
                        reason,
                    });
                }
            }
        }

        for client in self.clients.iter_mut().filter(|c| !c.failed) {
            for (_, datagram) in client.socket.endpoint.receive_all()? {
                let incoming = match client.channel.process_incoming(&datagram) {
                    Ok(incoming) => incoming,
                    Err(e) => {
                        client.failed = true;
                        self.pending_events.push_back(SoakEvent::ChannelFailed {
                            client: client.index,
                            reason: format!("client side: {}", e),
                        });
                        break;
                    }
                };

                if !incoming.unreliable.is_empty() {
                    client.unreliable_received += 1;
                }
                let Some(message) = incoming.reliable else {
                    continue;
                };

                let stream_id = client.stream_id(Direction::ServerToClient);
                let expected = client.downstream.delivered;
                match client.downstream.deliver(stream_id, &message, size) {
                    Ok(()) if client.downstream.delivered == messages => {
                        self.pending_events.push_back(SoakEvent::StreamComplete {
                            client: client.index,
                            direction: Direction::ServerToClient,
                        });
                    }
                    Ok(()) => {}
                    Err(reason) => {
                        client.failed = true;
                        self.pending_events.push_back(SoakEvent::Corrupted {
                            client: client.index,
                            direction: Direction::ServerToClient,
                            expected,
                            reason,
                        });
                        break;
                    }
                }
            }
        }

        for (id, stats) in self.registry.reap_fatal() {
            log::warn!(
                "reaped failed channel {} after {} datagrams",
                id,
                stats.packets_received
            );
        }
        for channel in self.registry.cleanup_timed_out() {
            self.pending_events
                .push_back(SoakEvent::ChannelTimedOut { channel });
        }

        Ok(())
    }

    pub fn report(&self) -> SoakReport {
        let clients = self
            .clients
            .iter()
            .map(|c| ClientReport {
                index: c.index,
                addr: c.socket.local_addr(),
                delivered_up: c.upstream.delivered,
                delivered_down: c.downstream.delivered,
                unreliable_received: c.unreliable_received,
                client_stats: c.channel.stats().clone(),
                server_stats: self.registry.get(c.server_channel).map(|s| s.stats().clone()),
                failed: c.failed,
            })
            .collect::<Vec<_>>();

        SoakReport {
            passed: self.finished.is_some() && clients.iter().all(|c| !c.failed),
            elapsed: self.finished.unwrap_or_else(|| self.start_time.elapsed()),
            ticks: self.tick,
            messages: self.config.messages,
            clients,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientReport {
    pub index: usize,
    pub addr: SocketAddr,
    pub delivered_up: u32,
    pub delivered_down: u32,
    pub unreliable_received: u64,
    pub client_stats: ChannelStats,
    pub server_stats: Option<ChannelStats>,
    pub failed: bool,
}

#[derive(Debug, Clone)]
pub struct SoakReport {
    pub passed: bool,
    pub elapsed: Duration,
    pub ticks: u64,
    pub messages: u32,
    pub clients: Vec<ClientReport>,
}

/// Deterministic body of message `index` on stream `stream`: both ids up
/// front, then filler derived from them.
pub fn message_payload(stream: u32, index: u32, size: usize) -> Vec<u8> {
    let mut payload = Vec::with_capacity(size.max(STREAM_HEADER_LEN));
    payload.extend_from_slice(&stream.to_le_bytes());
    payload.extend_from_slice(&index.to_le_bytes());

    let seed = stream.wrapping_mul(131).wrapping_add(index.wrapping_mul(31));
    payload.extend((STREAM_HEADER_LEN..size).map(|i| seed.wrapping_add(i as u32) as u8));
    payload
}

fn describe_mismatch(message: &[u8], expected: &[u8]) -> String {
    if message.len() != expected.len() {
        return format!("length {} instead of {}", message.len(), expected.len());
    }
    if message[..STREAM_HEADER_LEN] != expected[..STREAM_HEADER_LEN] {
        let mut index = [0u8; 4];
        index.copy_from_slice(&message[4..STREAM_HEADER_LEN]);
        return format!("got message {}", u32::from_le_bytes(index));
    }
    let at = message
        .iter()
        .zip(expected)
        .position(|(a, b)| a != b)
        .unwrap_or(0);
    format!("payload differs at byte {}", at)
}

fn make_qport(protocol: u32) -> u16 {
    let random = rand_u64();
    if protocol >= PROTOCOL_VERSION_R1Q2 {
        (random % 255 + 1) as u16
    } else {
        random as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netchan::{PROTOCOL_VERSION_DEFAULT, Variant};

    #[test]
    fn test_stream_accepts_in_order_only() {
        let mut stream = Stream::default();
        assert!(stream.deliver(3, &message_payload(3, 0, 64), 64).is_ok());

        let err = stream
            .deliver(3, &message_payload(3, 2, 64), 64)
            .unwrap_err();
        assert_eq!(err, "got message 2");
        assert_eq!(stream.delivered, 1);

        let mut corrupted = message_payload(3, 1, 64);
        corrupted[40] ^= 0xFF;
        assert_eq!(
            stream.deliver(3, &corrupted, 64).unwrap_err(),
            "payload differs at byte 40"
        );
    }

    #[test]
    fn test_qport_fits_header() {
        for _ in 0..16 {
            let qport = make_qport(PROTOCOL_VERSION_R1Q2);
            assert!((1..=255).contains(&qport));
        }
    }

    #[test]
    fn test_rejects_oversize_legacy_messages() {
        let config = SoakConfig {
            variant: Variant::Legacy,
            protocol: PROTOCOL_VERSION_DEFAULT,
            clients: 1,
            message_size: 4000,
            ..Default::default()
        };
        assert!(SoakHarness::new(config).is_err());
    }

    #[test]
    fn test_short_soak_over_loopback() {
        let config = SoakConfig {
            clients: 2,
            messages: 5,
            message_size: 3000,
            tick_rate: 500,
            max_duration_secs: 10,
            ..Default::default()
        };
        let mut harness = SoakHarness::new(config).unwrap();
        harness.run();

        let report = harness.report();
        assert!(report.passed, "{:?}", report);
        for client in &report.clients {
            assert_eq!(client.delivered_up, 5);
            assert_eq!(client.delivered_down, 5);
        }
    }
}
