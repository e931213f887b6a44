use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;

use netchan::{
    Channel, ChannelConfig, DatagramSocket, NetSource, NetchanError, PROTOCOL_VERSION_R1Q2,
    ReliableState,
};

/// One direction of an in-memory link that drops the datagrams `drop` selects
/// by their send index.
struct Link {
    queue: VecDeque<(SocketAddr, Vec<u8>)>,
    sent: usize,
    dropped: usize,
    drop: Box<dyn Fn(usize) -> bool>,
}

impl Link {
    fn perfect() -> Self {
        Self::dropping(|_| false)
    }

    fn dropping(drop: impl Fn(usize) -> bool + 'static) -> Self {
        Self {
            queue: VecDeque::new(),
            sent: 0,
            dropped: 0,
            drop: Box::new(drop),
        }
    }

    fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).map(|(_, datagram)| datagram).collect()
    }
}

impl DatagramSocket for Link {
    fn send_datagram(&mut self, addr: SocketAddr, datagram: &[u8]) -> io::Result<usize> {
        let index = self.sent;
        self.sent += 1;
        if (self.drop)(index) {
            self.dropped += 1;
        } else {
            self.queue.push_back((addr, datagram.to_vec()));
        }
        Ok(datagram.len())
    }

    fn recv_datagram(&mut self) -> io::Result<Option<(SocketAddr, Vec<u8>)>> {
        Ok(self.queue.pop_front())
    }
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn channels(client: ChannelConfig, server: ChannelConfig) -> (Channel, Channel) {
    (
        Channel::setup(addr(27910), client),
        Channel::setup(addr(50000), server),
    )
}

fn current_channels(max_packet_len: usize) -> (Channel, Channel) {
    channels(
        ChannelConfig::current(NetSource::Client).with_max_packet_len(max_packet_len),
        ChannelConfig::current(NetSource::Server).with_max_packet_len(max_packet_len),
    )
}

/// Delivers whatever is queued on `link` to `channel`, collecting reliable
/// messages in arrival order.
fn pump(link: &mut Link, channel: &mut Channel, delivered: &mut Vec<Vec<u8>>) {
    for datagram in link.drain() {
        let incoming = channel.process_incoming(&datagram).unwrap();
        delivered.extend(incoming.reliable);
    }
}

#[test]
fn test_reliable_stream_survives_loss_in_order() {
    let (mut client, mut server) = current_channels(1400);
    let mut upstream = Link::dropping(|n| n % 3 == 1);
    let mut downstream = Link::dropping(|n| n % 4 == 2);

    let messages: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; 10 + i as usize * 7]).collect();
    let mut next = 0;
    let mut delivered = Vec::new();
    let mut ignored = Vec::new();

    for _ in 0..1000 {
        if next < messages.len() && client.reliable_state() != ReliableState::AwaitingAck {
            client.queue_reliable(&messages[next]).unwrap();
            next += 1;
        }

        client.transmit(&mut upstream, b"usercmd", 1).unwrap();
        pump(&mut upstream, &mut server, &mut delivered);

        server.transmit(&mut downstream, b"snapshot", 1).unwrap();
        pump(&mut downstream, &mut client, &mut ignored);

        if delivered.len() == messages.len() && client.reliable_state() == ReliableState::Idle {
            break;
        }
    }

    assert_eq!(delivered, messages);
    assert!(ignored.is_empty());
    assert!(upstream.dropped > 0);
    assert!(server.total_dropped() > 0);
    assert!(!client.is_fatal());
    assert!(!server.is_fatal());
}

#[test]
fn test_fragmented_message_over_lossy_link() {
    let (mut client, mut server) = current_channels(1214);
    let mut upstream = Link::dropping(|n| n == 3 || n == 12);
    let mut downstream = Link::perfect();

    let message: Vec<u8> = (0..9000u32).map(|i| (i * 31 % 251) as u8).collect();
    client.queue_reliable(&message).unwrap();

    let mut delivered = Vec::new();
    let mut ignored = Vec::new();
    for _ in 0..64 {
        client.transmit(&mut upstream, &[], 1).unwrap();
        pump(&mut upstream, &mut server, &mut delivered);

        server.transmit(&mut downstream, &[], 1).unwrap();
        pump(&mut downstream, &mut client, &mut ignored);

        if client.reliable_state() == ReliableState::Idle {
            break;
        }
    }

    assert_eq!(delivered, vec![message]);
    assert_eq!(client.reliable_state(), ReliableState::Idle);
    assert_eq!(server.total_dropped(), 2);
}

#[test]
fn test_every_fragment_fits_the_packet_limit() {
    let (mut client, _) = current_channels(600);
    client.queue_reliable(&vec![7u8; 5000]).unwrap();

    for _ in 0..20 {
        let datagram = client.compose_outgoing(&[1u8; 64]).unwrap();
        assert!(datagram.len() <= client.max_packet_len());
    }
}

#[test]
fn test_legacy_overwrites_staged_message() {
    let (mut client, mut server) = channels(
        ChannelConfig::legacy(NetSource::Client, PROTOCOL_VERSION_R1Q2, 77),
        ChannelConfig::legacy(NetSource::Server, PROTOCOL_VERSION_R1Q2, 77),
    );
    let mut upstream = Link::perfect();
    let mut downstream = Link::perfect();
    let mut delivered = Vec::new();
    let mut ignored = Vec::new();

    client.queue_reliable(b"first").unwrap();
    client.queue_reliable(b"second").unwrap();
    client.transmit(&mut upstream, &[], 1).unwrap();
    pump(&mut upstream, &mut server, &mut delivered);

    // Staged behind the in-flight "second"; only the last one survives.
    client.queue_reliable(b"third").unwrap();
    client.queue_reliable(b"fourth").unwrap();
    client.transmit(&mut upstream, &[], 1).unwrap();
    pump(&mut upstream, &mut server, &mut delivered);

    server.transmit(&mut downstream, &[], 1).unwrap();
    pump(&mut downstream, &mut client, &mut ignored);
    assert_eq!(client.reliable_state(), ReliableState::PendingSend);

    client.transmit(&mut upstream, &[], 1).unwrap();
    pump(&mut upstream, &mut server, &mut delivered);

    assert_eq!(delivered, vec![b"second".to_vec(), b"fourth".to_vec()]);
}

#[test]
fn test_redundant_copies_deliver_once() {
    let (mut client, mut server) = current_channels(1400);
    let mut upstream = Link::perfect();
    let mut delivered = Vec::new();

    client.queue_reliable(b"precache").unwrap();
    let sent = client.transmit(&mut upstream, b"cmd", 3).unwrap();
    assert_eq!(upstream.queue.len(), 3);
    assert_eq!(sent % 3, 0);

    let mut accepted = 0;
    for datagram in upstream.drain() {
        let incoming = server.process_incoming(&datagram).unwrap();
        if incoming.accepted {
            accepted += 1;
        }
        delivered.extend(incoming.reliable);
    }

    assert_eq!(accepted, 1);
    assert_eq!(delivered, vec![b"precache".to_vec()]);
    assert_eq!(server.stats().packets_rejected, 2);
}

#[test]
fn test_reordered_datagram_is_ignored() {
    let (mut client, mut server) = current_channels(1400);
    let older = client.compose_outgoing(b"old").unwrap();
    let newer = client.compose_outgoing(b"new").unwrap();

    let incoming = server.process_incoming(&newer).unwrap();
    assert_eq!(incoming.unreliable, b"new");
    assert_eq!(server.dropped(), 1);

    let late = server.process_incoming(&older).unwrap();
    assert!(!late.accepted);
    assert_eq!(server.incoming_sequence(), 2);
}

#[test]
fn test_fatal_channel_stays_dead() {
    let (mut client, mut server) = current_channels(1400);

    let mut garbage = (1u32 | 1 << 31).to_le_bytes().to_vec();
    garbage.extend_from_slice(&0u32.to_le_bytes());
    garbage.extend_from_slice(&0x7FFFu16.to_le_bytes());

    let err = server.process_incoming(&garbage).unwrap_err();
    assert!(err.is_fatal());
    assert!(server.is_fatal());

    let valid = client.compose_outgoing(b"late").unwrap();
    assert!(matches!(
        server.process_incoming(&valid),
        Err(NetchanError::ChannelDead(_))
    ));
    assert!(matches!(
        server.queue_reliable(b"bye"),
        Err(NetchanError::ChannelDead(_))
    ));
}
