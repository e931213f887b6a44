use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use netchan::{
    Channel, ChannelConfig, ChannelRegistry, DatagramSocket, NetSource, NetworkEndpoint,
    PROTOCOL_VERSION_DEFAULT, RegistryConfig,
};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(10, Ordering::SeqCst)
}

fn loopback(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

fn wait_for_datagrams(
    endpoint: &mut NetworkEndpoint,
    timeout_ms: u64,
) -> Option<Vec<(SocketAddr, Vec<u8>)>> {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        let received = endpoint.receive_all().unwrap();
        if !received.is_empty() {
            return Some(received);
        }
        thread::sleep(Duration::from_millis(1));
    }
    None
}

#[test]
fn test_empty_socket_returns_nothing() {
    let mut endpoint = NetworkEndpoint::bind(loopback(next_port())).unwrap();
    assert!(endpoint.recv_datagram().unwrap().is_none());
    assert!(endpoint.receive_all().unwrap().is_empty());
}

#[test]
fn test_runt_datagrams_filtered() {
    let port = next_port();
    let mut server = NetworkEndpoint::bind(loopback(port)).unwrap();
    let mut client = NetworkEndpoint::bind(loopback(port + 1)).unwrap();

    client.send_datagram(loopback(port), &[1, 2, 3]).unwrap();
    client.send_datagram(loopback(port), &[0u8; 8]).unwrap();

    let received = wait_for_datagrams(&mut server, 200).expect("No datagram received");
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, loopback(port + 1));
    assert_eq!(server.stats().runts, 1);
}

#[test]
fn test_reliable_exchange_through_registry() {
    let port = next_port();
    let server_addr = loopback(port);
    let client_addr = loopback(port + 1);

    let mut server_endpoint = NetworkEndpoint::bind(server_addr).unwrap();
    let mut client_endpoint = NetworkEndpoint::bind(client_addr).unwrap();

    let mut registry = ChannelRegistry::new(RegistryConfig::default());
    let id = registry
        .setup(client_addr, ChannelConfig::current(NetSource::Server))
        .unwrap();
    let mut client = Channel::setup(server_addr, ChannelConfig::current(NetSource::Client));

    client.queue_reliable(b"new").unwrap();
    client
        .transmit(&mut client_endpoint, b"clc_move", 1)
        .unwrap();

    let received = wait_for_datagrams(&mut server_endpoint, 200).expect("No datagram received");
    assert_eq!(received.len(), 1);
    let (from, datagram) = &received[0];
    let (routed, incoming) = registry.dispatch(*from, datagram).unwrap();
    assert_eq!(routed, id);
    assert_eq!(incoming.reliable.as_deref(), Some(&b"new"[..]));
    assert_eq!(incoming.unreliable, b"clc_move");

    let server_channel = registry.get_mut(id).unwrap();
    assert!(server_channel.should_update());
    server_channel.queue_reliable(b"serverdata").unwrap();
    server_channel
        .transmit(&mut server_endpoint, b"svc_frame", 1)
        .unwrap();

    let received = wait_for_datagrams(&mut client_endpoint, 200).expect("No datagram received");
    let incoming = client.process_incoming(&received[0].1).unwrap();
    assert_eq!(incoming.reliable.as_deref(), Some(&b"serverdata"[..]));
    assert_eq!(incoming.unreliable, b"svc_frame");
    assert!(client.queue_reliable(b"begin").is_ok());
}

#[test]
fn test_multiple_legacy_clients_share_server_socket() {
    let port = next_port();
    let server_addr = loopback(port);
    let mut server_endpoint = NetworkEndpoint::bind(server_addr).unwrap();
    let mut registry = ChannelRegistry::new(RegistryConfig::default());

    let mut clients = Vec::new();
    for i in 0..3u16 {
        let endpoint = NetworkEndpoint::bind(loopback(port + 1 + i)).unwrap();
        let qport = 1000 + i;
        registry
            .setup(
                endpoint.local_addr(),
                ChannelConfig::legacy(NetSource::Server, PROTOCOL_VERSION_DEFAULT, qport),
            )
            .unwrap();
        let channel = Channel::setup(
            server_addr,
            ChannelConfig::legacy(NetSource::Client, PROTOCOL_VERSION_DEFAULT, qport),
        );
        clients.push((endpoint, channel));
    }

    for (i, (endpoint, channel)) in clients.iter_mut().enumerate() {
        channel
            .queue_reliable(format!("userinfo {}", i).as_bytes())
            .unwrap();
        channel.transmit(endpoint, &[], 1).unwrap();
    }

    let mut messages = Vec::new();
    let start = Instant::now();
    while messages.len() < 3 && start.elapsed() < Duration::from_millis(500) {
        for (from, datagram) in server_endpoint.receive_all().unwrap() {
            let (id, incoming) = registry.dispatch(from, &datagram).unwrap();
            if let Some(message) = incoming.reliable {
                messages.push((id, String::from_utf8(message).unwrap()));
            }
        }
        thread::sleep(Duration::from_millis(1));
    }

    messages.sort();
    assert_eq!(messages.len(), 3);
    for (i, (id, text)) in messages.iter().enumerate() {
        assert_eq!(text, &format!("userinfo {}", i));
        assert_eq!(registry.get(*id).unwrap().qport(), 1000 + i as u16);
    }
}
