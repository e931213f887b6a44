use std::net::SocketAddr;
use std::time::Duration;

use netchan::ChannelId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToServer => "client->server",
            Direction::ServerToClient => "server->client",
        }
    }
}

#[derive(Debug, Clone)]
pub enum SoakEvent {
    ChannelOpened {
        client: usize,
        channel: ChannelId,
        addr: SocketAddr,
    },
    StreamComplete {
        client: usize,
        direction: Direction,
    },
    Corrupted {
        client: usize,
        direction: Direction,
        expected: u32,
        reason: String,
    },
    ChannelFailed {
        client: usize,
        reason: String,
    },
    ChannelTimedOut {
        channel: ChannelId,
    },
    Finished {
        elapsed: Duration,
    },
    Error {
        message: String,
    },
}
