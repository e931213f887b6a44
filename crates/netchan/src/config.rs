use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Largest reliable message the current variant can carry (fragmented).
pub const MAX_MSGLEN: usize = 0x8000;

pub const MIN_PACKETLEN: usize = 512;
pub const MAX_PACKETLEN: usize = 4096;
pub const MAX_PACKETLEN_DEFAULT: usize = 1400;
pub const MAX_PACKETLEN_WRITABLE: usize = MAX_PACKETLEN - 10;

pub const PROTOCOL_VERSION_DEFAULT: u32 = 34;
pub const PROTOCOL_VERSION_R1Q2: u32 = 35;
pub const PROTOCOL_VERSION_Q2PRO: u32 = 36;

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(1000);

const DEFAULT_MAX_CHANNELS: usize = 32;
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Wire generation of a channel, fixed at setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variant {
    /// Single datagram reliable messages, qport on the client side.
    Legacy,
    /// Adds fragmentation of oversized reliable messages.
    Current,
}

/// Which end of the session this channel drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetSource {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub variant: Variant,
    pub source: NetSource,
    pub protocol: u32,
    pub qport: u16,
    pub max_packet_len: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            variant: Variant::Current,
            source: NetSource::Client,
            protocol: PROTOCOL_VERSION_Q2PRO,
            qport: 0,
            max_packet_len: MAX_PACKETLEN_DEFAULT,
        }
    }
}

impl ChannelConfig {
    pub fn legacy(source: NetSource, protocol: u32, qport: u16) -> Self {
        Self {
            variant: Variant::Legacy,
            source,
            protocol,
            qport,
            ..Default::default()
        }
    }

    pub fn current(source: NetSource) -> Self {
        Self {
            source,
            ..Default::default()
        }
    }

    pub fn with_max_packet_len(mut self, max_packet_len: usize) -> Self {
        self.max_packet_len = max_packet_len;
        self
    }

    /// Returns a copy with `max_packet_len` clamped to the writable range and
    /// the qport cut to the single byte legacy headers carry from r1q2 on.
    pub fn clamped(mut self) -> Self {
        self.max_packet_len = self
            .max_packet_len
            .clamp(MIN_PACKETLEN, MAX_PACKETLEN_WRITABLE);
        if self.variant == Variant::Legacy && self.protocol >= PROTOCOL_VERSION_R1Q2 {
            self.qport &= 0xFF;
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub max_channels: usize,
    pub timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_channels: DEFAULT_MAX_CHANNELS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl RegistryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
