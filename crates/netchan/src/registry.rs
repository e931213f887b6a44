use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::channel::{Channel, Incoming};
use crate::config::{
    ChannelConfig, NetSource, PROTOCOL_VERSION_R1Q2, RegistryConfig, Variant,
};
use crate::error::{NetchanError, Result};
use crate::stats::ChannelStats;
use crate::wire::peek_qport;

/// Handle to a channel owned by a [`ChannelRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u32);

impl ChannelId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Owns every channel of one endpoint and routes incoming datagrams to them.
#[derive(Debug)]
pub struct ChannelRegistry {
    channels_by_addr: HashMap<SocketAddr, ChannelId>,
    channels: HashMap<ChannelId, Channel>,
    next_channel_id: u32,
    max_channels: usize,
    timeout: Duration,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl ChannelRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            channels_by_addr: HashMap::new(),
            channels: HashMap::new(),
            next_channel_id: 1,
            max_channels: config.max_channels,
            timeout: config.timeout(),
        }
    }

    /// Creates a fresh channel to `remote_addr`, replacing any channel already
    /// bound to that address.
    pub fn setup(&mut self, remote_addr: SocketAddr, config: ChannelConfig) -> Result<ChannelId> {
        if let Some(id) = self.channels_by_addr.get(&remote_addr).copied() {
            log::info!("replacing channel {} to {}", id, remote_addr);
            self.close(id);
        }

        if self.channels.len() >= self.max_channels {
            log::warn!("refusing channel to {}: registry full", remote_addr);
            return Err(NetchanError::RegistryFull);
        }

        let id = ChannelId(self.next_channel_id);
        self.next_channel_id += 1;

        self.channels.insert(id, Channel::setup(remote_addr, config));
        self.channels_by_addr.insert(remote_addr, id);

        log::info!("channel {} set up to {}", id, remote_addr);
        Ok(id)
    }

    /// Releases a channel. The handle is invalid afterwards.
    pub fn close(&mut self, id: ChannelId) -> Option<ChannelStats> {
        let channel = self.channels.remove(&id)?;
        self.channels_by_addr.remove(&channel.remote_addr());
        log::info!("channel {} to {} closed", id, channel.remote_addr());
        Some(channel.close())
    }

    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.channels.get_mut(&id)
    }

    pub fn id_by_addr(&self, addr: &SocketAddr) -> Option<ChannelId> {
        self.channels_by_addr.get(addr).copied()
    }

    pub fn get_by_addr(&self, addr: &SocketAddr) -> Option<&Channel> {
        self.channels_by_addr
            .get(addr)
            .and_then(|id| self.channels.get(id))
    }

    pub fn get_by_addr_mut(&mut self, addr: &SocketAddr) -> Option<&mut Channel> {
        if let Some(&id) = self.channels_by_addr.get(addr) {
            self.channels.get_mut(&id)
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChannelId, &Channel)> {
        self.channels.iter().map(|(&id, channel)| (id, channel))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ChannelId, &mut Channel)> {
        self.channels.iter_mut().map(|(&id, channel)| (id, channel))
    }

    /// Routes a datagram to its channel and processes it.
    ///
    /// Lookup is by exact address first. Legacy server-side channels also
    /// match on IP plus the qport the client wrote, which survives a NAT
    /// rewriting the source port; the channel is then rebound to the new
    /// address.
    pub fn dispatch(&mut self, from: SocketAddr, datagram: &[u8]) -> Result<(ChannelId, Incoming)> {
        let id = match self.id_by_addr(&from) {
            Some(id) => id,
            None => self
                .rebind_by_qport(from, datagram)
                .ok_or(NetchanError::UnknownChannel(from))?,
        };

        let channel = self
            .channels
            .get_mut(&id)
            .ok_or(NetchanError::UnknownChannel(from))?;
        let incoming = channel.process_incoming(datagram)?;
        Ok((id, incoming))
    }

    fn rebind_by_qport(&mut self, from: SocketAddr, datagram: &[u8]) -> Option<ChannelId> {
        let (id, old_addr) = self.channels.iter().find_map(|(&id, channel)| {
            let addr = channel.remote_addr();
            let candidate = channel.variant() == Variant::Legacy
                && channel.source() == NetSource::Server
                && addr.ip() == from.ip()
                && (channel.protocol() < PROTOCOL_VERSION_R1Q2 || channel.qport() != 0)
                && peek_qport(datagram, channel.protocol()) == Some(channel.qport());
            candidate.then_some((id, addr))
        })?;

        log::info!(
            "channel {}: remote port changed from {} to {}",
            id,
            old_addr.port(),
            from.port()
        );

        self.channels_by_addr.remove(&old_addr);
        self.channels_by_addr.insert(from, id);
        if let Some(channel) = self.channels.get_mut(&id) {
            channel.set_remote_addr(from);
        }
        Some(id)
    }

    /// Closes channels that have been silent longer than the configured
    /// timeout, returning their ids.
    pub fn cleanup_timed_out(&mut self) -> Vec<ChannelId> {
        let timed_out: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.is_timed_out(self.timeout))
            .map(|(&id, _)| id)
            .collect();

        for &id in &timed_out {
            log::info!("channel {} timed out", id);
            self.close(id);
        }

        timed_out
    }

    /// Closes every channel that hit a fatal error.
    pub fn reap_fatal(&mut self) -> Vec<(ChannelId, ChannelStats)> {
        let dead: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.is_fatal())
            .map(|(&id, _)| id)
            .collect();

        dead.into_iter()
            .filter_map(|id| self.close(id).map(|stats| (id, stats)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn max_channels(&self) -> usize {
        self.max_channels
    }
}
