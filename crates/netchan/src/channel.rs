use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::config::{ChannelConfig, KEEPALIVE_INTERVAL, MAX_MSGLEN, NetSource, Variant};
use crate::endpoint::DatagramSocket;
use crate::error::{NetchanError, Result};
use crate::fragment::FragmentAssembler;
use crate::reliable::{ReliableChunk, ReliableEngine, ReliableState};
use crate::sequence::SequenceLedger;
use crate::stats::ChannelStats;
use crate::wire::{BASE_HEADER_LEN, Codec, PacketHeader, Writer};

/// What a received datagram yielded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Incoming {
    /// False for duplicate, stale and runt datagrams; nothing else is set then.
    pub accepted: bool,
    /// A complete reliable message, delivered exactly once and in order.
    pub reliable: Option<Vec<u8>>,
    pub unreliable: Vec<u8>,
}

impl Incoming {
    fn rejected() -> Self {
        Self::default()
    }
}

/// One end of a point-to-point session carrying an unreliable stream and a
/// reliable stream over a datagram transport.
///
/// A channel is driven by a single owner: `compose_outgoing` once per network
/// tick and `process_incoming` for every datagram from the peer. After a
/// fatal error every call returns [`NetchanError::ChannelDead`] and the owner
/// is expected to close it.
#[derive(Debug)]
pub struct Channel {
    config: ChannelConfig,
    codec: Codec,
    remote_addr: SocketAddr,
    fatal_error: bool,
    ledger: SequenceLedger,
    reliable: ReliableEngine,
    assembler: FragmentAssembler,
    fragment_resync: bool,
    reliable_ack_pending: bool,
    dropped: u32,
    last_sent: Instant,
    last_received: Instant,
    stats: ChannelStats,
}

impl Channel {
    pub fn setup(remote_addr: SocketAddr, config: ChannelConfig) -> Self {
        let config = config.clamped();
        let codec = Codec::new(&config);

        let whole_capacity = codec.whole_capacity(config.max_packet_len);
        let max_message_len = match config.variant {
            Variant::Legacy => whole_capacity,
            Variant::Current => MAX_MSGLEN,
        };
        let reliable = ReliableEngine::new(
            config.variant,
            max_message_len,
            whole_capacity,
            codec.fragment_capacity(config.max_packet_len),
        );

        log::debug!(
            "netchan setup to {} ({:?}, protocol {}, qport {}, maxpacketlen {})",
            remote_addr,
            config.variant,
            config.protocol,
            config.qport,
            config.max_packet_len
        );

        let now = Instant::now();
        Self {
            codec,
            remote_addr,
            fatal_error: false,
            ledger: SequenceLedger::new(codec.sequence_mask()),
            reliable,
            assembler: FragmentAssembler::new(MAX_MSGLEN),
            fragment_resync: false,
            reliable_ack_pending: false,
            dropped: 0,
            last_sent: now,
            last_received: now,
            stats: ChannelStats::default(),
            config,
        }
    }

    /// Releases the channel, returning its final counters.
    pub fn close(self) -> ChannelStats {
        log::debug!(
            "netchan to {} closed after {} sent / {} received",
            self.remote_addr,
            self.stats.packets_sent,
            self.stats.packets_received
        );
        self.stats
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn variant(&self) -> Variant {
        self.config.variant
    }

    pub fn source(&self) -> NetSource {
        self.config.source
    }

    pub fn protocol(&self) -> u32 {
        self.config.protocol
    }

    pub fn qport(&self) -> u16 {
        self.config.qport
    }

    pub fn max_packet_len(&self) -> usize {
        self.config.max_packet_len
    }

    /// Largest reliable message `queue_reliable` accepts.
    pub fn max_message_len(&self) -> usize {
        self.reliable.max_message_len()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn set_remote_addr(&mut self, addr: SocketAddr) {
        self.remote_addr = addr;
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal_error
    }

    pub fn reliable_state(&self) -> ReliableState {
        self.reliable.state()
    }

    pub fn outgoing_sequence(&self) -> u32 {
        self.ledger.outgoing_sequence()
    }

    pub fn incoming_sequence(&self) -> u32 {
        self.ledger.incoming_sequence()
    }

    pub fn incoming_acknowledged(&self) -> u32 {
        self.ledger.incoming_acknowledged()
    }

    /// Datagrams lost just before the most recently accepted one.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    pub fn total_dropped(&self) -> u64 {
        self.stats.total_dropped
    }

    pub fn total_received(&self) -> u64 {
        self.stats.total_received
    }

    pub fn last_sent(&self) -> Instant {
        self.last_sent
    }

    pub fn last_received(&self) -> Instant {
        self.last_received
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_received.elapsed() > timeout
    }

    /// Stages reliable bytes for delivery. See [`ReliableEngine::queue_reliable`]
    /// for the per-variant policy. An oversized message kills the channel.
    pub fn queue_reliable(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_alive()?;
        match self.reliable.queue_reliable(data) {
            Err(err @ NetchanError::MessageTooLarge { .. }) => Err(self.fail(err)),
            other => other,
        }
    }

    /// Whether the owner should send a datagram now even with nothing
    /// unreliable to say.
    pub fn should_update(&self) -> bool {
        self.should_update_at(Instant::now())
    }

    pub fn should_update_at(&self, now: Instant) -> bool {
        self.reliable.has_staged()
            || self.reliable_ack_pending
            || self.reliable.fragment_mid_stream()
            || now.saturating_duration_since(self.last_sent) > KEEPALIVE_INTERVAL
    }

    /// Builds the next datagram: header, the pending reliable chunk if any,
    /// then as much of `unreliable` as fits. An unreliable payload that does
    /// not fit is dropped whole.
    pub fn compose_outgoing(&mut self, unreliable: &[u8]) -> Result<Vec<u8>> {
        self.ensure_alive()?;

        let max_packet_len = self.config.max_packet_len;
        let sequence = self.ledger.next_outgoing_sequence();
        let mut header = PacketHeader {
            sequence,
            ack: self.ledger.incoming_sequence(),
            reliable_ack: self.ledger.incoming_reliable_sequence(),
            ..Default::default()
        };

        let mut writer = Writer::with_capacity(max_packet_len);
        let chunk = self.reliable.on_transmit_opportunity(sequence);
        if let Some(chunk) = &chunk {
            header.reliable = true;
            header.fragmented = chunk.fragment.is_some();
        }
        self.codec.encode(&mut writer, &header, chunk.as_ref());
        let carried_reliable = chunk.is_some();

        if writer.len() + unreliable.len() <= max_packet_len {
            writer.write_bytes(unreliable);
        } else {
            log::warn!(
                "netchan to {}: dumped {} unreliable bytes",
                self.remote_addr,
                unreliable.len()
            );
            self.stats.unreliable_dumped += 1;
        }

        let datagram = writer.into_vec();

        self.reliable_ack_pending = false;
        self.last_sent = Instant::now();
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += datagram.len() as u64;
        if carried_reliable {
            self.stats.reliable_chunks_sent += 1;
        }

        Ok(datagram)
    }

    /// Composes one datagram and hands it to `socket` `numpackets` times. With
    /// zero copies the datagram is still composed and its sequence consumed.
    pub fn transmit<S: DatagramSocket + ?Sized>(
        &mut self,
        socket: &mut S,
        unreliable: &[u8],
        numpackets: usize,
    ) -> Result<usize> {
        let datagram = self.compose_outgoing(unreliable)?;
        let mut sent = 0;
        for _ in 0..numpackets {
            sent += socket.send_datagram(self.remote_addr, &datagram)?;
        }
        Ok(sent)
    }

    pub fn process_incoming(&mut self, datagram: &[u8]) -> Result<Incoming> {
        self.ensure_alive()?;

        if datagram.len() < BASE_HEADER_LEN {
            log::debug!(
                "netchan from {}: runt datagram of {} bytes",
                self.remote_addr,
                datagram.len()
            );
            self.stats.packets_rejected += 1;
            return Ok(Incoming::rejected());
        }

        let packet = match self.codec.decode(datagram) {
            Ok(packet) => packet,
            Err(err) => return Err(self.fail(err)),
        };

        let header = packet.header;
        let record = self.ledger.record_incoming(header.sequence, header.ack);
        if !record.accepted() {
            log::debug!(
                "netchan from {}: {} packet {} at {}",
                self.remote_addr,
                if record.is_duplicate {
                    "duplicate"
                } else {
                    "out of order"
                },
                header.sequence,
                self.ledger.incoming_sequence()
            );
            self.stats.packets_rejected += 1;
            return Ok(Incoming::rejected());
        }

        self.dropped = record.loss_count;
        if record.loss_count > 0 {
            log::debug!(
                "netchan from {}: dropped {} packets at {}",
                self.remote_addr,
                record.loss_count,
                header.sequence
            );
            if self.assembler.in_progress() {
                log::debug!("netchan from {}: abandoning partial fragment stream", self.remote_addr);
            }
            self.assembler.reset();
            self.fragment_resync = true;
        }

        self.last_received = Instant::now();
        self.stats.packets_received += 1;
        self.stats.bytes_received += datagram.len() as u64;
        self.stats.total_dropped += u64::from(record.loss_count);
        self.stats.total_received += u64::from(record.loss_count) + 1;

        self.ledger
            .set_incoming_reliable_acknowledged(header.reliable_ack);
        if self.reliable.on_ack_received(header.reliable_ack) {
            self.stats.reliable_acked += 1;
        }

        let reliable = match packet.reliable {
            Some(chunk) => self.accept_reliable(chunk)?,
            None => None,
        };
        if reliable.is_some() {
            self.stats.reliable_received += 1;
        }

        Ok(Incoming {
            accepted: true,
            reliable,
            unreliable: packet.unreliable.to_vec(),
        })
    }

    fn accept_reliable(&mut self, chunk: ReliableChunk<'_>) -> Result<Option<Vec<u8>>> {
        self.reliable_ack_pending = true;

        if self.ledger.is_stale_reliable(chunk.toggle) {
            return Ok(None);
        }

        let Some(info) = chunk.fragment else {
            self.ledger.accept_reliable(chunk.toggle);
            return Ok(Some(chunk.data.to_vec()));
        };

        if self.fragment_resync {
            if info.offset != 0 {
                log::debug!(
                    "netchan from {}: skipping fragment at {} until the stream restarts",
                    self.remote_addr,
                    info.offset
                );
                return Ok(None);
            }
            self.fragment_resync = false;
        }

        match self
            .assembler
            .on_fragment_received(info.offset, info.total_len, chunk.data, info.is_last)
        {
            Ok(Some(message)) => {
                self.ledger.accept_reliable(chunk.toggle);
                Ok(Some(message))
            }
            Ok(None) => Ok(None),
            Err(err) => Err(self.fail(err.into())),
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.fatal_error {
            return Err(NetchanError::ChannelDead(self.remote_addr));
        }
        Ok(())
    }

    fn fail(&mut self, err: NetchanError) -> NetchanError {
        log::error!("netchan to {}: {}", self.remote_addr, err);
        self.fatal_error = true;
        self.reliable.discard();
        self.assembler.reset();
        err
    }
}
