//! Outgoing half of the reliable stream.
//!
//! At most one reliable message is in flight at a time. It rides every
//! outgoing datagram until the peer echoes its toggle bit back, so delivery
//! over a lossy link needs no retransmit timer.

use crate::config::Variant;
use crate::error::{NetchanError, Result};
use crate::fragment::{Fragment, FragmentSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReliableState {
    Idle,
    PendingSend,
    AwaitingAck,
}

/// Placement of a fragment inside its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentInfo {
    pub offset: usize,
    pub total_len: usize,
    pub is_last: bool,
}

/// Reliable bytes to embed in the datagram being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliableChunk<'a> {
    pub toggle: bool,
    pub data: &'a [u8],
    pub fragment: Option<FragmentInfo>,
}

#[derive(Debug)]
enum Outstanding {
    None,
    Whole(Vec<u8>),
    Fragmented(FragmentSender),
}

#[derive(Debug)]
pub struct ReliableEngine {
    variant: Variant,
    staged: Vec<u8>,
    outstanding: Outstanding,
    reliable_sequence: bool,
    last_reliable_sequence: u32,
    max_message_len: usize,
    whole_capacity: usize,
    fragment_capacity: usize,
}

impl ReliableEngine {
    /// `whole_capacity` is the largest message sent unfragmented in one
    /// datagram; `fragment_capacity` the largest fragment chunk.
    pub fn new(
        variant: Variant,
        max_message_len: usize,
        whole_capacity: usize,
        fragment_capacity: usize,
    ) -> Self {
        Self {
            variant,
            staged: Vec::new(),
            outstanding: Outstanding::None,
            reliable_sequence: false,
            last_reliable_sequence: 0,
            max_message_len,
            whole_capacity,
            fragment_capacity,
        }
    }

    pub fn state(&self) -> ReliableState {
        match self.outstanding {
            Outstanding::None if self.staged.is_empty() => ReliableState::Idle,
            Outstanding::None => ReliableState::PendingSend,
            _ => ReliableState::AwaitingAck,
        }
    }

    pub fn max_message_len(&self) -> usize {
        self.max_message_len
    }

    /// Toggle bit of the most recently sent reliable message.
    pub fn reliable_sequence(&self) -> bool {
        self.reliable_sequence
    }

    /// Outgoing sequence of the last datagram that carried reliable data.
    pub fn last_reliable_sequence(&self) -> u32 {
        self.last_reliable_sequence
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    pub fn has_staged(&self) -> bool {
        !self.staged.is_empty()
    }

    pub fn is_fragmenting(&self) -> bool {
        matches!(self.outstanding, Outstanding::Fragmented(_))
    }

    /// True while a fragment stream is partway through its first pass or a
    /// retransmission pass.
    pub fn fragment_mid_stream(&self) -> bool {
        match &self.outstanding {
            Outstanding::Fragmented(sender) => sender.is_mid_stream(),
            _ => false,
        }
    }

    /// Stages reliable bytes for the next transmit opportunity.
    ///
    /// Legacy channels replace whatever is staged; the in-flight copy is never
    /// touched. Current channels append to the staged buffer and refuse while
    /// a message awaits acknowledgment.
    pub fn queue_reliable(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        match self.variant {
            Variant::Legacy => {
                if data.len() > self.max_message_len {
                    return Err(NetchanError::MessageTooLarge {
                        size: data.len(),
                        max: self.max_message_len,
                    });
                }
                if !self.staged.is_empty() {
                    log::debug!("overwriting {} staged reliable bytes", self.staged.len());
                }
                self.staged.clear();
                self.staged.extend_from_slice(data);
            }
            Variant::Current => {
                if self.state() == ReliableState::AwaitingAck {
                    return Err(NetchanError::ReliableBusy);
                }
                let size = self.staged.len() + data.len();
                if size > self.max_message_len {
                    return Err(NetchanError::MessageTooLarge {
                        size,
                        max: self.max_message_len,
                    });
                }
                self.staged.extend_from_slice(data);
            }
        }

        Ok(())
    }

    /// Called once per outgoing datagram with that datagram's sequence.
    /// Promotes staged data to in flight when nothing is outstanding, then
    /// returns the chunk (or next fragment) to embed.
    pub fn on_transmit_opportunity(&mut self, sequence: u32) -> Option<ReliableChunk<'_>> {
        if matches!(self.outstanding, Outstanding::None) {
            if self.staged.is_empty() {
                return None;
            }

            let message = std::mem::take(&mut self.staged);
            self.reliable_sequence = !self.reliable_sequence;

            self.outstanding = if self.variant == Variant::Current
                && message.len() > self.whole_capacity
            {
                let mut sender = FragmentSender::new();
                sender.begin_send(message);
                Outstanding::Fragmented(sender)
            } else {
                Outstanding::Whole(message)
            };
        }

        self.last_reliable_sequence = sequence;
        let toggle = self.reliable_sequence;

        match &mut self.outstanding {
            Outstanding::None => None,
            Outstanding::Whole(message) => Some(ReliableChunk {
                toggle,
                data: message.as_slice(),
                fragment: None,
            }),
            Outstanding::Fragmented(sender) => {
                if !sender.is_pending() {
                    sender.rewind();
                }
                let Fragment {
                    offset,
                    total_len,
                    data,
                    is_last,
                } = sender.next_fragment(self.fragment_capacity).ok()?;
                Some(ReliableChunk {
                    toggle,
                    data,
                    fragment: Some(FragmentInfo {
                        offset,
                        total_len,
                        is_last,
                    }),
                })
            }
        }
    }

    /// Applies the ack bit echoed by the peer. Returns true when this
    /// acknowledged the outstanding message.
    pub fn on_ack_received(&mut self, ack_bit: bool) -> bool {
        if matches!(self.outstanding, Outstanding::None) || ack_bit != self.reliable_sequence {
            return false;
        }
        self.outstanding = Outstanding::None;
        true
    }

    /// Drops everything, leaving the engine idle.
    pub fn discard(&mut self) {
        self.staged.clear();
        self.outstanding = Outstanding::None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(variant: Variant) -> ReliableEngine {
        ReliableEngine::new(variant, 32768, 1000, 1000)
    }

    #[test]
    fn test_state_transitions() {
        let mut engine = engine(Variant::Current);
        assert_eq!(engine.state(), ReliableState::Idle);

        engine.queue_reliable(b"hello").unwrap();
        assert_eq!(engine.state(), ReliableState::PendingSend);

        let chunk = engine.on_transmit_opportunity(1).unwrap();
        assert!(chunk.toggle);
        assert_eq!(chunk.data, b"hello");
        assert_eq!(engine.state(), ReliableState::AwaitingAck);

        assert!(!engine.on_ack_received(false));
        assert_eq!(engine.state(), ReliableState::AwaitingAck);

        assert!(engine.on_ack_received(true));
        assert_eq!(engine.state(), ReliableState::Idle);
    }

    #[test]
    fn test_retransmits_until_acked() {
        let mut engine = engine(Variant::Legacy);
        engine.queue_reliable(b"config").unwrap();

        for sequence in 1..5 {
            let chunk = engine.on_transmit_opportunity(sequence).unwrap();
            assert_eq!(chunk.data, b"config");
            assert!(chunk.toggle);
        }
        assert_eq!(engine.last_reliable_sequence(), 4);

        engine.on_ack_received(true);
        assert!(engine.on_transmit_opportunity(5).is_none());
    }

    #[test]
    fn test_current_refuses_while_awaiting_ack() {
        let mut engine = engine(Variant::Current);
        engine.queue_reliable(b"first").unwrap();
        engine.on_transmit_opportunity(1);

        assert!(matches!(
            engine.queue_reliable(b"second"),
            Err(NetchanError::ReliableBusy)
        ));
        assert_eq!(engine.on_transmit_opportunity(2).unwrap().data, b"first");
    }

    #[test]
    fn test_current_appends_while_pending() {
        let mut engine = engine(Variant::Current);
        engine.queue_reliable(b"ab").unwrap();
        engine.queue_reliable(b"cd").unwrap();

        assert_eq!(engine.on_transmit_opportunity(1).unwrap().data, b"abcd");
    }

    #[test]
    fn test_legacy_overwrites_pending() {
        let mut engine = engine(Variant::Legacy);
        engine.queue_reliable(b"stale").unwrap();
        engine.queue_reliable(b"fresh").unwrap();

        assert_eq!(engine.on_transmit_opportunity(1).unwrap().data, b"fresh");
    }

    #[test]
    fn test_legacy_never_touches_in_flight() {
        let mut engine = engine(Variant::Legacy);
        engine.queue_reliable(b"in-flight").unwrap();
        engine.on_transmit_opportunity(1);

        engine.queue_reliable(b"next").unwrap();
        engine.queue_reliable(b"newest").unwrap();
        assert_eq!(engine.state(), ReliableState::AwaitingAck);
        assert_eq!(engine.on_transmit_opportunity(2).unwrap().data, b"in-flight");

        assert!(engine.on_ack_received(true));
        assert_eq!(engine.state(), ReliableState::PendingSend);

        let chunk = engine.on_transmit_opportunity(3).unwrap();
        assert_eq!(chunk.data, b"newest");
        assert!(!chunk.toggle);
    }

    #[test]
    fn test_ack_is_idempotent() {
        let mut engine = engine(Variant::Current);
        engine.queue_reliable(b"x").unwrap();
        engine.on_transmit_opportunity(1);

        assert!(engine.on_ack_received(true));
        assert!(!engine.on_ack_received(true));
        assert!(!engine.on_ack_received(true));
        assert_eq!(engine.state(), ReliableState::Idle);
        assert!(engine.reliable_sequence());
    }

    #[test]
    fn test_legacy_rejects_oversize() {
        let mut engine = ReliableEngine::new(Variant::Legacy, 100, 100, 100);
        assert!(matches!(
            engine.queue_reliable(&[0u8; 101]),
            Err(NetchanError::MessageTooLarge { size: 101, max: 100 })
        ));
    }

    #[test]
    fn test_fragments_cycle_until_acked() {
        let mut engine = engine(Variant::Current);
        engine.queue_reliable(&[7u8; 2500]).unwrap();

        let mut offsets = Vec::new();
        for sequence in 1..=5 {
            let chunk = engine.on_transmit_opportunity(sequence).unwrap();
            let info = chunk.fragment.unwrap();
            assert_eq!(info.total_len, 2500);
            offsets.push((info.offset, chunk.data.len(), info.is_last));
        }

        assert_eq!(
            offsets,
            vec![
                (0, 1000, false),
                (1000, 1000, false),
                (2000, 500, true),
                (0, 1000, false),
                (1000, 1000, false),
            ]
        );

        assert!(engine.on_ack_received(true));
        assert!(!engine.is_fragmenting());
    }

    #[test]
    fn test_small_message_not_fragmented() {
        let mut engine = engine(Variant::Current);
        engine.queue_reliable(&[1u8; 1000]).unwrap();
        assert!(engine.on_transmit_opportunity(1).unwrap().fragment.is_none());
    }
}
