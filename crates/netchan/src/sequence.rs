use crate::config::Variant;

/// 31-bit sequence space of the legacy header.
pub const LEGACY_SEQUENCE_MASK: u32 = 0x7FFF_FFFF;
/// 30-bit sequence space of the current header; bit 30 carries the fragment flag.
pub const CURRENT_SEQUENCE_MASK: u32 = 0x3FFF_FFFF;

/// Outcome of checking a received header against the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncomingRecord {
    pub is_duplicate: bool,
    pub is_out_of_order: bool,
    /// Datagrams presumed lost between the previous and this one.
    pub loss_count: u32,
}

impl IncomingRecord {
    pub fn accepted(&self) -> bool {
        !self.is_duplicate && !self.is_out_of_order
    }
}

/// Sequence counters for both directions of a channel, plus the incoming
/// half of the 1-bit reliable window.
#[derive(Debug, Clone)]
pub struct SequenceLedger {
    mask: u32,
    outgoing_sequence: u32,
    incoming_sequence: u32,
    incoming_acknowledged: u32,
    incoming_reliable_sequence: bool,
    incoming_reliable_acknowledged: bool,
}

impl SequenceLedger {
    pub fn new(mask: u32) -> Self {
        Self {
            mask,
            outgoing_sequence: 1,
            incoming_sequence: 0,
            incoming_acknowledged: 0,
            incoming_reliable_sequence: false,
            incoming_reliable_acknowledged: false,
        }
    }

    pub fn for_variant(variant: Variant) -> Self {
        match variant {
            Variant::Legacy => Self::new(LEGACY_SEQUENCE_MASK),
            Variant::Current => Self::new(CURRENT_SEQUENCE_MASK),
        }
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Issues the sequence for the next outgoing datagram. The value is
    /// confined to the mask so it never spills into the flag bits.
    pub fn next_outgoing_sequence(&mut self) -> u32 {
        let sequence = self.outgoing_sequence & self.mask;
        self.outgoing_sequence = self.outgoing_sequence.wrapping_add(1) & self.mask;
        sequence
    }

    /// Sequence the next call to `next_outgoing_sequence` will return.
    pub fn outgoing_sequence(&self) -> u32 {
        self.outgoing_sequence
    }

    /// Validates a received header. Stale and duplicate datagrams leave the
    /// ledger untouched.
    pub fn record_incoming(&mut self, sequence: u32, ack: u32) -> IncomingRecord {
        let sequence = sequence & self.mask;

        if sequence <= self.incoming_sequence {
            return IncomingRecord {
                is_duplicate: sequence == self.incoming_sequence,
                is_out_of_order: sequence < self.incoming_sequence,
                loss_count: 0,
            };
        }

        let loss_count = sequence - self.incoming_sequence - 1;
        self.incoming_sequence = sequence;
        self.incoming_acknowledged = ack & self.mask;

        IncomingRecord {
            is_duplicate: false,
            is_out_of_order: false,
            loss_count,
        }
    }

    pub fn incoming_sequence(&self) -> u32 {
        self.incoming_sequence
    }

    pub fn incoming_acknowledged(&self) -> u32 {
        self.incoming_acknowledged
    }

    /// Bit of the last reliable message accepted from the peer. Echoed back in
    /// every outgoing ack word.
    pub fn incoming_reliable_sequence(&self) -> bool {
        self.incoming_reliable_sequence
    }

    pub fn incoming_reliable_acknowledged(&self) -> bool {
        self.incoming_reliable_acknowledged
    }

    pub fn set_incoming_reliable_acknowledged(&mut self, ack_bit: bool) {
        self.incoming_reliable_acknowledged = ack_bit;
    }

    /// Whether a reliable chunk tagged with `toggle` was already processed.
    pub fn is_stale_reliable(&self, toggle: bool) -> bool {
        toggle == self.incoming_reliable_sequence
    }

    /// Accepts a reliable message tagged with `toggle`, flipping the window.
    /// Returns false for a retransmission of the message already processed.
    pub fn accept_reliable(&mut self, toggle: bool) -> bool {
        if self.is_stale_reliable(toggle) {
            return false;
        }
        self.incoming_reliable_sequence = toggle;
        true
    }
}
