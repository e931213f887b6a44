use crate::config::{NetSource, PROTOCOL_VERSION_R1Q2};
use crate::error::Result;
use crate::sequence::LEGACY_SEQUENCE_MASK;

use super::{AckFlags, BASE_HEADER_LEN, HeaderCodec, PacketHeader, Reader, SequenceFlags, Writer};

/// Original header: 31-bit sequences, no fragmentation, and a qport written
/// by the client so the server can tell sessions behind one address apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyCodec {
    source: NetSource,
    protocol: u32,
    qport: u16,
}

impl LegacyCodec {
    pub fn new(source: NetSource, protocol: u32, qport: u16) -> Self {
        Self {
            source,
            protocol,
            qport,
        }
    }

    fn qport_len(&self) -> usize {
        if self.protocol < PROTOCOL_VERSION_R1Q2 {
            2
        } else if self.qport != 0 {
            1
        } else {
            0
        }
    }
}

impl HeaderCodec for LegacyCodec {
    fn sequence_mask(&self) -> u32 {
        LEGACY_SEQUENCE_MASK
    }

    fn header_len(&self) -> usize {
        match self.source {
            NetSource::Client => BASE_HEADER_LEN + self.qport_len(),
            NetSource::Server => BASE_HEADER_LEN,
        }
    }

    fn write_header(&self, writer: &mut Writer, header: &PacketHeader) {
        let mut sequence = header.sequence & LEGACY_SEQUENCE_MASK;
        if header.reliable {
            sequence |= SequenceFlags::RELIABLE.bits();
        }
        let mut ack = header.ack & LEGACY_SEQUENCE_MASK;
        if header.reliable_ack {
            ack |= AckFlags::RELIABLE_ACK.bits();
        }

        writer.write_u32(sequence);
        writer.write_u32(ack);

        if self.source == NetSource::Client {
            match self.qport_len() {
                2 => writer.write_u16(self.qport),
                1 => writer.write_u8(self.qport as u8),
                _ => {}
            }
        }
    }

    fn read_header(&self, reader: &mut Reader<'_>) -> Result<PacketHeader> {
        let sequence = reader.read_u32()?;
        let ack = reader.read_u32()?;

        let qport = if self.source == NetSource::Server {
            match self.qport_len() {
                2 => Some(reader.read_u16()?),
                1 => Some(reader.read_u8()? as u16),
                _ => None,
            }
        } else {
            None
        };

        Ok(PacketHeader {
            sequence: sequence & LEGACY_SEQUENCE_MASK,
            ack: ack & LEGACY_SEQUENCE_MASK,
            reliable: SequenceFlags::from_bits_retain(sequence).contains(SequenceFlags::RELIABLE),
            fragmented: false,
            reliable_ack: AckFlags::from_bits_retain(ack).contains(AckFlags::RELIABLE_ACK),
            qport,
        })
    }
}

/// Reads the qport a legacy client put after the base header, without
/// decoding anything else. Used to route datagrams whose source port changed.
pub fn peek_qport(datagram: &[u8], protocol: u32) -> Option<u16> {
    let mut reader = Reader::new(datagram);
    reader.read_bytes(BASE_HEADER_LEN).ok()?;
    if protocol < PROTOCOL_VERSION_R1Q2 {
        reader.read_u16().ok()
    } else {
        reader.read_u8().ok().map(u16::from)
    }
}
