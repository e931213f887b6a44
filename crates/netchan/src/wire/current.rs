use crate::error::{NetchanError, Result};
use crate::sequence::CURRENT_SEQUENCE_MASK;

use super::{AckFlags, BASE_HEADER_LEN, HeaderCodec, PacketHeader, Reader, SequenceFlags, Writer};

/// Header with a fragment flag carved out of the sequence word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentCodec;

impl HeaderCodec for CurrentCodec {
    fn sequence_mask(&self) -> u32 {
        CURRENT_SEQUENCE_MASK
    }

    fn header_len(&self) -> usize {
        BASE_HEADER_LEN
    }

    fn write_header(&self, writer: &mut Writer, header: &PacketHeader) {
        let mut flags = SequenceFlags::empty();
        flags.set(SequenceFlags::RELIABLE, header.reliable);
        flags.set(SequenceFlags::FRAGMENT, header.fragmented);

        let mut ack = header.ack & CURRENT_SEQUENCE_MASK;
        if header.reliable_ack {
            ack |= AckFlags::RELIABLE_ACK.bits();
        }

        writer.write_u32((header.sequence & CURRENT_SEQUENCE_MASK) | flags.bits());
        writer.write_u32(ack);
    }

    fn read_header(&self, reader: &mut Reader<'_>) -> Result<PacketHeader> {
        let sequence = reader.read_u32()?;
        let ack = reader.read_u32()?;

        let flags = SequenceFlags::from_bits_truncate(sequence);
        if flags.contains(SequenceFlags::FRAGMENT) && !flags.contains(SequenceFlags::RELIABLE) {
            return Err(NetchanError::Malformed("fragment bit without reliable bit"));
        }
        if ack & !(CURRENT_SEQUENCE_MASK | AckFlags::RELIABLE_ACK.bits()) != 0 {
            return Err(NetchanError::Malformed("reserved ack bit set"));
        }

        Ok(PacketHeader {
            sequence: sequence & CURRENT_SEQUENCE_MASK,
            ack: ack & CURRENT_SEQUENCE_MASK,
            reliable: flags.contains(SequenceFlags::RELIABLE),
            fragmented: flags.contains(SequenceFlags::FRAGMENT),
            reliable_ack: AckFlags::from_bits_retain(ack).contains(AckFlags::RELIABLE_ACK),
            qport: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_ack_bit_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&(1u32 << 30).to_le_bytes());

        let mut reader = Reader::new(&bytes);
        assert!(matches!(
            CurrentCodec.read_header(&mut reader),
            Err(NetchanError::Malformed(_))
        ));
    }

    #[test]
    fn test_flags_roundtrip() {
        let header = PacketHeader {
            sequence: CURRENT_SEQUENCE_MASK,
            ack: 12,
            reliable: true,
            fragmented: true,
            reliable_ack: false,
            qport: None,
        };
        let mut writer = Writer::with_capacity(8);
        CurrentCodec.write_header(&mut writer, &header);
        let bytes = writer.into_vec();

        let decoded = CurrentCodec.read_header(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(decoded, header);
    }
}
