//! Datagram layout for both channel generations.
//!
//! ```text
//! +---------------------------------------------------------------+
//! | sequence (u32 LE)  bit 31 RELIABLE, bit 30 FRAGMENT (current)  |
//! +---------------------------------------------------------------+
//! | ack (u32 LE)       bit 31 RELIABLE_ACK                         |
//! +---------------------------------------------------------------+
//! | qport (legacy, client side only: u16 before r1q2, else u8)     |
//! +---------------------------------------------------------------+
//! | fragment offset | MORE (u16)  |  fragment total length (u16)   |  FRAGMENT only
//! +---------------------------------------------------------------+
//! | reliable length | TOGGLE (u16) |  reliable bytes ...           |  RELIABLE only
//! +---------------------------------------------------------------+
//! | unreliable bytes ...                                           |
//! +---------------------------------------------------------------+
//! ```

mod buf;
mod current;
mod legacy;

pub use buf::{Reader, Writer};
pub use current::CurrentCodec;
pub use legacy::{LegacyCodec, peek_qport};

use bitflags::bitflags;

use crate::config::{ChannelConfig, Variant};
use crate::error::{NetchanError, Result};
use crate::reliable::{FragmentInfo, ReliableChunk};

/// Sequence and ack words.
pub const BASE_HEADER_LEN: usize = 8;
pub const RELIABLE_BLOCK_LEN: usize = 2;
pub const FRAGMENT_BLOCK_LEN: usize = 4;

const LENGTH_MASK: u16 = 0x7FFF;
const MORE_FRAGMENTS: u16 = 0x8000;
const RELIABLE_TOGGLE: u16 = 0x8000;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SequenceFlags: u32 {
        const RELIABLE = 1 << 31;
        const FRAGMENT = 1 << 30;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AckFlags: u32 {
        const RELIABLE_ACK = 1 << 31;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub sequence: u32,
    pub ack: u32,
    pub reliable: bool,
    pub fragmented: bool,
    pub reliable_ack: bool,
    pub qport: Option<u16>,
}

/// A decoded datagram borrowing from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedPacket<'a> {
    pub header: PacketHeader,
    pub reliable: Option<ReliableChunk<'a>>,
    pub unreliable: &'a [u8],
}

/// Per-generation header layout.
pub trait HeaderCodec {
    fn sequence_mask(&self) -> u32;

    /// Bytes of header this side writes before the reliable block.
    fn header_len(&self) -> usize;

    fn write_header(&self, writer: &mut Writer, header: &PacketHeader);

    fn read_header(&self, reader: &mut Reader<'_>) -> Result<PacketHeader>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Legacy(LegacyCodec),
    Current(CurrentCodec),
}

impl Codec {
    pub fn new(config: &ChannelConfig) -> Self {
        match config.variant {
            Variant::Legacy => Self::Legacy(LegacyCodec::new(
                config.source,
                config.protocol,
                config.qport,
            )),
            Variant::Current => Self::Current(CurrentCodec),
        }
    }

    pub fn variant(&self) -> Variant {
        match self {
            Self::Legacy(_) => Variant::Legacy,
            Self::Current(_) => Variant::Current,
        }
    }

    fn inner(&self) -> &dyn HeaderCodec {
        match self {
            Self::Legacy(codec) => codec,
            Self::Current(codec) => codec,
        }
    }

    pub fn sequence_mask(&self) -> u32 {
        self.inner().sequence_mask()
    }

    pub fn header_len(&self) -> usize {
        self.inner().header_len()
    }

    /// Largest reliable message that fits one datagram unfragmented.
    pub fn whole_capacity(&self, max_packet_len: usize) -> usize {
        max_packet_len.saturating_sub(self.header_len() + RELIABLE_BLOCK_LEN)
    }

    /// Largest fragment chunk, or zero when the generation cannot fragment.
    pub fn fragment_capacity(&self, max_packet_len: usize) -> usize {
        match self {
            Self::Legacy(_) => 0,
            Self::Current(_) => max_packet_len
                .saturating_sub(self.header_len() + FRAGMENT_BLOCK_LEN + RELIABLE_BLOCK_LEN),
        }
    }

    /// Writes header and reliable block. The unreliable payload is appended
    /// by the caller once it knows how much room is left.
    pub fn encode(
        &self,
        writer: &mut Writer,
        header: &PacketHeader,
        reliable: Option<&ReliableChunk<'_>>,
    ) {
        self.inner().write_header(writer, header);

        let Some(chunk) = reliable else {
            return;
        };

        if let Some(info) = chunk.fragment {
            let mut offset = info.offset as u16 & LENGTH_MASK;
            if !info.is_last {
                offset |= MORE_FRAGMENTS;
            }
            writer.write_u16(offset);
            writer.write_u16(info.total_len as u16);
        }

        let mut len = chunk.data.len() as u16 & LENGTH_MASK;
        if chunk.toggle {
            len |= RELIABLE_TOGGLE;
        }
        writer.write_u16(len);
        writer.write_bytes(chunk.data);
    }

    pub fn decode<'a>(&self, datagram: &'a [u8]) -> Result<DecodedPacket<'a>> {
        let mut reader = Reader::new(datagram);
        let header = self.inner().read_header(&mut reader)?;

        let reliable = if header.reliable {
            let fragment = if header.fragmented {
                let offset = reader.read_u16()?;
                let total_len = reader.read_u16()? as usize;
                Some(FragmentInfo {
                    offset: (offset & LENGTH_MASK) as usize,
                    total_len,
                    is_last: offset & MORE_FRAGMENTS == 0,
                })
            } else {
                None
            };

            let len = reader.read_u16()?;
            let data = reader
                .read_bytes((len & LENGTH_MASK) as usize)
                .map_err(|_| NetchanError::Malformed("reliable length exceeds datagram"))?;

            Some(ReliableChunk {
                toggle: len & RELIABLE_TOGGLE != 0,
                data,
                fragment,
            })
        } else {
            None
        };

        Ok(DecodedPacket {
            header,
            reliable,
            unreliable: reader.remaining(),
        })
    }
}
