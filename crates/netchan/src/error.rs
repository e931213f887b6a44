use std::io;
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    #[error("no fragment pending")]
    NoPendingFragment,
    #[error("fragment at offset {offset} without a message in progress")]
    NoMessageInProgress { offset: usize },
    #[error("out of sequence fragment: expected offset {expected}, got {offset}")]
    OutOfSequence { expected: usize, offset: usize },
    #[error("oversize fragmented message: {size} bytes exceeds {max}")]
    Oversize { size: usize, max: usize },
    #[error("fragment total length changed from {expected} to {total}")]
    LengthMismatch { expected: usize, total: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum NetchanError {
    #[error("reliable message still awaiting acknowledgment")]
    ReliableBusy,
    #[error("reliable message of {size} bytes exceeds {max}")]
    MessageTooLarge { size: usize, max: usize },
    #[error("malformed datagram: {0}")]
    Malformed(&'static str),
    #[error("fragmentation error: {0}")]
    Fragmentation(#[from] FragmentError),
    #[error("channel to {0} hit a fatal error")]
    ChannelDead(SocketAddr),
    #[error("channel registry full")]
    RegistryFull,
    #[error("no channel for {0}")]
    UnknownChannel(SocketAddr),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl NetchanError {
    /// Whether the error leaves the channel permanently unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MessageTooLarge { .. }
                | Self::Malformed(_)
                | Self::Fragmentation(_)
                | Self::ChannelDead(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, NetchanError>;
