pub mod channel;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod fragment;
pub mod registry;
pub mod reliable;
pub mod sequence;
pub mod simulator;
pub mod stats;
pub mod wire;

pub use channel::{Channel, Incoming};
pub use config::{
    ChannelConfig, KEEPALIVE_INTERVAL, MAX_MSGLEN, MAX_PACKETLEN, MAX_PACKETLEN_DEFAULT,
    MAX_PACKETLEN_WRITABLE, MIN_PACKETLEN, NetSource, PROTOCOL_VERSION_DEFAULT,
    PROTOCOL_VERSION_Q2PRO, PROTOCOL_VERSION_R1Q2, RegistryConfig, Variant,
};
pub use endpoint::{DatagramSocket, NetworkEndpoint, SocketStats};
pub use error::{FragmentError, NetchanError, Result};
pub use fragment::{Fragment, FragmentAssembler, FragmentSender};
pub use registry::{ChannelId, ChannelRegistry};
pub use reliable::{ReliableEngine, ReliableState};
pub use sequence::{IncomingRecord, SequenceLedger};
pub use simulator::NetworkSimulator;
pub use stats::{ChannelStats, PacketLossSimulation};
