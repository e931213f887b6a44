use netchan::{MAX_PACKETLEN_DEFAULT, PROTOCOL_VERSION_Q2PRO, PacketLossSimulation, Variant};

#[derive(Debug, Clone)]
pub struct SoakConfig {
    pub variant: Variant,
    pub protocol: u32,
    pub max_packet_len: usize,
    pub clients: usize,
    /// Reliable messages each side sends per channel.
    pub messages: u32,
    pub message_size: usize,
    pub unreliable_size: usize,
    pub tick_rate: u32,
    /// Copies of every datagram handed to the socket.
    pub redundancy: usize,
    pub max_duration_secs: u64,
    pub packet_loss: Option<PacketLossSimulation>,
}

impl Default for SoakConfig {
    fn default() -> Self {
        Self {
            variant: Variant::Current,
            protocol: PROTOCOL_VERSION_Q2PRO,
            max_packet_len: MAX_PACKETLEN_DEFAULT,
            clients: 4,
            messages: 50,
            message_size: 4000,
            unreliable_size: 200,
            tick_rate: 100,
            redundancy: 1,
            max_duration_secs: 60,
            packet_loss: None,
        }
    }
}
