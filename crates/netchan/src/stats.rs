use serde::{Deserialize, Serialize};

/// Lossy-link parameters applied by the simulator to one peer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PacketLossSimulation {
    pub enabled: bool,
    pub loss_percent: f32,
    pub min_latency_ms: u32,
    pub max_latency_ms: u32,
    pub jitter_ms: u32,
}

impl PacketLossSimulation {
    pub fn should_drop(&self) -> bool {
        if !self.enabled || self.loss_percent <= 0.0 {
            return false;
        }
        rand_percent() * 100.0 < self.loss_percent
    }

    pub fn delay_ms(&self) -> u32 {
        if !self.enabled || self.max_latency_ms == 0 {
            return 0;
        }
        let base = self.min_latency_ms;
        let range = self.max_latency_ms.saturating_sub(self.min_latency_ms);
        let jitter = if self.jitter_ms > 0 {
            (rand_percent() * self.jitter_ms as f32) as u32
        } else {
            0
        };
        base + (rand_percent() * range as f32) as u32 + jitter
    }
}

/// Per-channel counters, read by timeout logic and diagnostic overlays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    /// Duplicate, stale or runt datagrams ignored.
    pub packets_rejected: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Datagrams presumed lost, from sequence gaps.
    pub total_dropped: u64,
    /// Datagrams the peer sent up to the last accepted one, lost ones included.
    pub total_received: u64,
    pub reliable_chunks_sent: u64,
    pub reliable_acked: u64,
    pub reliable_received: u64,
    pub unreliable_dumped: u64,
}

impl ChannelStats {
    pub fn loss_percent(&self) -> f32 {
        if self.total_received == 0 {
            return 0.0;
        }
        self.total_dropped as f32 / self.total_received as f32 * 100.0
    }
}

pub fn rand_percent() -> f32 {
    rand_u64() as f32 / u64::MAX as f32
}

pub fn rand_u64() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hash, Hasher};
    use std::time::Instant;

    let mut hasher = RandomState::new().build_hasher();
    Instant::now().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_simulation_never_drops() {
        let sim = PacketLossSimulation {
            enabled: false,
            loss_percent: 100.0,
            ..Default::default()
        };
        assert!(!sim.should_drop());
        assert_eq!(sim.delay_ms(), 0);
    }

    #[test]
    fn test_full_loss_always_drops() {
        let sim = PacketLossSimulation {
            enabled: true,
            loss_percent: 101.0,
            ..Default::default()
        };
        assert!((0..32).all(|_| sim.should_drop()));
    }

    #[test]
    fn test_loss_percent() {
        let stats = ChannelStats {
            total_dropped: 5,
            total_received: 20,
            ..Default::default()
        };
        assert!((stats.loss_percent() - 25.0).abs() < f32::EPSILON);
        assert_eq!(ChannelStats::default().loss_percent(), 0.0);
    }
}
