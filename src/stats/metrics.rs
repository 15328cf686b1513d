//! Statistics snapshots for tailers and relays

use std::time::Duration;

/// Per-tailer statistics
#[derive(Debug, Clone, Default)]
pub struct TailerStats {
    /// Tailer id within its relay
    pub id: u64,
    /// Writer total at the tailer's join point
    pub started_total: u64,
    /// Bytes handed to the sink
    pub bytes_forwarded: u64,
    /// Slices handed to the sink
    pub slices: u64,
    /// Bytes written but not yet forwarded
    pub pending: u64,
    /// Time since join
    pub uptime: Duration,
}

impl TailerStats {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Forwarding rate in bits per second
    pub fn bitrate(&self) -> u64 {
        let secs = self.uptime.as_secs();
        if secs > 0 {
            (self.bytes_forwarded * 8) / secs
        } else {
            0
        }
    }

    /// Average slice size in bytes
    pub fn average_slice(&self) -> u64 {
        if self.slices > 0 {
            self.bytes_forwarded / self.slices
        } else {
            0
        }
    }
}

/// Relay-wide statistics
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    /// Ring capacity in bytes
    pub capacity: usize,
    /// Payload bytes ever written
    pub total_written: u64,
    /// Bytes skipped as padding at lap ends
    pub padding: u64,
    /// Frame starts seen by the writer
    pub frames_seen: u64,
    /// Tailers currently forwarding
    pub active_tailers: usize,
    /// Tailers ever joined
    pub joins: u64,
    /// Joins refused for lack of a start marker
    pub failed_joins: u64,
    /// Tailers removed for any reason
    pub disconnects: u64,
    /// Tailers removed after an overrun
    pub overruns: u64,
    /// Time since the writer started
    pub uptime: Duration,
}

impl RelayStats {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    /// Ingest rate in bits per second
    pub fn bitrate(&self) -> u64 {
        let secs = self.uptime.as_secs();
        if secs > 0 {
            (self.total_written * 8) / secs
        } else {
            0
        }
    }

    /// Times the writer has lapped the ring
    pub fn laps(&self) -> u64 {
        if self.capacity == 0 {
            return 0;
        }
        (self.total_written + self.padding) / self.capacity as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tailer_stats_new() {
        let stats = TailerStats::new(7);
        assert_eq!(stats.id, 7);
        assert_eq!(stats.bytes_forwarded, 0);
        assert_eq!(stats.slices, 0);
        assert_eq!(stats.bitrate(), 0);
        assert_eq!(stats.average_slice(), 0);
    }

    #[test]
    fn test_tailer_stats_bitrate() {
        let mut stats = TailerStats::new(1);
        stats.bytes_forwarded = 1_000_000;
        stats.slices = 4;
        stats.uptime = Duration::from_secs(10);

        // 1,000,000 bytes * 8 bits / 10 seconds
        assert_eq!(stats.bitrate(), 800_000);
        assert_eq!(stats.average_slice(), 250_000);
    }

    #[test]
    fn test_relay_stats_laps() {
        let mut stats = RelayStats::new(8);
        stats.total_written = 14;
        stats.padding = 2;
        assert_eq!(stats.laps(), 2);

        assert_eq!(RelayStats::default().laps(), 0);
    }

    #[test]
    fn test_relay_stats_bitrate_zero_uptime() {
        let mut stats = RelayStats::new(1024);
        stats.total_written = 5_000;
        assert_eq!(stats.bitrate(), 0);
    }
}
