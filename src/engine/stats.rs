use std::time::Duration;

use size::Size;

use crate::core::TransferRate;

/// Snapshot of the engine's progress.
#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    pub total_pieces: usize,
    pub completed_pieces: usize,
    pub connected_peers: usize,
    /// Payload bytes sent since start
    pub uploaded: u64,
    /// Payload bytes accepted since start, including blocks of pieces that failed verification
    pub downloaded: u64,
    pub upload_rate: TransferRate,
    pub download_rate: TransferRate,
}

impl Stats {
    pub fn completed(&self) -> f64 {
        if self.total_pieces == 0 {
            return 100f64;
        }
        100f64 * (self.completed_pieces as f64) / (self.total_pieces as f64)
    }
}

/// Sums the rates of several peers into one per-second rate.
pub(crate) fn combined_rate(rates: impl IntoIterator<Item = TransferRate>) -> TransferRate {
    let bps: f64 = rates.into_iter().map(|rate| rate.bps()).sum();
    TransferRate(Size::from_bytes(bps.round() as u64), Duration::from_secs(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_rate_is_a_sum_of_speeds() {
        let a = TransferRate(Size::from_kibibytes(20), Duration::from_secs(2));
        let b = TransferRate(Size::from_kibibytes(30), Duration::from_secs(1));

        let combined = combined_rate([a, b]);

        assert_eq!(combined.bps(), 40.0 * 1024.0);
    }

    #[test]
    fn completed_percentage() {
        let stats = Stats {
            total_pieces: 8,
            completed_pieces: 2,
            connected_peers: 0,
            uploaded: 0,
            downloaded: 0,
            upload_rate: TransferRate::EMPTY,
            download_rate: TransferRate::EMPTY,
        };

        assert_eq!(stats.completed(), 25.0);
    }
}
