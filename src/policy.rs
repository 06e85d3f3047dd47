use std::cmp::min;

use crate::config::HomaConfig;
use crate::safe_converter::PrecheckedCast;

/// The pure decision functions of the protocol: how much of a message may be sent without a
///  grant, which priority a packet travels at, and how far ahead of the received bytes a
///  grant may reach.
///
/// Priorities are small integers with higher values winning. The lowest
///  `scheduled_priority_levels` values are used by grants (rank among granted messages, the
///  shortest remaining message on top), the bands above that are used for unscheduled
///  packets, partitioned by total message length.
pub struct Policy {
    rtt_bytes: u32,
    unscheduled_cutoffs: Vec<u32>,
    scheduled_levels: u8,
}

impl Policy {
    pub fn new(config: &HomaConfig, bandwidth_bps: u64) -> Policy {
        let rtt_bytes = (bandwidth_bps / 8).saturating_mul(config.rtt_micros) / 1_000_000;

        Policy {
            // a degenerate bandwidth-delay product would stall every message forever
            rtt_bytes: rtt_bytes.max(1).prechecked_cast(),
            unscheduled_cutoffs: config.unscheduled_priority_cutoffs.clone(),
            scheduled_levels: config.scheduled_priority_levels,
        }
    }

    /// bandwidth * RTT: the byte budget that keeps the link busy for one round trip
    pub fn rtt_bytes(&self) -> u32 {
        self.rtt_bytes
    }

    /// The number of bytes a sender may transmit before the first grant arrives. Messages no
    ///  longer than one RTT-bytes complete without soliciting any grant at all.
    pub fn unscheduled_limit(&self, total_length: u32) -> u32 {
        min(total_length, self.rtt_bytes)
    }

    /// How far beyond `bytes_received` a receiver grants, and also the threshold below which
    ///  the outstanding granted range is considered drained and topped up.
    pub fn grant_window(&self) -> u32 {
        self.rtt_bytes
    }

    /// Priority band for the unscheduled prefix of a message: shorter messages get higher
    ///  bands so a short message overtakes the unscheduled prefix of a long one in the fabric.
    pub fn unscheduled_priority(&self, total_length: u32) -> u8 {
        let band = self
            .unscheduled_cutoffs
            .iter()
            .filter(|&&cutoff| total_length >= cutoff)
            .count();
        self.scheduled_levels + (self.unscheduled_cutoffs.len() - band) as u8
    }

    /// Priority for a grant to the message ranked `rank` in the SRPT order (0 = shortest
    ///  remaining). Ranks beyond the configured levels share the lowest priority.
    pub fn scheduled_priority(&self, rank: usize) -> u8 {
        (self.scheduled_levels - 1).saturating_sub(min(rank, u8::MAX as usize) as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn policy() -> Policy {
        // 10 Gbit/s, 5us RTT -> 6250 RTT-bytes
        Policy::new(&HomaConfig::default_datacenter(), 10_000_000_000)
    }

    #[test]
    fn test_rtt_bytes() {
        assert_eq!(policy().rtt_bytes(), 6250);
        assert_eq!(policy().grant_window(), 6250);
    }

    #[test]
    fn test_rtt_bytes_never_zero() {
        let policy = Policy::new(&HomaConfig::default_datacenter(), 1);
        assert_eq!(policy.rtt_bytes(), 1);
    }

    #[rstest]
    #[case::zero(0, 0)]
    #[case::short(64, 64)]
    #[case::exactly_rtt(6250, 6250)]
    #[case::rtt_plus_one(6251, 6250)]
    #[case::large(1_000_000, 6250)]
    fn test_unscheduled_limit(#[case] total_length: u32, #[case] expected: u32) {
        assert_eq!(policy().unscheduled_limit(total_length), expected);
    }

    #[rstest]
    // default cutoffs [512, 4096, 16384] on top of 4 scheduled levels
    #[case::tiny(0, 7)]
    #[case::below_first_cutoff(511, 7)]
    #[case::first_cutoff(512, 6)]
    #[case::second_band(4095, 6)]
    #[case::third_band(4096, 5)]
    #[case::last_band(16384, 4)]
    #[case::huge(10_000_000, 4)]
    fn test_unscheduled_priority(#[case] total_length: u32, #[case] expected: u8) {
        assert_eq!(policy().unscheduled_priority(total_length), expected);
    }

    #[rstest]
    #[case::top_rank(0, 3)]
    #[case::second(1, 2)]
    #[case::third(2, 1)]
    #[case::fourth(3, 0)]
    #[case::beyond_levels(4, 0)]
    #[case::way_beyond(100, 0)]
    fn test_scheduled_priority(#[case] rank: usize, #[case] expected: u8) {
        assert_eq!(policy().scheduled_priority(rank), expected);
    }

    #[test]
    fn test_bands_are_disjoint() {
        let policy = policy();
        let lowest_unscheduled = policy.unscheduled_priority(u32::MAX);
        let highest_scheduled = policy.scheduled_priority(0);
        assert!(highest_scheduled < lowest_unscheduled);
    }
}
