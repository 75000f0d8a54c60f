use crate::Frame;

/// Statistics about one peer connection. Query with
/// [`NetplaySession::network_stats`](crate::NetplaySession::network_stats).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "NetworkStats should be inspected or used after being queried"]
pub struct NetworkStats {
    /// Encoded messages the transport has not accepted yet. A growing queue means the
    /// peer (or the link) is not keeping up.
    pub send_queue_len: usize,
    /// Exponentially smoothed round-trip time in milliseconds, `None` before the first pong.
    pub ping_ms: Option<u32>,
    /// Bytes handed to the transport.
    pub bytes_sent: u64,
    /// Bytes read from the transport.
    pub bytes_received: u64,
    /// Messages encoded for this peer.
    pub messages_sent: u64,
    /// Messages decoded from this peer.
    pub messages_received: u64,
    /// The newest frame the peer has reported, through an input, combined record or sync ack.
    pub last_frame_acked: Option<Frame>,
    /// How many frames the peer's newest capture is ahead of our current frame.
    /// Negative when the peer is behind.
    pub remote_frames_ahead: i64,
}

impl NetworkStats {
    /// Folds a new round-trip sample into the smoothed estimate (weight 1/8 for the sample).
    pub(crate) fn record_rtt(&mut self, sample_ms: u64) {
        let sample = u32::try_from(sample_ms).unwrap_or(u32::MAX);
        self.ping_ms = Some(match self.ping_ms {
            None => sample,
            Some(previous) => ((u64::from(previous) * 7 + u64::from(sample)) / 8) as u32,
        });
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_is_taken_verbatim() {
        let mut stats = NetworkStats::default();
        assert_eq!(stats.ping_ms, None);
        stats.record_rtt(40);
        assert_eq!(stats.ping_ms, Some(40));
    }

    #[test]
    fn later_samples_are_smoothed() {
        let mut stats = NetworkStats::default();
        stats.record_rtt(80);
        stats.record_rtt(0);
        assert_eq!(stats.ping_ms, Some(70));
        stats.record_rtt(u64::MAX);
        assert!(stats.ping_ms.unwrap() > 70);
    }
}
