use std::time::Duration;

use crate::transport::ChannelConfig;


/// Probe-wide tuning knobs with defaults matching the reference deployment.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub channel_label: String,
    /// the test channel is intentionally unordered with zero retransmits - loss and
    ///  reordering are what the probe measures
    pub channel_ordered: bool,
    pub channel_max_retransmits: u32,
    /// per-packet delivery delay beyond which a packet counts as delayed
    pub acceptable_delay: Duration,
    /// how long the receiver keeps a finished run open for packets still in transit
    pub completion_linger: Duration,
}
impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            channel_label: "data-stream-channel".to_string(),
            channel_ordered: false,
            channel_max_retransmits: 0,
            acceptable_delay: Duration::from_millis(100),
            completion_linger: Duration::from_secs(2),
        }
    }
}
impl ProbeConfig {
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            label: self.channel_label.clone(),
            ordered: self.channel_ordered,
            max_retransmits: self.channel_max_retransmits,
        }
    }
}
