//! Receiver-side loss and delay analysis. Loss is computed against the run's expected
//!  total once the run is closed; delay can be assessed per packet as it arrives.

use bit_set::BitSet;


/// One received test frame, in arrival order (the channel is unordered, so arrival
///  order is not send order).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReceivedPacketRecord {
    pub sequence_number: u16,
    pub send_timestamp_millis: i64,
    pub received_at_millis: i64,
}

/// Returns every sequence number in `[0, expected_total)` that is absent from `received`,
///  in ascending order. Duplicate and out-of-range received values are ignored.
pub fn find_missing_sequence_numbers(expected_total: u64, received: impl IntoIterator<Item = u16>) -> Vec<u16> {
    let mut seen = BitSet::with_capacity(expected_total as usize);
    for seq in received {
        if (seq as u64) < expected_total {
            seen.insert(seq as usize);
        }
    }

    (0..expected_total)
        .filter(|seq| !seen.contains(*seq as usize))
        .map(|seq| seq as u16)
        .collect()
}

/// Returns the sequence numbers of all records whose delivery took longer than
///  `acceptable_delay_millis`, in arrival order.
pub fn find_delayed_packets(records: &[ReceivedPacketRecord], acceptable_delay_millis: i64) -> Vec<u16> {
    records.iter()
        .filter(|r| r.received_at_millis - r.send_timestamp_millis > acceptable_delay_millis)
        .map(|r| r.sequence_number)
        .collect()
}

/// Loss percentage based on the authoritative receiver-side message counter rather than
///  the record list, so duplicate deliveries are not counted twice.
pub fn packet_loss_percent(expected_total: u64, reported_received: u64) -> f64 {
    if expected_total == 0 {
        return 0.0;
    }
    let lost = expected_total.saturating_sub(reported_received);
    (lost * 100) as f64 / expected_total as f64
}
