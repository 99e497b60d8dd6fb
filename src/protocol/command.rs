use thiserror::Error;

use crate::protocol::frame::MIN_FRAME_SIZE;

/// Sent by the gateway once a `SEND` configuration was accepted.
pub const READY_REPLY: &str = "send ready";
/// Sent by the client to begin the paced transmission.
pub const START_COMMAND: &str = "send start";

/// Prefix of the completion report, the final text message of a run.
pub const DONE_PREFIX: &str = "SEND DONE ";


/// One run's negotiated parameters, as carried by the `SEND` command.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TestConfig {
    /// packets per second
    pub rate: u32,
    /// bytes per frame, including the 10 byte header
    pub packet_size: usize,
    pub duration_secs: u32,
}
impl TestConfig {
    pub fn expected_total(&self) -> u64 {
        self.rate as u64 * self.duration_secs as u64
    }

    pub fn expected_total_bytes(&self) -> u64 {
        self.expected_total() * self.packet_size as u64
    }

    pub fn command_line(&self) -> String {
        format!("SEND {} {} {}", self.rate, self.packet_size, self.duration_secs)
    }
}


#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum CommandError {
    #[error("not a test protocol command: {0:?}")]
    Unknown(String),
    #[error("SEND parameter '{0}' is missing or not a positive integer")]
    MalformedParameter(&'static str),
    #[error("packet size {0} does not fit the {min} byte frame header", min = MIN_FRAME_SIZE)]
    PacketSizeTooSmall(usize),
}


/// A command received on the data channel, i.e. the client half of the test protocol.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ChannelCommand {
    Configure(TestConfig),
    Start,
}
impl ChannelCommand {
    pub fn parse(text: &str) -> Result<ChannelCommand, CommandError> {
        if text == START_COMMAND {
            return Ok(ChannelCommand::Start);
        }
        if text.starts_with(DONE_PREFIX) {
            // the completion report travels in the other direction
            return Err(CommandError::Unknown(text.to_string()));
        }

        let mut parts = text.split_whitespace();
        if parts.next() != Some("SEND") {
            return Err(CommandError::Unknown(text.to_string()));
        }

        let rate = positive_param(parts.next(), "rate")?;
        let packet_size = positive_param(parts.next(), "packet size")? as usize;
        let duration_secs = positive_param(parts.next(), "duration")?;
        if parts.next().is_some() {
            return Err(CommandError::Unknown(text.to_string()));
        }

        if packet_size < MIN_FRAME_SIZE {
            return Err(CommandError::PacketSizeTooSmall(packet_size));
        }

        Ok(ChannelCommand::Configure(TestConfig {
            rate: rate as u32,
            packet_size,
            duration_secs: duration_secs as u32,
        }))
    }
}

fn positive_param(raw: Option<&str>, name: &'static str) -> Result<u64, CommandError> {
    match raw.and_then(|s| s.parse::<u64>().ok()) {
        Some(value) if value > 0 => Ok(value),
        _ => Err(CommandError::MalformedParameter(name)),
    }
}


/// The authoritative counters from the sender's transport statistics, sent as the final
///  text message of a run.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CompletionReport {
    pub messages_sent: u64,
    pub bytes_sent: u64,
}
impl CompletionReport {
    pub fn format(&self) -> String {
        format!("SEND DONE {} {}", self.messages_sent, self.bytes_sent)
    }

    pub fn parse(text: &str) -> Option<CompletionReport> {
        let params = text.strip_prefix(DONE_PREFIX)?;
        let mut parts = params.split_whitespace();
        let messages_sent = parts.next()?.parse().ok()?;
        let bytes_sent = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(CompletionReport { messages_sent, bytes_sent })
    }
}
