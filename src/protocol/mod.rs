pub mod command;
pub mod frame;

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;


/// One application-level payload on the test data channel: text for the command
///  handshake, binary for the test frames themselves.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

pub fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH)
        .expect("system time is before UNIX epoch") //TODO
        .as_millis() as i64
}
