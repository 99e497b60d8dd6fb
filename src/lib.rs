pub mod analyzer;
pub mod client;
pub mod config;
pub mod gateway;
pub mod protocol;
pub mod signaling;
pub mod test_util;
pub mod transport;
pub mod util;
