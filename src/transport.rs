//! The consumed external interfaces: a transport peer abstraction (session description
//!  negotiation, candidate exchange, data channels, statistics) and the persistent
//!  control-plane connection. Implementations live outside this crate; the traits here
//!  decouple session and gateway logic from any concrete WebRTC stack, and they are
//!  mocked for testing.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;

use crate::protocol::command::CompletionReport;
use crate::protocol::ChannelMessage;
use crate::signaling::{IceCandidate, PeerId, SessionDescription, SignalMessage};


/// Mirror of the transport's connectivity state machine. Transitions are observed,
///  never driven from inside this crate.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}
impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed)
    }
}


/// Snapshot of the transport's per-channel counters. These are authoritative, as opposed
///  to counts recomputed from received messages (which would count duplicates).
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChannelConfig {
    pub label: String,
    pub ordered: bool,
    pub max_retransmits: u32,
}


/// Outcome of one paced run, reported through the peer event stream.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RunOutcome {
    Completed(CompletionReport),
    Aborted { frames_sent: u64, reason: String },
}


/// Everything a transport peer object reports back, tagged with the peer identity it
///  belongs to. All per-peer state machines consume these as their typed inputs.
pub enum PeerEvent {
    ConnectivityChanged(ConnectionState),
    DataChannelCreated(Arc<dyn DataChannel>),
    CandidateGathered(IceCandidate),
    /// the "last candidate" sentinel: the pending batch is complete and can be flushed
    CandidateGatheringComplete,
    ChannelOpen,
    ChannelMessage(ChannelMessage),
    ChannelClosed,
    ChannelError(String),
    RunFinished(RunOutcome),
}
impl Debug for PeerEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::ConnectivityChanged(s) => write!(f, "ConnectivityChanged({:?})", s),
            PeerEvent::DataChannelCreated(_) => write!(f, "DataChannelCreated"),
            PeerEvent::CandidateGathered(c) => write!(f, "CandidateGathered({:?})", c.candidate),
            PeerEvent::CandidateGatheringComplete => write!(f, "CandidateGatheringComplete"),
            PeerEvent::ChannelOpen => write!(f, "ChannelOpen"),
            PeerEvent::ChannelMessage(m) => write!(f, "ChannelMessage({:?})", m),
            PeerEvent::ChannelClosed => write!(f, "ChannelClosed"),
            PeerEvent::ChannelError(e) => write!(f, "ChannelError({:?})", e),
            PeerEvent::RunFinished(o) => write!(f, "RunFinished({:?})", o),
        }
    }
}

pub type PeerEventSender = mpsc::Sender<(PeerId, PeerEvent)>;
pub type PeerEventReceiver = mpsc::Receiver<(PeerId, PeerEvent)>;


/// One transport peer object, created per offer and owned by exactly one session.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;
    async fn apply_remote_description(&self, description: SessionDescription) -> anyhow::Result<()>;
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;
    fn has_remote_description(&self) -> bool;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()>;
    async fn create_data_channel(&self, config: ChannelConfig) -> anyhow::Result<Arc<dyn DataChannel>>;
    async fn stats(&self) -> anyhow::Result<TransportStats>;
    fn close(&self);
}

/// The unreliable, unordered message channel that carries the test traffic. Sends are
///  synchronous fire-and-forget; a failed send is not recoverable.
#[cfg_attr(test, automock)]
pub trait DataChannel: Send + Sync {
    fn is_open(&self) -> bool;
    fn send_text(&self, text: &str) -> anyhow::Result<()>;
    fn send_binary(&self, frame: Bytes) -> anyhow::Result<()>;
}

/// The sending half of one persistent control-plane connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlConnection: Send + Sync {
    async fn send(&self, message: &SignalMessage) -> anyhow::Result<()>;
}

/// Creates transport peer objects whose event callbacks are routed into `events`,
///  tagged with `peer`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(&self, peer: PeerId, events: PeerEventSender) -> anyhow::Result<Arc<dyn PeerTransport>>;
}
