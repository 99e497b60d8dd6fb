use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use tracing::debug;

use crate::protocol::command::TestConfig;
use crate::signaling::{IceCandidate, PeerId};
use crate::transport::{ConnectionState, DataChannel, PeerTransport};
use crate::util::TimerHandle;


/// Test-protocol state of the data channel, independent of transport connectivity.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChannelState {
    New,
    Opened,
    InProgress,
    Closed,
}

/// Typed inputs to the channel state machine.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChannelInput {
    Open,
    Configured,
    Start { configured: bool },
    Finished,
    ClosedOrError,
}

/// Side effects a transition asks its caller to perform.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChannelEffect {
    ReplyReady,
    StartRun,
    WarnOutOfOrder,
    ReleaseRun,
}

/// The channel state machine as a pure function, testable without a live transport.
///  `new -> opened -> inprogress -> closed`; out-of-order inputs (notably a start command
///  without prior configuration) leave the state unchanged and are warned about, never
///  treated as fatal.
pub fn channel_transition(state: ChannelState, input: &ChannelInput) -> (ChannelState, Option<ChannelEffect>) {
    use ChannelEffect::*;
    use ChannelInput::*;
    use ChannelState::*;

    match (state, input) {
        (New, Open) => (Opened, None),
        (Opened, Configured) => (Opened, Some(ReplyReady)),
        (Opened, Start { configured: true }) => (InProgress, Some(StartRun)),
        (InProgress, Finished) => (Closed, None),
        (_, ClosedOrError) => (Closed, Some(ReleaseRun)),
        (s, _) => (s, Some(WarnOutOfOrder)),
    }
}


/// Per-peer aggregate on the gateway side: owns the transport peer object, the data
///  channel handle and the run timer handle, so insert / delete in the peer table is
///  all it takes to keep them in sync.
pub struct PeerSession {
    pub(in crate::gateway) peer: PeerId,
    pub(in crate::gateway) transport: Arc<dyn PeerTransport>,
    pub(in crate::gateway) channel: Option<Arc<dyn DataChannel>>,
    pub(in crate::gateway) connection_state: ConnectionState,
    pub(in crate::gateway) channel_state: ChannelState,
    pub(in crate::gateway) test_config: Option<TestConfig>,
    pub(in crate::gateway) pending_candidates: Vec<IceCandidate>,
    pub(in crate::gateway) run: Option<TimerHandle>,
    pub(in crate::gateway) sent_count: u64,
    pub(in crate::gateway) received_count: u64,
}
impl PeerSession {
    pub fn new(peer: PeerId, transport: Arc<dyn PeerTransport>) -> PeerSession {
        PeerSession {
            peer,
            transport,
            channel: None,
            connection_state: ConnectionState::New,
            channel_state: ChannelState::New,
            test_config: None,
            pending_candidates: Vec::new(),
            run: None,
            sent_count: 0,
            received_count: 0,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel_state
    }

    pub fn test_config(&self) -> Option<TestConfig> {
        self.test_config
    }

    pub fn has_live_run(&self) -> bool {
        self.run.is_some()
    }

    pub fn sent_count(&self) -> u64 {
        self.sent_count
    }

    /// Releases everything the session owns. Consuming `self` makes redundant cleanup
    ///  triggers (transport event plus control-connection close) structurally impossible.
    pub fn release(mut self) {
        if let Some(run) = self.run.take() {
            debug!("releasing run timer for {:?}", self.peer);
            run.release();
        }
        self.transport.close();
    }
}
impl Debug for PeerSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerSession{{{:?}, conn:{:?}, channel:{:?}, run:{}}}",
            self.peer, self.connection_state, self.channel_state, self.run.is_some())
    }
}
