//! The signaling gateway: accepts control-plane connections, assigns peer identities,
//!  relays session-description and candidate exchange, and owns the per-peer sessions
//!  with their data channels and run timers.
//!
//! Everything runs on one event loop; concurrency across peers is many independent
//!  session state machines multiplexed over the same two mpsc streams, so the peer
//!  table needs no locking.

pub mod generator;
pub mod session;

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::protocol::command::{ChannelCommand, READY_REPLY};
use crate::protocol::ChannelMessage;
use crate::signaling::{IceCandidate, PeerId, SessionDescription, SignalMessage};
use crate::transport::{
    ConnectionState, ControlConnection, PeerEvent, PeerEventReceiver, PeerEventSender,
    PeerTransportFactory, RunOutcome,
};

use self::session::{channel_transition, ChannelEffect, ChannelInput, PeerSession};


/// Control-plane lifecycle events, produced by whatever accepts and reads the
///  persistent control connections.
pub enum ControlEvent {
    Connected { control: Arc<dyn ControlConnection> },
    Message { peer: PeerId, message: SignalMessage },
    Closed { peer: PeerId },
}

struct PeerEntry {
    control: Arc<dyn ControlConnection>,
    session: Option<PeerSession>,
}

pub struct Gateway {
    factory: Arc<dyn PeerTransportFactory>,
    peer_events: PeerEventSender,
    peers: FxHashMap<PeerId, PeerEntry>,
}
impl Gateway {
    pub fn new(factory: Arc<dyn PeerTransportFactory>, peer_events: PeerEventSender) -> Gateway {
        Gateway {
            factory,
            peer_events,
            peers: FxHashMap::default(),
        }
    }

    /// The gateway's event loop. Returns once the control-plane stream ends, tearing
    ///  down all remaining sessions on the way out.
    pub async fn run(mut self, mut control: mpsc::Receiver<ControlEvent>, mut peer_events: PeerEventReceiver) {
        loop {
            select! {
                event = control.recv() => match event {
                    Some(event) => self.handle_control_event(event).await,
                    None => break,
                },
                Some((peer, event)) = peer_events.recv() => self.handle_peer_event(&peer, event).await,
            }
        }

        info!("control plane closed, shutting down gateway");
        let peers = self.peers.keys().cloned().collect::<Vec<_>>();
        for peer in peers {
            self.handle_control_closed(&peer);
        }
    }

    pub async fn handle_control_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Connected { control } => {
                self.handle_connect(control).await;
            }
            ControlEvent::Message { peer, message } => self.handle_control_message(&peer, message).await,
            ControlEvent::Closed { peer } => self.handle_control_closed(&peer),
        }
    }

    /// Allocates an identity for a freshly accepted control connection and announces it
    ///  to the client.
    pub async fn handle_connect(&mut self, control: Arc<dyn ControlConnection>) -> PeerId {
        let peer = PeerId::new();
        info!("new control connection, assigned {:?}", peer);

        if let Err(e) = control.send(&SignalMessage::PeerId { peer_id: peer.clone() }).await {
            warn!("sending peer id to {:?} failed: {}", peer, e);
        }
        self.peers.insert(peer.clone(), PeerEntry { control, session: None });
        peer
    }

    pub async fn handle_control_message(&mut self, peer: &PeerId, message: SignalMessage) {
        trace!("control message from {:?}: {:?}", peer, message);
        match message {
            SignalMessage::Offer { sdp } => self.handle_offer(peer, sdp).await,
            SignalMessage::IceCandidate { candidate } => self.handle_remote_candidates(peer, candidate).await,
            SignalMessage::Hangup => self.tear_down_session(peer, "hangup from peer"),
            other => warn!("unexpected signaling message from {:?} - ignoring: {:?}", peer, other),
        }
    }

    /// Control connection gone: the session cannot be renegotiated, so the whole entry
    ///  goes away.
    pub fn handle_control_closed(&mut self, peer: &PeerId) {
        info!("control connection for {:?} closed - cleaning up", peer);
        if let Some(mut entry) = self.peers.remove(peer) {
            if let Some(session) = entry.session.take() {
                session.release();
            }
        }
    }

    async fn handle_offer(&mut self, peer: &PeerId, sdp: SessionDescription) {
        if !self.peers.contains_key(peer) {
            warn!("offer from unknown peer {:?} - ignoring", peer);
            return;
        }
        info!("offer from {:?}", peer);

        // a fresh offer always supersedes: never two transport peer objects per identity
        self.tear_down_session(peer, "superseded by new offer");

        let transport = match self.factory.create(peer.clone(), self.peer_events.clone()).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!("creating transport peer for {:?} failed: {}", peer, e);
                self.report_error(peer, format!("creating transport peer failed: {}", e)).await;
                return;
            }
        };
        let session = PeerSession::new(peer.clone(), transport);

        match self.negotiate(peer, &session, sdp).await {
            Ok(()) => {
                if let Some(entry) = self.peers.get_mut(peer) {
                    entry.session = Some(session);
                }
            }
            Err(e) => {
                warn!("negotiation with {:?} failed: {}", peer, e);
                session.release();
                self.report_error(peer, format!("negotiation failed: {}", e)).await;
            }
        }
    }

    async fn negotiate(&self, peer: &PeerId, session: &PeerSession, remote: SessionDescription) -> anyhow::Result<()> {
        session.transport.apply_remote_description(remote).await?;
        let answer = session.transport.create_answer().await?;
        self.control_of(peer)?.send(&SignalMessage::Answer { sdp: answer }).await?;
        Ok(())
    }

    async fn handle_remote_candidates(&mut self, peer: &PeerId, candidates: Vec<IceCandidate>) {
        let Some(session) = self.session(peer) else {
            warn!("ICE candidates from {:?} without a session - dropping", peer);
            return;
        };
        if !session.transport.has_remote_description() {
            warn!("ICE candidates from {:?} before remote description - dropping", peer);
            return;
        }

        let transport = session.transport.clone();
        for candidate in candidates {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                warn!("applying ICE candidate from {:?} failed: {}", peer, e);
            }
        }
    }

    pub async fn handle_peer_event(&mut self, peer: &PeerId, event: PeerEvent) {
        trace!("peer event for {:?}: {:?}", peer, event);
        match event {
            PeerEvent::ConnectivityChanged(state) => self.on_connectivity_changed(peer, state),
            PeerEvent::DataChannelCreated(channel) => {
                if let Some(session) = self.session_mut(peer) {
                    session.channel = Some(channel);
                } else {
                    debug!("data channel for defunct {:?} - ignoring", peer);
                }
            }
            PeerEvent::CandidateGathered(candidate) => {
                if let Some(session) = self.session_mut(peer) {
                    session.pending_candidates.push(candidate);
                }
            }
            PeerEvent::CandidateGatheringComplete => self.flush_local_candidates(peer).await,
            PeerEvent::ChannelOpen => {
                self.apply_channel_input(peer, ChannelInput::Open);
            }
            PeerEvent::ChannelMessage(message) => self.on_channel_message(peer, message).await,
            PeerEvent::ChannelClosed => {
                self.apply_channel_input(peer, ChannelInput::ClosedOrError);
            }
            PeerEvent::ChannelError(e) => {
                warn!("data channel error for {:?}: {}", peer, e);
                self.apply_channel_input(peer, ChannelInput::ClosedOrError);
            }
            PeerEvent::RunFinished(outcome) => self.on_run_finished(peer, outcome),
        }
    }

    fn on_connectivity_changed(&mut self, peer: &PeerId, state: ConnectionState) {
        info!("connectivity for {:?}: {:?}", peer, state);
        let terminal = match self.session_mut(peer) {
            Some(session) => {
                session.connection_state = state;
                state.is_terminal()
            }
            None => false,
        };
        if terminal {
            self.tear_down_session(peer, "transport connectivity terminal");
        }
    }

    /// Local candidate gathering is complete: send the whole batch as one message, so the
    ///  control channel sees a single candidate exchange per negotiation.
    async fn flush_local_candidates(&mut self, peer: &PeerId) {
        let batch = match self.session_mut(peer) {
            Some(session) => std::mem::take(&mut session.pending_candidates),
            None => {
                debug!("candidate gathering completed for defunct {:?} - ignoring", peer);
                return;
            }
        };

        debug!("flushing {} local candidates to {:?}", batch.len(), peer);
        match self.control_of(peer) {
            Ok(control) => {
                if let Err(e) = control.send(&SignalMessage::IceCandidate { candidate: batch }).await {
                    warn!("sending candidate batch to {:?} failed: {}", peer, e);
                }
            }
            Err(e) => warn!("{}", e),
        }
    }

    async fn on_channel_message(&mut self, peer: &PeerId, message: ChannelMessage) {
        match message {
            ChannelMessage::Text(text) => self.on_channel_command(peer, &text).await,
            ChannelMessage::Binary(buf) => {
                // the gateway only sends test traffic; inbound binary is counted, nothing more
                trace!("{} byte binary message from {:?}", buf.len(), peer);
                if let Some(session) = self.session_mut(peer) {
                    session.received_count += 1;
                }
            }
        }
    }

    async fn on_channel_command(&mut self, peer: &PeerId, text: &str) {
        match ChannelCommand::parse(text) {
            Ok(ChannelCommand::Configure(config)) => {
                // the transition decides whether the configuration is acceptable right
                //  now; a rejected one must not clobber a previously stored config
                if self.apply_channel_input(peer, ChannelInput::Configured) == Some(ChannelEffect::ReplyReady) {
                    info!("test configuration from {:?}: {:?}", peer, config);
                    if let Some(session) = self.session_mut(peer) {
                        session.test_config = Some(config);
                    }
                }
            }
            Ok(ChannelCommand::Start) => {
                let configured = self.session(peer).map(|s| s.test_config.is_some()).unwrap_or(false);
                self.apply_channel_input(peer, ChannelInput::Start { configured });
            }
            Err(e) => {
                warn!("rejecting channel command from {:?}: {}", peer, e);
                self.report_error(peer, format!("invalid command: {}", e)).await;
            }
        }
    }

    /// Runs one input through the transition function and performs the resulting effect.
    ///  Returns the effect so callers can act on acceptance vs rejection.
    fn apply_channel_input(&mut self, peer: &PeerId, input: ChannelInput) -> Option<ChannelEffect> {
        let effect = match self.session_mut(peer) {
            Some(session) => {
                let (next, effect) = channel_transition(session.channel_state, &input);
                trace!("channel state for {:?}: {:?} -> {:?} on {:?}", peer, session.channel_state, next, input);
                session.channel_state = next;
                effect
            }
            None => {
                debug!("channel input {:?} for defunct {:?} - ignoring", input, peer);
                return None;
            }
        };

        match effect {
            None => {}
            Some(ChannelEffect::ReplyReady) => self.confirm_configuration(peer),
            Some(ChannelEffect::StartRun) => self.start_configured_run(peer),
            Some(ChannelEffect::WarnOutOfOrder) => {
                warn!("out-of-order test protocol input {:?} from {:?} - ignoring", input, peer)
            }
            Some(ChannelEffect::ReleaseRun) => self.stop_run(peer, "channel closed or errored"),
        }
        effect
    }

    fn confirm_configuration(&mut self, peer: &PeerId) {
        let Some(session) = self.session(peer) else { return };
        match &session.channel {
            Some(channel) => {
                if let Err(e) = channel.send_text(READY_REPLY) {
                    warn!("confirming configuration to {:?} failed: {}", peer, e);
                }
            }
            None => warn!("configuration accepted for {:?} but no data channel exists", peer),
        }
    }

    fn start_configured_run(&mut self, peer: &PeerId) {
        let events = self.peer_events.clone();
        let Some(session) = self.session_mut(peer) else { return };
        let (Some(config), Some(channel)) = (session.test_config, session.channel.clone()) else {
            warn!("cannot start run for {:?}: configuration or channel missing", peer);
            return;
        };

        info!("starting run for {:?}: {} packets/s of {} bytes for {}s",
            peer, config.rate, config.packet_size, config.duration_secs);
        let handle = generator::start_run(session.peer.clone(), config, channel, session.transport.clone(), events);
        session.run = Some(handle);
    }

    fn stop_run(&mut self, peer: &PeerId, reason: &str) {
        if let Some(session) = self.session_mut(peer) {
            if let Some(run) = session.run.take() {
                debug!("releasing run timer for {:?}: {}", peer, reason);
                run.release();
            }
            session.test_config = None;
        }
    }

    fn on_run_finished(&mut self, peer: &PeerId, outcome: RunOutcome) {
        match &outcome {
            RunOutcome::Completed(report) => {
                info!("run for {:?} completed: {} messages, {} bytes", peer, report.messages_sent, report.bytes_sent)
            }
            RunOutcome::Aborted { frames_sent, reason } => {
                warn!("run for {:?} aborted after {} frames: {}", peer, frames_sent, reason)
            }
        }

        if let Some(session) = self.session_mut(peer) {
            if let RunOutcome::Completed(report) = &outcome {
                session.sent_count = report.messages_sent;
            }
            // the task has ended on its own; releasing the handle here keeps the
            // "exactly one release per timer" accounting uniform across all paths
            if let Some(run) = session.run.take() {
                run.release();
            }
            session.test_config = None;
        }
        self.apply_channel_input(peer, ChannelInput::Finished);
    }

    async fn report_error(&self, peer: &PeerId, data: String) {
        match self.control_of(peer) {
            Ok(control) => {
                if let Err(e) = control.send(&SignalMessage::Error { data }).await {
                    warn!("sending error to {:?} failed: {}", peer, e);
                }
            }
            Err(e) => warn!("{}", e),
        }
    }

    fn tear_down_session(&mut self, peer: &PeerId, reason: &str) {
        if let Some(session) = self.peers.get_mut(peer).and_then(|e| e.session.take()) {
            debug!("tearing down session for {:?}: {}", peer, reason);
            session.release();
        }
    }

    fn control_of(&self, peer: &PeerId) -> anyhow::Result<Arc<dyn ControlConnection>> {
        self.peers.get(peer)
            .map(|e| e.control.clone())
            .ok_or_else(|| anyhow::anyhow!("no control connection for {:?}", peer))
    }

    pub fn session(&self, peer: &PeerId) -> Option<&PeerSession> {
        self.peers.get(peer).and_then(|e| e.session.as_ref())
    }

    fn session_mut(&mut self, peer: &PeerId) -> Option<&mut PeerSession> {
        self.peers.get_mut(peer).and_then(|e| e.session.as_mut())
    }

    pub fn num_peers(&self) -> usize {
        self.peers.len()
    }

    pub fn num_sessions(&self) -> usize {
        self.peers.values().filter(|e| e.session.is_some()).count()
    }
}


#[cfg(test)]
mod test {
    use tokio::time::{advance, Duration};

    use crate::gateway::session::ChannelState;
    use crate::protocol::command::TestConfig;
    use crate::protocol::frame;
    use crate::test_util::{
        sample_candidate, sample_description, RecordingControlConnection, ScriptedTransportFactory,
    };
    use crate::transport::TransportStats;

    use super::*;

    struct Fixture {
        gateway: Gateway,
        factory: Arc<ScriptedTransportFactory>,
        control: Arc<RecordingControlConnection>,
        peer: PeerId,
        peer_events: PeerEventReceiver,
    }

    async fn fixture() -> Fixture {
        let (tx, rx) = mpsc::channel(64);
        let factory = ScriptedTransportFactory::new();
        let mut gateway = Gateway::new(factory.clone(), tx);
        let control = RecordingControlConnection::new();
        let peer = gateway.handle_connect(control.clone()).await;
        Fixture { gateway, factory, control, peer, peer_events: rx }
    }

    async fn negotiate(f: &mut Fixture) {
        let offer = SignalMessage::Offer { sdp: sample_description("offer") };
        f.gateway.handle_control_message(&f.peer, offer).await;
    }

    /// brings the fixture's session up to an open, configured data channel
    async fn open_channel(f: &mut Fixture) -> Arc<crate::test_util::RecordingDataChannel> {
        negotiate(f).await;
        let channel = crate::test_util::RecordingDataChannel::new(true);
        f.gateway.handle_peer_event(&f.peer, PeerEvent::DataChannelCreated(channel.clone())).await;
        f.gateway.handle_peer_event(&f.peer, PeerEvent::ChannelOpen).await;
        channel
    }

    #[tokio::test]
    async fn test_connect_assigns_identity_and_announces_it() {
        let f = fixture().await;

        assert_eq!(f.gateway.num_peers(), 1);
        assert_eq!(f.gateway.num_sessions(), 0);
        assert_eq!(f.control.sent_messages(), vec![SignalMessage::PeerId { peer_id: f.peer.clone() }]);
    }

    #[tokio::test]
    async fn test_offer_negotiates_and_answers() {
        let mut f = fixture().await;
        negotiate(&mut f).await;

        assert_eq!(f.gateway.num_sessions(), 1);
        let transport = f.factory.created().pop().unwrap();
        assert_eq!(transport.applied_remote_descriptions(), vec![sample_description("offer")]);

        let messages = f.control.sent_messages();
        assert_eq!(messages[1], SignalMessage::Answer { sdp: sample_description("answer") });
    }

    #[tokio::test]
    async fn test_candidates_flushed_as_one_batch_after_gathering() {
        let mut f = fixture().await;
        negotiate(&mut f).await;

        f.gateway.handle_peer_event(&f.peer, PeerEvent::CandidateGathered(sample_candidate(0))).await;
        f.gateway.handle_peer_event(&f.peer, PeerEvent::CandidateGathered(sample_candidate(1))).await;
        assert!(!f.control.sent_messages().iter().any(|m| matches!(m, SignalMessage::IceCandidate { .. })));

        f.gateway.handle_peer_event(&f.peer, PeerEvent::CandidateGatheringComplete).await;

        let last = f.control.sent_messages().pop().unwrap();
        assert_eq!(last, SignalMessage::IceCandidate { candidate: vec![sample_candidate(0), sample_candidate(1)] });
    }

    #[tokio::test]
    async fn test_remote_candidates_applied_in_order() {
        let mut f = fixture().await;
        negotiate(&mut f).await;

        let batch = SignalMessage::IceCandidate { candidate: vec![sample_candidate(2), sample_candidate(1)] };
        f.gateway.handle_control_message(&f.peer, batch).await;

        let transport = f.factory.created().pop().unwrap();
        assert_eq!(transport.added_candidates(), vec![sample_candidate(2), sample_candidate(1)]);
    }

    #[tokio::test]
    async fn test_remote_candidates_without_session_are_dropped() {
        let mut f = fixture().await;

        let batch = SignalMessage::IceCandidate { candidate: vec![sample_candidate(0)] };
        f.gateway.handle_control_message(&f.peer, batch).await;

        assert_eq!(f.factory.created_count(), 0);
        assert_eq!(f.gateway.num_sessions(), 0);
    }

    #[tokio::test]
    async fn test_superseding_offer_leaves_exactly_one_session() {
        let mut f = fixture().await;
        negotiate(&mut f).await;
        negotiate(&mut f).await;

        assert_eq!(f.factory.created_count(), 2);
        assert_eq!(f.gateway.num_sessions(), 1);

        let transports = f.factory.created();
        assert!(transports[0].is_closed());
        assert!(!transports[1].is_closed());
    }

    #[tokio::test]
    async fn test_terminal_connectivity_tears_down_session() {
        let mut f = fixture().await;
        negotiate(&mut f).await;

        f.gateway.handle_peer_event(&f.peer, PeerEvent::ConnectivityChanged(ConnectionState::Failed)).await;

        assert_eq!(f.gateway.num_sessions(), 0);
        assert_eq!(f.gateway.num_peers(), 1); // the control connection survives
        assert!(f.factory.created().pop().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_hangup_tears_down_session_but_keeps_control() {
        let mut f = fixture().await;
        negotiate(&mut f).await;

        f.gateway.handle_control_message(&f.peer, SignalMessage::Hangup).await;

        assert_eq!(f.gateway.num_sessions(), 0);
        assert_eq!(f.gateway.num_peers(), 1);
    }

    #[tokio::test]
    async fn test_control_close_removes_peer_entirely() {
        let mut f = fixture().await;
        negotiate(&mut f).await;

        f.gateway.handle_control_closed(&f.peer);

        assert_eq!(f.gateway.num_peers(), 0);
        assert!(f.factory.created().pop().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_configure_replies_ready() {
        let mut f = fixture().await;
        let channel = open_channel(&mut f).await;

        f.gateway.handle_peer_event(&f.peer, PeerEvent::ChannelMessage(ChannelMessage::Text("SEND 10 512 5".to_string()))).await;

        assert_eq!(channel.sent_texts(), vec![READY_REPLY.to_string()]);
        assert_eq!(f.gateway.session(&f.peer).unwrap().channel_state(), ChannelState::Opened);
        assert!(f.gateway.session(&f.peer).unwrap().test_config().is_some());
    }

    #[tokio::test]
    async fn test_invalid_configuration_reports_error_and_keeps_session() {
        let mut f = fixture().await;
        let channel = open_channel(&mut f).await;

        f.gateway.handle_peer_event(&f.peer, PeerEvent::ChannelMessage(ChannelMessage::Text("SEND 0 512 5".to_string()))).await;

        assert!(channel.sent_texts().is_empty());
        assert!(matches!(f.control.sent_messages().pop().unwrap(), SignalMessage::Error { .. }));
        assert_eq!(f.gateway.num_sessions(), 1);
        assert!(f.gateway.session(&f.peer).unwrap().test_config().is_none());
    }

    #[tokio::test]
    async fn test_configure_before_channel_open_stores_nothing() {
        let mut f = fixture().await;
        negotiate(&mut f).await;
        let channel = crate::test_util::RecordingDataChannel::new(true);
        f.gateway.handle_peer_event(&f.peer, PeerEvent::DataChannelCreated(channel.clone())).await;

        f.gateway.handle_peer_event(&f.peer, PeerEvent::ChannelMessage(ChannelMessage::Text("SEND 10 512 5".to_string()))).await;

        let session = f.gateway.session(&f.peer).unwrap();
        assert_eq!(session.channel_state(), ChannelState::New);
        assert!(session.test_config().is_none());
        assert!(channel.sent_texts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_configure_while_running_keeps_active_config() {
        let mut f = fixture().await;
        let channel = open_channel(&mut f).await;
        f.gateway.handle_peer_event(&f.peer, PeerEvent::ChannelMessage(ChannelMessage::Text("SEND 1 64 600".to_string()))).await;
        f.gateway.handle_peer_event(&f.peer, PeerEvent::ChannelMessage(ChannelMessage::Text("send start".to_string()))).await;

        f.gateway.handle_peer_event(&f.peer, PeerEvent::ChannelMessage(ChannelMessage::Text("SEND 99 512 5".to_string()))).await;

        let session = f.gateway.session(&f.peer).unwrap();
        assert_eq!(session.channel_state(), ChannelState::InProgress);
        assert_eq!(session.test_config(), Some(TestConfig { rate: 1, packet_size: 64, duration_secs: 600 }));
        assert!(session.has_live_run());
        assert_eq!(channel.sent_texts(), vec![READY_REPLY.to_string()]);
    }

    #[tokio::test]
    async fn test_start_without_configuration_is_a_no_op() {
        let mut f = fixture().await;
        open_channel(&mut f).await;

        f.gateway.handle_peer_event(&f.peer, PeerEvent::ChannelMessage(ChannelMessage::Text("send start".to_string()))).await;

        let session = f.gateway.session(&f.peer).unwrap();
        assert_eq!(session.channel_state(), ChannelState::Opened);
        assert!(!session.has_live_run());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_run_end_to_end() {
        let mut f = fixture().await;
        let channel = open_channel(&mut f).await;
        f.factory.created().pop().unwrap()
            .set_stats(TransportStats { messages_sent: 50, bytes_sent: 25600, ..Default::default() });

        f.gateway.handle_peer_event(&f.peer, PeerEvent::ChannelMessage(ChannelMessage::Text("SEND 10 512 5".to_string()))).await;
        f.gateway.handle_peer_event(&f.peer, PeerEvent::ChannelMessage(ChannelMessage::Text("send start".to_string()))).await;
        assert_eq!(f.gateway.session(&f.peer).unwrap().channel_state(), ChannelState::InProgress);
        assert!(f.gateway.session(&f.peer).unwrap().has_live_run());

        // the generator task runs on paused time; pump its completion event back in
        let (peer, event) = f.peer_events.recv().await.unwrap();
        assert_eq!(peer, f.peer);
        f.gateway.handle_peer_event(&peer, event).await;

        let frames = channel.sent_binaries();
        assert_eq!(frames.len(), 50);
        for (i, frame_buf) in frames.iter().enumerate() {
            assert_eq!(frame_buf.len(), 512);
            assert_eq!(frame::decode(frame_buf).unwrap().sequence_number as usize, i);
        }
        assert_eq!(channel.sent_texts().last().unwrap(), "SEND DONE 50 25600");

        let session = f.gateway.session(&f.peer).unwrap();
        assert_eq!(session.channel_state(), ChannelState::Closed);
        assert!(!session.has_live_run());
        assert!(session.test_config().is_none());
        assert_eq!(session.sent_count(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_close_mid_run_releases_timer() {
        let mut f = fixture().await;
        let channel = open_channel(&mut f).await;

        f.gateway.handle_peer_event(&f.peer, PeerEvent::ChannelMessage(ChannelMessage::Text("SEND 1 64 600".to_string()))).await;
        f.gateway.handle_peer_event(&f.peer, PeerEvent::ChannelMessage(ChannelMessage::Text("send start".to_string()))).await;
        assert!(f.gateway.session(&f.peer).unwrap().has_live_run());

        channel.set_open(false);
        f.gateway.handle_peer_event(&f.peer, PeerEvent::ChannelClosed).await;

        let session = f.gateway.session(&f.peer).unwrap();
        assert_eq!(session.channel_state(), ChannelState::Closed);
        assert!(!session.has_live_run());
        assert!(session.test_config().is_none());

        // the aborted task must not produce further traffic
        let before = channel.sent_binaries().len();
        advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert_eq!(channel.sent_binaries().len(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_leak_across_repeated_create_and_teardown() {
        let mut f = fixture().await;

        for i in 0..100 {
            let channel = open_channel(&mut f).await;
            f.gateway.handle_peer_event(&f.peer, PeerEvent::ChannelMessage(ChannelMessage::Text("SEND 1 64 600".to_string()))).await;
            f.gateway.handle_peer_event(&f.peer, PeerEvent::ChannelMessage(ChannelMessage::Text("send start".to_string()))).await;
            assert!(f.gateway.session(&f.peer).unwrap().has_live_run(), "cycle {}", i);

            f.gateway.handle_control_message(&f.peer, SignalMessage::Hangup).await;
            assert_eq!(f.gateway.num_sessions(), 0, "cycle {}", i);
            drop(channel);
        }

        assert_eq!(f.gateway.num_peers(), 1);
        assert_eq!(f.factory.created_count(), 100);
        assert!(f.factory.created().iter().all(|t| t.is_closed()));
    }
}
