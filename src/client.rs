//! The measuring side of a probe run: initiates the negotiation, drives the test
//!  protocol over the data channel, records every received frame with its local
//!  arrival time and derives the loss / delay report at the end.

use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

use crate::analyzer::{find_delayed_packets, find_missing_sequence_numbers, packet_loss_percent, ReceivedPacketRecord};
use crate::config::ProbeConfig;
use crate::protocol::command::{CompletionReport, TestConfig, DONE_PREFIX, READY_REPLY, START_COMMAND};
use crate::protocol::{frame, now_millis, ChannelMessage};
use crate::signaling::{IceCandidate, PeerId, SignalMessage};
use crate::transport::{
    ConnectionState, ControlConnection, DataChannel, PeerEvent, PeerEventSender, PeerTransport,
    PeerTransportFactory, TransportStats,
};
use crate::util::TimerHandle;


/// Where the client is in one run's lifecycle.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ClientPhase {
    Idle,
    Negotiating,
    WaitingReady,
    InProgress,
    /// the completion report arrived; the channel stays open a little longer for
    ///  packets still in transit
    Lingering,
    Closed,
}

/// The derived result of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub expected_total: u64,
    /// only populated once the run is closed - before that, gaps may still fill in
    pub missing: Vec<u16>,
    pub delayed: Vec<u16>,
    /// only meaningful once the run is closed, 0.0 before
    pub loss_percent: f64,
    pub completion: Option<CompletionReport>,
}

pub struct ProbeClient {
    config: Arc<ProbeConfig>,
    test_config: TestConfig,
    control: Arc<dyn ControlConnection>,
    factory: Arc<dyn PeerTransportFactory>,
    peer_events: PeerEventSender,
    peer_id: Option<PeerId>,
    transport: Option<Arc<dyn PeerTransport>>,
    channel: Option<Arc<dyn DataChannel>>,
    connection_state: ConnectionState,
    phase: ClientPhase,
    pending_candidates: Vec<IceCandidate>,
    records: Vec<ReceivedPacketRecord>,
    last_stats: Option<TransportStats>,
    completion: Option<CompletionReport>,
    linger: Option<TimerHandle>,
}
impl ProbeClient {
    pub fn new(
        config: Arc<ProbeConfig>,
        test_config: TestConfig,
        control: Arc<dyn ControlConnection>,
        factory: Arc<dyn PeerTransportFactory>,
        peer_events: PeerEventSender,
    ) -> ProbeClient {
        ProbeClient {
            config,
            test_config,
            control,
            factory,
            peer_events,
            peer_id: None,
            transport: None,
            channel: None,
            connection_state: ConnectionState::New,
            phase: ClientPhase::Idle,
            pending_candidates: Vec::new(),
            records: Vec::new(),
            last_stats: None,
            completion: None,
            linger: None,
        }
    }

    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    pub fn peer_id(&self) -> Option<&PeerId> {
        self.peer_id.as_ref()
    }

    pub fn records(&self) -> &[ReceivedPacketRecord] {
        &self.records
    }

    /// Starts a fresh run: creates the transport peer and the data channel, then sends
    ///  the offer. Any previous run's transport is torn down first, and its measurements
    ///  are discarded.
    pub async fn initiate_test(&mut self) -> anyhow::Result<()> {
        let Some(peer) = self.peer_id.clone() else {
            anyhow::bail!("cannot initiate a test before the gateway assigned a peer id");
        };

        self.tear_down("superseded by new test");
        self.records.clear();
        self.last_stats = None;
        self.completion = None;

        info!("initiating test as {:?}: {:?}", peer, self.test_config);
        let transport = self.factory.create(peer.clone(), self.peer_events.clone()).await?;
        let channel = transport.create_data_channel(self.config.channel_config()).await?;
        let offer = transport.create_offer().await?;

        self.transport = Some(transport);
        self.channel = Some(channel);
        self.phase = ClientPhase::Negotiating;
        self.control.send(&SignalMessage::Offer { sdp: offer }).await?;
        Ok(())
    }

    pub async fn handle_signal(&mut self, message: SignalMessage) {
        trace!("signaling message: {:?}", message);
        match message {
            SignalMessage::PeerId { peer_id } => {
                info!("gateway assigned {:?}", peer_id);
                self.peer_id = Some(peer_id);
            }
            SignalMessage::Answer { sdp } => {
                let Some(transport) = self.transport.clone() else {
                    warn!("answer without a pending offer - ignoring");
                    return;
                };
                if let Err(e) = transport.apply_remote_description(sdp).await {
                    error!("applying answer failed: {}", e);
                    self.tear_down("answer not applicable");
                }
            }
            SignalMessage::IceCandidate { candidate } => self.handle_remote_candidates(candidate).await,
            SignalMessage::Error { data } => {
                error!("gateway reported an error: {}", data);
                self.tear_down("error from gateway");
            }
            other => warn!("unexpected signaling message - ignoring: {:?}", other),
        }
    }

    async fn handle_remote_candidates(&mut self, candidates: Vec<IceCandidate>) {
        let Some(transport) = self.transport.clone() else {
            warn!("ICE candidates without a session - dropping");
            return;
        };
        if !transport.has_remote_description() {
            warn!("ICE candidates before the answer - dropping");
            return;
        }
        for candidate in candidates {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                warn!("applying ICE candidate failed: {}", e);
            }
        }
    }

    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        trace!("peer event: {:?}", event);
        match event {
            PeerEvent::ConnectivityChanged(state) => {
                info!("connectivity: {:?}", state);
                self.connection_state = state;
                if state.is_terminal() {
                    self.tear_down("transport connectivity terminal");
                }
            }
            PeerEvent::CandidateGathered(candidate) => self.pending_candidates.push(candidate),
            PeerEvent::CandidateGatheringComplete => self.flush_local_candidates().await,
            PeerEvent::ChannelOpen => self.send_configuration(),
            PeerEvent::ChannelMessage(ChannelMessage::Text(text)) => self.on_text_message(&text).await,
            PeerEvent::ChannelMessage(ChannelMessage::Binary(buf)) => self.on_frame(&buf),
            PeerEvent::ChannelClosed => self.on_channel_closed(),
            PeerEvent::ChannelError(e) => {
                warn!("data channel error: {}", e);
                self.on_channel_closed();
            }
            PeerEvent::DataChannelCreated(_) => {
                // the client created its channel itself, this announces the same handle
                debug!("ignoring data channel announcement");
            }
            PeerEvent::RunFinished(_) => debug!("ignoring run outcome event on the measuring side"),
        }
    }

    async fn flush_local_candidates(&mut self) {
        let batch = std::mem::take(&mut self.pending_candidates);
        debug!("flushing {} local candidates", batch.len());
        if let Err(e) = self.control.send(&SignalMessage::IceCandidate { candidate: batch }).await {
            warn!("sending candidate batch failed: {}", e);
        }
    }

    fn send_configuration(&mut self) {
        let Some(channel) = &self.channel else {
            warn!("channel opened but no handle is held - ignoring");
            return;
        };
        let command = self.test_config.command_line();
        info!("channel open, requesting run: {}", command);
        match channel.send_text(&command) {
            Ok(()) => self.phase = ClientPhase::WaitingReady,
            Err(e) => {
                error!("sending test configuration failed: {}", e);
                self.tear_down("configuration not deliverable");
            }
        }
    }

    async fn on_text_message(&mut self, text: &str) {
        if text == READY_REPLY {
            let Some(channel) = &self.channel else { return };
            info!("gateway is ready, starting run");
            match channel.send_text(START_COMMAND) {
                Ok(()) => self.phase = ClientPhase::InProgress,
                Err(e) => {
                    error!("sending start command failed: {}", e);
                    self.tear_down("start command not deliverable");
                }
            }
            return;
        }

        if text.starts_with(DONE_PREFIX) {
            match CompletionReport::parse(text) {
                Some(report) => self.on_completion(report).await,
                None => warn!("unparseable completion report - ignoring: {:?}", text),
            }
            return;
        }

        warn!("unexpected text message on the data channel - ignoring: {:?}", text);
    }

    /// The sender is done. The channel stays open for a linger period so packets still
    ///  in transit are counted before the loss figures are frozen.
    async fn on_completion(&mut self, report: CompletionReport) {
        info!("sender reports completion: {} messages, {} bytes", report.messages_sent, report.bytes_sent);
        self.completion = Some(report);
        self.phase = ClientPhase::Lingering;
        self.refresh_stats().await;

        let events = self.peer_events.clone();
        let peer = self.peer_id.clone().unwrap_or_default();
        let linger = self.config.completion_linger;
        let task = tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            let _ = events.send((peer, PeerEvent::ChannelClosed)).await;
        });
        if let Some(previous) = self.linger.replace(TimerHandle::new(task)) {
            previous.release();
        }
    }

    fn on_frame(&mut self, buf: &[u8]) {
        match frame::decode(buf) {
            Ok(header) => {
                trace!("frame {} received", header.sequence_number);
                self.records.push(ReceivedPacketRecord {
                    sequence_number: header.sequence_number,
                    send_timestamp_millis: header.send_timestamp_millis,
                    received_at_millis: now_millis(),
                });
            }
            Err(e) => warn!("undecodable frame - ignoring: {}", e),
        }
    }

    fn on_channel_closed(&mut self) {
        if self.phase == ClientPhase::Closed {
            return;
        }
        info!("run closed with {} frames recorded", self.records.len());
        self.phase = ClientPhase::Closed;
        if let Some(linger) = self.linger.take() {
            linger.release();
        }
    }

    /// Pulls a fresh counter snapshot from the transport. The received-message counter
    ///  is authoritative for the loss figure, the local record list is not (it would
    ///  count duplicates).
    pub async fn refresh_stats(&mut self) {
        let Some(transport) = &self.transport else { return };
        match transport.stats().await {
            Ok(stats) => self.last_stats = Some(stats),
            Err(e) => warn!("statistics unavailable: {}", e),
        }
    }

    /// Derives the loss / delay figures from the current state. Delay is computed
    ///  continuously; missing packets and the loss percentage only once the run is
    ///  closed, because gaps may still fill in while packets are in transit.
    pub fn report(&self) -> RunReport {
        let expected_total = self.test_config.expected_total();
        let closed = self.phase == ClientPhase::Closed;

        let missing = if closed {
            find_missing_sequence_numbers(expected_total, self.records.iter().map(|r| r.sequence_number))
        } else {
            Vec::new()
        };
        let loss_percent = if closed {
            let received = self.last_stats
                .map(|s| s.messages_received)
                .unwrap_or(self.records.len() as u64);
            packet_loss_percent(expected_total, received)
        } else {
            0.0
        };

        RunReport {
            expected_total,
            missing,
            delayed: find_delayed_packets(&self.records, self.config.acceptable_delay.as_millis() as i64),
            loss_percent,
            completion: self.completion.clone(),
        }
    }

    /// Drops the transport and all timers. Measurements survive so a report can still
    ///  be derived after the fact.
    pub fn tear_down(&mut self, reason: &str) {
        if let Some(linger) = self.linger.take() {
            linger.release();
        }
        if let Some(transport) = self.transport.take() {
            debug!("closing transport: {}", reason);
            transport.close();
        }
        self.channel = None;
        self.pending_candidates.clear();
        if self.phase != ClientPhase::Idle {
            self.phase = ClientPhase::Closed;
        }
    }
}
