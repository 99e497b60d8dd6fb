//! Recording and scripted stand-ins for the external collaborators (transport peer,
//!  data channel, control connection). They are used for testing the gateway and
//!  client logic in this crate, and they are exported for application testing against
//!  the same traits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;

use crate::signaling::{IceCandidate, PeerId, SessionDescription, SignalMessage};
use crate::transport::{
    ChannelConfig, ControlConnection, DataChannel, PeerEventSender, PeerTransport,
    PeerTransportFactory, TransportStats,
};


pub fn sample_description(kind: &str) -> SessionDescription {
    SessionDescription {
        kind: kind.to_string(),
        sdp: format!("v=0\r\no=- scripted {}", kind),
    }
}

pub fn sample_candidate(n: u16) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{} 1 udp 2122260223 192.0.2.1 54555 typ host", n),
        sdp_mid: Some("0".to_string()),
        sdp_m_line_index: Some(n),
    }
}


/// A [DataChannel] that records everything sent through it.
pub struct RecordingDataChannel {
    open: AtomicBool,
    failing: AtomicBool,
    texts: Mutex<Vec<String>>,
    binaries: Mutex<Vec<Bytes>>,
}
impl RecordingDataChannel {
    pub fn new(open: bool) -> Arc<RecordingDataChannel> {
        Arc::new(RecordingDataChannel {
            open: AtomicBool::new(open),
            failing: AtomicBool::new(false),
            texts: Default::default(),
            binaries: Default::default(),
        })
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }

    pub fn sent_binaries(&self) -> Vec<Bytes> {
        self.binaries.lock().unwrap().clone()
    }
}
impl DataChannel for RecordingDataChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send_text(&self, text: &str) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("scripted send failure");
        }
        self.texts.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn send_binary(&self, frame: Bytes) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("scripted send failure");
        }
        self.binaries.lock().unwrap().push(frame);
        Ok(())
    }
}


/// A [PeerTransport] with scripted answers that records what was applied to it.
pub struct ScriptedPeerTransport {
    has_remote: AtomicBool,
    closed: AtomicBool,
    stats_failing: AtomicBool,
    stats: Mutex<TransportStats>,
    applied_remote: Mutex<Vec<SessionDescription>>,
    added_candidates: Mutex<Vec<IceCandidate>>,
    channel: Mutex<Option<Arc<RecordingDataChannel>>>,
}
impl ScriptedPeerTransport {
    pub fn new() -> Arc<ScriptedPeerTransport> {
        Arc::new(ScriptedPeerTransport {
            has_remote: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stats_failing: AtomicBool::new(false),
            stats: Default::default(),
            applied_remote: Default::default(),
            added_candidates: Default::default(),
            channel: Default::default(),
        })
    }

    pub fn set_stats(&self, stats: TransportStats) {
        *self.stats.lock().unwrap() = stats;
    }

    pub fn fail_stats(&self, failing: bool) {
        self.stats_failing.store(failing, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn applied_remote_descriptions(&self) -> Vec<SessionDescription> {
        self.applied_remote.lock().unwrap().clone()
    }

    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        self.added_candidates.lock().unwrap().clone()
    }

    /// the channel handed out by [PeerTransport::create_data_channel], if any
    pub fn created_channel(&self) -> Option<Arc<RecordingDataChannel>> {
        self.channel.lock().unwrap().clone()
    }
}
#[async_trait]
impl PeerTransport for ScriptedPeerTransport {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        Ok(sample_description("offer"))
    }

    async fn apply_remote_description(&self, description: SessionDescription) -> anyhow::Result<()> {
        self.applied_remote.lock().unwrap().push(description);
        self.has_remote.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        Ok(sample_description("answer"))
    }

    fn has_remote_description(&self) -> bool {
        self.has_remote.load(Ordering::SeqCst)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()> {
        self.added_candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn create_data_channel(&self, _config: ChannelConfig) -> anyhow::Result<Arc<dyn DataChannel>> {
        let channel = RecordingDataChannel::new(true);
        *self.channel.lock().unwrap() = Some(channel.clone());
        Ok(channel)
    }

    async fn stats(&self) -> anyhow::Result<TransportStats> {
        if self.stats_failing.load(Ordering::SeqCst) {
            bail!("scripted statistics failure");
        }
        Ok(*self.stats.lock().unwrap())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}


/// A [PeerTransportFactory] handing out [ScriptedPeerTransport]s and keeping track of
///  every transport it created, so tests can assert against superseded instances.
#[derive(Default)]
pub struct ScriptedTransportFactory {
    created: Mutex<Vec<Arc<ScriptedPeerTransport>>>,
}
impl ScriptedTransportFactory {
    pub fn new() -> Arc<ScriptedTransportFactory> {
        Arc::new(Default::default())
    }

    pub fn created(&self) -> Vec<Arc<ScriptedPeerTransport>> {
        self.created.lock().unwrap().clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}
#[async_trait]
impl PeerTransportFactory for ScriptedTransportFactory {
    async fn create(&self, _peer: PeerId, _events: PeerEventSender) -> anyhow::Result<Arc<dyn PeerTransport>> {
        let transport = ScriptedPeerTransport::new();
        self.created.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}


/// A [ControlConnection] that records every signaling message sent over it.
#[derive(Default)]
pub struct RecordingControlConnection {
    messages: Mutex<Vec<SignalMessage>>,
}
impl RecordingControlConnection {
    pub fn new() -> Arc<RecordingControlConnection> {
        Arc::new(Default::default())
    }

    pub fn sent_messages(&self) -> Vec<SignalMessage> {
        self.messages.lock().unwrap().clone()
    }
}
#[async_trait]
impl ControlConnection for RecordingControlConnection {
    async fn send(&self, message: &SignalMessage) -> anyhow::Result<()> {
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}
