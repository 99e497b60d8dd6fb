//! The timer-driven traffic generator: emits `rate` frames per one-second tick until
//!  `rate * duration_secs` frames are out, then reports the transport's authoritative
//!  counters and ends. Pacing in one-second batches bounds timer overhead to
//!  O(duration) instead of O(total packets); sub-second jitter within a batch is an
//!  accepted trade-off.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::protocol::command::{CompletionReport, TestConfig};
use crate::protocol::frame;
use crate::signaling::PeerId;
use crate::transport::{DataChannel, PeerEvent, PeerEventSender, PeerTransport, RunOutcome};
use crate::util::TimerHandle;


/// Spawns the paced run as a task and hands ownership of its timer to the caller. The
///  outcome is reported through the peer event stream so the session state machine sees
///  completion and abort the same way it sees transport events.
pub fn start_run(
    peer: PeerId,
    config: TestConfig,
    channel: Arc<dyn DataChannel>,
    transport: Arc<dyn PeerTransport>,
    events: PeerEventSender,
) -> TimerHandle {
    let task = tokio::spawn(async move {
        let outcome = transmit(&config, channel.as_ref(), transport.as_ref()).await;
        let _ = events.send((peer, PeerEvent::RunFinished(outcome))).await;
    });
    TimerHandle::new(task)
}

/// The generator loop itself. Termination is decided from the running frame count
///  against the target, not from a tick counter, so a slow consumer does not shorten
///  the run. Any send failure aborts the run - in-flight packets on an unreliable
///  channel are not recoverable, so there is nothing to retry.
pub async fn transmit(config: &TestConfig, channel: &dyn DataChannel, transport: &dyn PeerTransport) -> RunOutcome {
    let target = config.expected_total();
    let mut ticker = interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut sent: u64 = 0;
    loop {
        ticker.tick().await;

        if !channel.is_open() {
            warn!("data channel no longer open, aborting run after {} frames", sent);
            return RunOutcome::Aborted {
                frames_sent: sent,
                reason: "data channel not open".to_string(),
            };
        }

        if sent >= target {
            let stats = match transport.stats().await {
                Ok(stats) => stats,
                Err(e) => {
                    warn!("statistics unavailable at end of run: {}", e);
                    return RunOutcome::Aborted {
                        frames_sent: sent,
                        reason: format!("statistics unavailable: {}", e),
                    };
                }
            };

            let report = CompletionReport {
                messages_sent: stats.messages_sent,
                bytes_sent: stats.bytes_sent,
            };
            if let Err(e) = channel.send_text(&report.format()) {
                warn!("sending completion report failed: {}", e);
                return RunOutcome::Aborted {
                    frames_sent: sent,
                    reason: format!("sending completion report failed: {}", e),
                };
            }

            info!("run complete: {} messages, {} bytes per transport statistics", report.messages_sent, report.bytes_sent);
            return RunOutcome::Completed(report);
        }

        for _ in 0..config.rate {
            let frame = match frame::encode(sent as u16, config.packet_size) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("frame construction failed after {} frames: {}", sent, e);
                    return RunOutcome::Aborted { frames_sent: sent, reason: e.to_string() };
                }
            };
            if let Err(e) = channel.send_binary(frame) {
                warn!("send failed mid-run after {} frames: {}", sent, e);
                return RunOutcome::Aborted { frames_sent: sent, reason: e.to_string() };
            }
            sent += 1;
        }
        debug!("sent batch, {} of {} frames out", sent, target);
    }
}
