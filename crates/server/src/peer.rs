use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use rtpcast_protocol::{
    ClosePayload, IceConfig, SignalFrame, SignalKind, close_code,
};
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::channel::SignalChannel;
use crate::latch::CloseLatch;
use crate::stream::Stream;

/// Why a peer was torn down. Mirrored into the WebSocket close frame where
/// the transport still allows it.
#[derive(Debug, Clone)]
pub struct PeerClose {
    pub code: u16,
    pub reason: String,
}

/// What to do with an inbound offer, following the perfect-negotiation
/// pattern: the impolite side ignores colliding offers, the polite side
/// rolls back its own outstanding offer first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OfferAction {
    Accept,
    Ignore,
    Rollback,
}

fn offer_collision_action(
    polite: bool,
    making_offer: bool,
    state: RTCSignalingState,
) -> OfferAction {
    let collision = making_offer || state != RTCSignalingState::Stable;
    if !collision {
        OfferAction::Accept
    } else if polite {
        OfferAction::Rollback
    } else {
        OfferAction::Ignore
    }
}

/// Shared core of a peer, reachable from the dispatch loop, the per-track
/// pumps and the WebRTC callbacks (the callbacks hold it weakly so the
/// session does not keep itself alive).
struct PeerShared {
    id: Uuid,
    pc: Arc<RTCPeerConnection>,
    channel: Arc<SignalChannel>,
    latch: Arc<CloseLatch<PeerClose>>,
    /// Serializes SDP and candidate emission so a partial offer/answer can
    /// never interleave with candidates emitted from another task.
    write_lock: Mutex<()>,
    making_offer: AtomicBool,
    polite: bool,
    /// Fires when teardown has finished releasing every resource.
    done: Arc<CloseLatch<()>>,
}

impl PeerShared {
    fn close(&self, code: u16, reason: impl Into<String>) {
        let reason = reason.into();
        if self.latch.trigger(PeerClose {
            code,
            reason: reason.clone(),
        }) {
            tracing::warn!(id = %self.id, code, %reason, "closing peer");
        }
    }

    async fn dispatch(&self, frame: SignalFrame) {
        match frame.kind() {
            Some(SignalKind::Offer) => {
                tracing::debug!(id = %self.id, "received offer");
                if let Err(e) = self.handle_offer(&frame).await {
                    tracing::error!(id = %self.id, "offer failed: {e:#}");
                    self.close(close_code::POLICY_VIOLATION, "failed to handle offer");
                }
            }
            Some(SignalKind::Answer) => {
                tracing::debug!(id = %self.id, "received answer");
                if let Err(e) = self.handle_answer(&frame).await {
                    tracing::error!(id = %self.id, "answer failed: {e:#}");
                    self.close(close_code::POLICY_VIOLATION, "failed to handle answer");
                }
            }
            Some(SignalKind::Candidate) => {
                if let Err(e) = self.handle_candidate(&frame).await {
                    tracing::error!(id = %self.id, "candidate failed: {e:#}");
                    self.close(close_code::POLICY_VIOLATION, "failed to parse candidate");
                }
            }
            Some(SignalKind::Close) => {
                tracing::debug!(id = %self.id, "remote peer requested close");
                self.close(close_code::NORMAL_CLOSURE, "remote peer requested close");
            }
            None => {
                tracing::warn!(id = %self.id, name = %frame.name, "unrecognized signal, dropping");
            }
        }
    }

    async fn handle_offer(&self, frame: &SignalFrame) -> Result<()> {
        let offer: RTCSessionDescription =
            frame.payload().context("failed to parse offer")?;
        if offer.sdp_type != RTCSdpType::Offer {
            bail!("offer signal carried a {} description", offer.sdp_type);
        }

        let _guard = self.write_lock.lock().await;
        match offer_collision_action(
            self.polite,
            self.making_offer.load(Ordering::Acquire),
            self.pc.signaling_state(),
        ) {
            OfferAction::Ignore => {
                tracing::debug!(id = %self.id, "offer collision, ignoring (impolite)");
                return Ok(());
            }
            OfferAction::Rollback => {
                tracing::debug!(id = %self.id, "offer collision, rolling back (polite)");
                let mut rollback = RTCSessionDescription::default();
                rollback.sdp_type = RTCSdpType::Rollback;
                self.pc
                    .set_local_description(rollback)
                    .await
                    .context("rollback failed")?;
            }
            OfferAction::Accept => {}
        }

        self.pc
            .set_remote_description(offer)
            .await
            .context("failed to set remote offer")?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .context("failed to create answer")?;
        self.pc
            .set_local_description(answer)
            .await
            .context("failed to set local answer")?;
        let local = self
            .pc
            .local_description()
            .await
            .context("no local description after answer")?;
        self.channel
            .send(SignalFrame::new(SignalKind::Answer, &local)?)
            .await
            .context("failed to send answer")?;
        Ok(())
    }

    async fn handle_answer(&self, frame: &SignalFrame) -> Result<()> {
        if self.pc.signaling_state() != RTCSignalingState::HaveLocalOffer {
            bail!(
                "answer received in state {}, not expecting one",
                self.pc.signaling_state()
            );
        }
        let answer: RTCSessionDescription =
            frame.payload().context("failed to parse answer")?;
        if answer.sdp_type != RTCSdpType::Answer {
            bail!("answer signal carried a {} description", answer.sdp_type);
        }
        self.pc
            .set_remote_description(answer)
            .await
            .context("failed to set remote answer")?;
        Ok(())
    }

    async fn handle_candidate(&self, frame: &SignalFrame) -> Result<()> {
        let candidate: RTCIceCandidateInit =
            frame.payload().context("failed to parse candidate")?;
        self.pc
            .add_ice_candidate(candidate)
            .await
            .context("failed to add candidate")?;
        Ok(())
    }

    /// Produce and send an offer; runs on every negotiation-needed callback.
    async fn negotiate(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.making_offer.store(true, Ordering::Release);
        let result = async {
            let offer = self
                .pc
                .create_offer(None)
                .await
                .context("failed to create offer")?;
            self.pc
                .set_local_description(offer)
                .await
                .context("failed to set local offer")?;
            let local = self
                .pc
                .local_description()
                .await
                .context("no local description after offer")?;
            self.channel
                .send(SignalFrame::new(SignalKind::Offer, &local)?)
                .await
                .context("failed to send offer")?;
            Ok(())
        }
        .await;
        self.making_offer.store(false, Ordering::Release);
        result
    }

    async fn emit_candidate(&self, candidate: RTCIceCandidate) {
        let init = match candidate.to_json() {
            Ok(init) => init,
            Err(e) => {
                tracing::warn!(id = %self.id, "failed to serialize candidate: {e}");
                return;
            }
        };
        let _guard = self.write_lock.lock().await;
        let frame = match SignalFrame::new(SignalKind::Candidate, &init) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(id = %self.id, "failed to encode candidate: {e}");
                return;
            }
        };
        if self.channel.send(frame).await.is_err() {
            self.close(close_code::INTERNAL_ERROR, "failed to send candidate");
        }
    }
}

/// A lightweight reference the registry keeps per peer: enough to close it
/// and to observe its termination, nothing more.
#[derive(Clone)]
pub struct PeerHandle {
    id: Uuid,
    latch: Arc<CloseLatch<PeerClose>>,
    done: Arc<CloseLatch<()>>,
}

impl PeerHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn close(&self, code: u16, reason: impl Into<String>) {
        self.latch.trigger(PeerClose {
            code,
            reason: reason.into(),
        });
    }

    pub async fn closed(&self) -> PeerClose {
        self.latch.triggered().await.clone()
    }

    /// Wait until teardown has released every resource the peer held.
    pub async fn done(&self) {
        self.done.triggered().await;
    }

    #[cfg(test)]
    pub(crate) fn stub() -> Self {
        Self {
            id: Uuid::new_v4(),
            latch: Arc::new(CloseLatch::new()),
            done: Arc::new(CloseLatch::new()),
        }
    }
}

/// One remote WebRTC endpoint: a signaling channel, a peer connection and a
/// subscription into every stream's fan-out.
pub struct RelayPeer {
    shared: Arc<PeerShared>,
    subscriptions: Vec<(Arc<Stream>, Uuid)>,
}

impl RelayPeer {
    /// Build the WebRTC session for an accepted signaling channel and attach
    /// it to every stream. Attachment is best-effort transactional: if any
    /// subscription or track fails, everything attached so far is released
    /// and the error is returned.
    pub async fn connect(
        channel: Arc<SignalChannel>,
        inbound: mpsc::Receiver<SignalFrame>,
        streams: &[Arc<Stream>],
        polite: bool,
        ice: &IceConfig,
    ) -> Result<RelayPeer> {
        let pc = build_peer_connection(ice).await?;
        let shared = Arc::new(PeerShared {
            id: Uuid::new_v4(),
            pc,
            channel,
            latch: Arc::new(CloseLatch::new()),
            write_lock: Mutex::new(()),
            making_offer: AtomicBool::new(false),
            polite,
            done: Arc::new(CloseLatch::new()),
        });
        tracing::info!(id = %shared.id, polite, "new peer");

        register_callbacks(&shared);

        let mut subscriptions: Vec<(Arc<Stream>, Uuid)> = Vec::with_capacity(streams.len());
        for stream in streams {
            match attach_stream(&shared, stream).await {
                Ok(consumer) => subscriptions.push((Arc::clone(stream), consumer)),
                Err(e) => {
                    for (stream, consumer) in &subscriptions {
                        stream.unsubscribe(*consumer);
                    }
                    shared.close(close_code::INTERNAL_ERROR, "failed to attach streams");
                    let _ = shared.pc.close().await;
                    return Err(e.context(format!("failed to attach stream {}", stream.key())));
                }
            }
        }

        tokio::spawn(dispatch_loop(Arc::clone(&shared), inbound));

        Ok(RelayPeer {
            shared,
            subscriptions,
        })
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn handle(&self) -> PeerHandle {
        PeerHandle {
            id: self.shared.id,
            latch: Arc::clone(&self.shared.latch),
            done: Arc::clone(&self.shared.done),
        }
    }

    pub fn close(&self, code: u16, reason: impl Into<String>) {
        self.shared.close(code, reason);
    }

    pub async fn closed(&self) -> PeerClose {
        self.shared.latch.triggered().await.clone()
    }

    /// Release every resource the peer holds. Streams are unsubscribed
    /// before the channel and session close, so the fan-out never pushes
    /// into a queue whose consumer is gone.
    pub async fn teardown(&self) {
        let close = self
            .shared
            .latch
            .reason()
            .cloned()
            .unwrap_or_else(|| PeerClose {
                code: close_code::NORMAL_CLOSURE,
                reason: "peer torn down".to_string(),
            });

        for (stream, consumer) in &self.subscriptions {
            stream.unsubscribe(*consumer);
        }

        // Symmetric close signal, best-effort: the transport may already be
        // gone when the peer closes because of a transport error.
        let payload = Some(ClosePayload {
            code: close.code,
            reason: close.reason.clone(),
        });
        if let Ok(frame) = SignalFrame::new(SignalKind::Close, &payload) {
            let _ = self.shared.channel.send(frame).await;
        }
        self.shared.channel.close(close.code, close.reason.clone());
        self.shared.channel.done().await;

        if let Err(e) = self.shared.pc.close().await {
            tracing::warn!(id = %self.shared.id, "error closing peer connection: {e}");
        }
        self.shared.done.trigger(());
        tracing::info!(id = %self.shared.id, code = close.code, reason = %close.reason, "peer torn down");
    }
}

async fn build_peer_connection(ice: &IceConfig) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .context("failed to register codecs")?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .context("failed to register interceptors")?;
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let ice_servers = if ice.stun_urls.is_empty() {
        Vec::new()
    } else {
        vec![RTCIceServer {
            urls: ice.stun_urls.clone(),
            ..Default::default()
        }]
    };
    let config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };

    let pc = api
        .new_peer_connection(config)
        .await
        .context("failed to create peer connection")?;
    Ok(Arc::new(pc))
}

/// Wire the WebRTC stack callbacks. They hold the peer weakly: once the
/// manager drops the peer, callbacks become no-ops instead of keeping the
/// session alive.
fn register_callbacks(shared: &Arc<PeerShared>) {
    let weak = Arc::downgrade(shared);
    shared.pc.on_negotiation_needed(Box::new(move || {
        let weak = weak.clone();
        Box::pin(async move {
            let Some(shared) = weak.upgrade() else { return };
            tracing::debug!(id = %shared.id, "negotiation needed");
            if let Err(e) = shared.negotiate().await {
                tracing::error!(id = %shared.id, "negotiation failed: {e:#}");
                shared.close(close_code::INTERNAL_ERROR, "negotiation failed");
            }
        })
    }));

    let weak = Arc::downgrade(shared);
    shared.pc.on_ice_candidate(Box::new(move |candidate| {
        let weak = weak.clone();
        Box::pin(async move {
            let Some(shared) = weak.upgrade() else { return };
            match candidate {
                Some(candidate) => shared.emit_candidate(candidate).await,
                // end of candidates
                None => tracing::debug!(id = %shared.id, "candidate gathering complete"),
            }
        })
    }));

    let weak = Arc::downgrade(shared);
    shared
        .pc
        .on_peer_connection_state_change(Box::new(move |state| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(shared) = weak.upgrade() else { return };
                // Failed is logged, not fatal: a renegotiation from the
                // remote side can restart ICE and recover the session.
                tracing::info!(id = %shared.id, %state, "connection state changed");
            })
        }));

    // The relay never consumes remote media; drain anything a peer sends so
    // the receive side of the stack keeps pumping.
    shared.pc.on_track(Box::new(move |track, _, _| {
        Box::pin(async move {
            tracing::debug!(kind = %track.kind(), "draining unexpected remote track");
            tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
        })
    }));
}

/// Subscribe to one stream and pump its datagrams into a fresh local track.
/// Returns the fan-out consumer id for later unsubscription.
async fn attach_stream(shared: &Arc<PeerShared>, stream: &Arc<Stream>) -> Result<Uuid> {
    let (consumer, queue) = stream.subscribe();

    let track = Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: stream.codec().mime_type.clone(),
            clock_rate: stream.codec().clock_rate,
            ..Default::default()
        },
        stream.track_id().to_string(),
        stream.stream_group().to_string(),
    ));

    let sender = match shared
        .pc
        .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
    {
        Ok(sender) => sender,
        Err(e) => {
            stream.unsubscribe(consumer);
            return Err(e).context("failed to add track");
        }
    };

    tokio::spawn(sender_drain(sender, Arc::clone(shared)));
    tokio::spawn(track_writer(queue, track, Arc::clone(shared)));

    tracing::debug!(id = %shared.id, stream = %stream.key(), %consumer, "track attached");
    Ok(consumer)
}

/// Consume inbound signal frames until the channel ends or the peer closes.
async fn dispatch_loop(shared: Arc<PeerShared>, mut inbound: mpsc::Receiver<SignalFrame>) {
    loop {
        tokio::select! {
            frame = inbound.recv() => match frame {
                Some(frame) => shared.dispatch(frame).await,
                None => {
                    let reason = shared
                        .channel
                        .reason()
                        .map(|r| r.reason)
                        .unwrap_or_else(|| "signal channel ended".to_string());
                    shared.close(close_code::NORMAL_CLOSURE, reason);
                    break;
                }
            },
            _ = shared.latch.triggered() => break,
        }
    }
    tracing::debug!(id = %shared.id, "dispatch loop stopped");
}

/// Keep reading RTCP feedback from the sender so the interceptor pipeline
/// runs; any terminal read error closes the peer.
async fn sender_drain(sender: Arc<RTCRtpSender>, shared: Arc<PeerShared>) {
    loop {
        tokio::select! {
            result = sender.read_rtcp() => {
                if let Err(e) = result {
                    tracing::debug!(id = %shared.id, "rtcp read ended: {e}");
                    shared.close(close_code::INTERNAL_ERROR, "sender feedback ended");
                    break;
                }
            }
            _ = shared.latch.triggered() => break,
        }
    }
}

/// Pump fan-out datagrams into the local track until the queue closes or a
/// write fails.
async fn track_writer(
    mut queue: mpsc::Receiver<Bytes>,
    track: Arc<TrackLocalStaticRTP>,
    shared: Arc<PeerShared>,
) {
    loop {
        tokio::select! {
            datagram = queue.recv() => match datagram {
                Some(datagram) => {
                    if let Err(e) = track.write(&datagram).await {
                        tracing::debug!(id = %shared.id, "track write failed: {e}");
                        shared.close(close_code::INTERNAL_ERROR, "failed to write track");
                        break;
                    }
                }
                None => {
                    shared.close(close_code::GOING_AWAY, "stream ended");
                    break;
                }
            },
            _ = shared.latch.triggered() => break,
        }
    }
    tracing::debug!(id = %shared.id, "track writer stopped");
}
