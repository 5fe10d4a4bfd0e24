//! Per-peer worker: negotiates one WebRTC connection and owns it until it
//! closes.
//!
//! Lifecycle:
//! ```text
//! Idle → Connecting ──negotiate()──► Open ──steady()──► Closed
//!           │                          │
//!           └──── failure/timeout ─────┴──────────────► Error
//! ```
//!
//! WebRTC callbacks never touch the worker. They push [`LinkSignal`]s and
//! inbound text into channels, holding at most a `Weak` to the data channel.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::signaling::SignalingChannel;
use super::{ChannelSlot, ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionState, InboundText, Shared};
use crate::identity::{PeerIdentity, PeerKey};
use crate::protocol::{ProtocolError, SignalFrame, DATA_CHANNEL_LABEL};

const RTCP_BUFFER: usize = 1500;

/// Which side opened signaling.
pub(crate) enum Role {
    Outbound,
    Inbound(SignalingChannel),
}

/// Requests from the manager to an Open peer.
pub(crate) enum PeerCommand {
    AttachAudio {
        track: Arc<TrackLocalStaticSample>,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    DetachAudio {
        reply: oneshot::Sender<()>,
    },
}

/// Notifications from WebRTC callbacks.
enum LinkSignal {
    ChannelOpen(Arc<RTCDataChannel>),
    ChannelClosed,
    PeerState(RTCPeerConnectionState),
    RemoteTrack(bool),
}

enum Step {
    Command(Option<PeerCommand>),
    Frame(Option<SignalFrame>),
    Link(Option<LinkSignal>),
}

/// Network resources, filled in as negotiation progresses.
#[derive(Default)]
struct Session {
    signaling: Option<SignalingChannel>,
    pc: Option<Arc<RTCPeerConnection>>,
    audio: Option<Arc<RTCRtpSender>>,
}

pub(crate) struct PeerActor {
    shared: Arc<Shared>,
    peer: PeerIdentity,
    generation: u64,
    state_tx: watch::Sender<ConnectionState>,
    channel: ChannelSlot,
    commands: mpsc::Receiver<PeerCommand>,
    cancel: CancellationToken,
    remote_audio: bool,
}

impl PeerActor {
    pub(crate) fn new(
        shared: Arc<Shared>,
        peer: PeerIdentity,
        generation: u64,
        state_tx: watch::Sender<ConnectionState>,
        channel: ChannelSlot,
        commands: mpsc::Receiver<PeerCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared,
            peer,
            generation,
            state_tx,
            channel,
            commands,
            cancel,
            remote_audio: false,
        }
    }

    pub(crate) async fn run(mut self, role: Role) {
        self.transition(ConnectionState::Connecting, None);

        let cancel = self.cancel.clone();
        let (signals_tx, mut signals) = mpsc::unbounded_channel();
        let mut session = Session::default();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.drive(role, &mut session, signals_tx, &mut signals) => Some(result),
        };

        self.teardown(session, outcome).await;
    }

    async fn drive(
        &mut self,
        role: Role,
        session: &mut Session,
        signals_tx: mpsc::UnboundedSender<LinkSignal>,
        signals: &mut mpsc::UnboundedReceiver<LinkSignal>,
    ) -> Result<(), ConnectionError> {
        let limit = self.shared.config.negotiation_timeout;
        tokio::time::timeout(limit, self.negotiate(role, session, signals_tx, signals))
            .await
            .map_err(|_| ConnectionError::Timeout)??;

        self.transition(ConnectionState::Open, None);
        log::info!("Connection to {} ({}) open", self.peer.name, self.peer.address);

        self.steady(session, signals).await
    }

    async fn negotiate(
        &mut self,
        role: Role,
        session: &mut Session,
        signals_tx: mpsc::UnboundedSender<LinkSignal>,
        signals: &mut mpsc::UnboundedReceiver<LinkSignal>,
    ) -> Result<(), ConnectionError> {
        match role {
            Role::Outbound => self.negotiate_outbound(session, &signals_tx).await?,
            Role::Inbound(channel) => self.negotiate_inbound(session, channel, &signals_tx).await?,
        }
        self.await_channel(session, signals).await
    }

    /// Hello → Welcome, then offer the data channel.
    async fn negotiate_outbound(
        &mut self,
        session: &mut Session,
        signals_tx: &mpsc::UnboundedSender<LinkSignal>,
    ) -> Result<(), ConnectionError> {
        let url = format!("ws://{}", self.peer.address);
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let signaling = session.signaling.insert(SignalingChannel::spawn(ws));

        let identity = self.shared.identity.clone();
        signaling
            .send(SignalFrame::hello(identity.instance_id(), identity.name(), identity.listen_port()))
            .await?;
        match signaling.recv().await {
            Some(SignalFrame::Welcome { name, .. }) => self.peer.name = name,
            Some(SignalFrame::Reject { reason }) => return Err(ConnectionError::Rejected(reason)),
            Some(other) => return Err(ProtocolError::UnexpectedFrame(other.kind()).into()),
            None => return Err(ProtocolError::ConnectionClosed.into()),
        }

        let pc = new_peer_connection(&self.shared.config, signals_tx).await?;
        session.pc = Some(pc.clone());

        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = pc.create_data_channel(DATA_CHANNEL_LABEL, Some(init)).await?;
        wire_channel(&dc, self.peer.address, &self.shared.inbound_tx, signals_tx);

        let offer = pc.create_offer(None).await?;
        let sdp = gather(&pc, offer).await?;
        signaling.send(SignalFrame::Offer { sdp }).await?;

        let sdp = self.await_answer(signaling).await?;
        pc.set_remote_description(RTCSessionDescription::answer(sdp)?).await?;
        Ok(())
    }

    /// Welcome, then answer the caller's offer.
    async fn negotiate_inbound(
        &mut self,
        session: &mut Session,
        channel: SignalingChannel,
        signals_tx: &mpsc::UnboundedSender<LinkSignal>,
    ) -> Result<(), ConnectionError> {
        let signaling = session.signaling.insert(channel);
        let identity = &self.shared.identity;
        signaling
            .send(SignalFrame::Welcome {
                instance_id: identity.instance_id(),
                name: identity.name().to_string(),
            })
            .await?;

        let pc = new_peer_connection(&self.shared.config, signals_tx).await?;
        session.pc = Some(pc.clone());

        let peer = self.peer.address;
        let inbound = self.shared.inbound_tx.clone();
        let signals = signals_tx.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            if dc.label() == DATA_CHANNEL_LABEL {
                wire_channel(&dc, peer, &inbound, &signals);
            } else {
                log::debug!("Ignoring data channel {:?} from {peer}", dc.label());
            }
            Box::pin(async {})
        }));

        let sdp = loop {
            match signaling.recv().await {
                Some(SignalFrame::Offer { sdp }) => break sdp,
                Some(SignalFrame::Bye) | None => return Err(ProtocolError::ConnectionClosed.into()),
                Some(other) => return Err(ProtocolError::UnexpectedFrame(other.kind()).into()),
            }
        };
        pc.set_remote_description(RTCSessionDescription::offer(sdp)?).await?;
        let answer = pc.create_answer(None).await?;
        let sdp = gather(&pc, answer).await?;
        signaling.send(SignalFrame::Answer { sdp }).await?;
        Ok(())
    }

    /// Wait for the data channel to open.
    async fn await_channel(
        &mut self,
        session: &mut Session,
        signals: &mut mpsc::UnboundedReceiver<LinkSignal>,
    ) -> Result<(), ConnectionError> {
        let signaling = session.signaling.as_mut().ok_or(ConnectionError::Closed)?;
        loop {
            tokio::select! {
                signal = signals.recv() => match signal {
                    Some(LinkSignal::ChannelOpen(dc)) => {
                        *self.channel.write().await = Some(dc);
                        return Ok(());
                    }
                    Some(LinkSignal::PeerState(RTCPeerConnectionState::Failed)) => {
                        return Err(ConnectionError::Negotiation("ICE negotiation failed".into()));
                    }
                    Some(LinkSignal::PeerState(RTCPeerConnectionState::Closed))
                    | Some(LinkSignal::ChannelClosed)
                    | None => return Err(ConnectionError::Closed),
                    Some(LinkSignal::RemoteTrack(active)) => self.set_remote_audio(active),
                    Some(LinkSignal::PeerState(_)) => {}
                },
                frame = signaling.recv() => match frame {
                    Some(SignalFrame::Bye) | None => return Err(ProtocolError::ConnectionClosed.into()),
                    Some(other) => log::debug!("Ignoring {} frame while opening", other.kind()),
                },
            }
        }
    }

    /// Serve an Open connection until either side closes it.
    async fn steady(
        &mut self,
        session: &mut Session,
        signals: &mut mpsc::UnboundedReceiver<LinkSignal>,
    ) -> Result<(), ConnectionError> {
        loop {
            let step = {
                let signaling = session.signaling.as_mut().ok_or(ConnectionError::Closed)?;
                tokio::select! {
                    command = self.commands.recv() => Step::Command(command),
                    frame = signaling.recv() => Step::Frame(frame),
                    signal = signals.recv() => Step::Link(signal),
                }
            };

            match step {
                Step::Command(Some(PeerCommand::AttachAudio { track, reply })) => {
                    let result = self.attach_audio(session, track).await;
                    let _ = reply.send(result);
                }
                Step::Command(Some(PeerCommand::DetachAudio { reply })) => {
                    self.detach_audio(session).await;
                    let _ = reply.send(());
                }
                Step::Command(None) => return Ok(()),

                Step::Frame(Some(SignalFrame::Offer { sdp })) => {
                    if let Err(e) = self.answer_renegotiation(session, sdp).await {
                        log::warn!("Renegotiation with {} failed: {e}", self.peer.address);
                    }
                }
                Step::Frame(Some(SignalFrame::Hangup)) => self.set_remote_audio(false),
                Step::Frame(Some(SignalFrame::Bye)) => {
                    log::info!("{} closed the connection", self.peer.address);
                    return Ok(());
                }
                Step::Frame(Some(other)) => log::debug!("Ignoring {} frame", other.kind()),
                Step::Frame(None) => {
                    log::info!("Signaling to {} lost", self.peer.address);
                    return Ok(());
                }

                Step::Link(Some(LinkSignal::PeerState(RTCPeerConnectionState::Failed))) => {
                    return Err(ConnectionError::Negotiation("connection failed".into()));
                }
                Step::Link(Some(LinkSignal::PeerState(RTCPeerConnectionState::Closed)))
                | Step::Link(Some(LinkSignal::ChannelClosed))
                | Step::Link(None) => return Ok(()),
                Step::Link(Some(LinkSignal::RemoteTrack(active))) => self.set_remote_audio(active),
                Step::Link(Some(_)) => {}
            }
        }
    }

    async fn attach_audio(
        &mut self,
        session: &mut Session,
        track: Arc<TrackLocalStaticSample>,
    ) -> Result<(), ConnectionError> {
        let pc = session.pc.clone().ok_or(ConnectionError::Closed)?;
        if let Some(previous) = session.audio.take() {
            let _ = pc.remove_track(&previous).await;
        }

        let sender = pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>).await?;
        // Incoming RTCP has to be read for the interceptors to work.
        let rtcp = sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; RTCP_BUFFER];
            while rtcp.read(&mut buf).await.is_ok() {}
        });
        session.audio = Some(sender.clone());

        if let Err(e) = self.renegotiate(session).await {
            session.audio = None;
            let _ = pc.remove_track(&sender).await;
            return Err(e);
        }
        log::info!("Audio attached to {}", self.peer.address);
        Ok(())
    }

    async fn detach_audio(&mut self, session: &mut Session) {
        let Some(sender) = session.audio.take() else {
            return;
        };
        if let Some(pc) = session.pc.clone() {
            if let Err(e) = pc.remove_track(&sender).await {
                log::warn!("Removing audio track for {} failed: {e}", self.peer.address);
            }
        }
        if let Some(signaling) = session.signaling.as_ref() {
            let _ = signaling.send(SignalFrame::Hangup).await;
        }
        if let Err(e) = self.renegotiate(session).await {
            log::warn!("Renegotiation after hangup with {} failed: {e}", self.peer.address);
        }
        log::info!("Audio detached from {}", self.peer.address);
    }

    /// Offer the current media set and apply the answer.
    async fn renegotiate(&mut self, session: &mut Session) -> Result<(), ConnectionError> {
        let pc = session.pc.clone().ok_or(ConnectionError::Closed)?;
        let signaling = session.signaling.as_mut().ok_or(ConnectionError::Closed)?;

        let offer = pc.create_offer(None).await?;
        let sdp = gather(&pc, offer).await?;
        signaling.send(SignalFrame::Offer { sdp }).await?;

        let limit = self.shared.config.negotiation_timeout;
        let sdp = tokio::time::timeout(limit, self.await_answer(signaling))
            .await
            .map_err(|_| ConnectionError::Timeout)??;
        pc.set_remote_description(RTCSessionDescription::answer(sdp)?).await?;
        Ok(())
    }

    /// Answer an offer the remote sent on an Open connection.
    async fn answer_renegotiation(&mut self, session: &mut Session, sdp: String) -> Result<(), ConnectionError> {
        let pc = session.pc.clone().ok_or(ConnectionError::Closed)?;
        let signaling = session.signaling.as_ref().ok_or(ConnectionError::Closed)?;

        pc.set_remote_description(RTCSessionDescription::offer(sdp)?).await?;
        let answer = pc.create_answer(None).await?;
        let sdp = gather(&pc, answer).await?;
        signaling.send(SignalFrame::Answer { sdp }).await?;
        Ok(())
    }

    async fn await_answer(&mut self, signaling: &mut SignalingChannel) -> Result<String, ConnectionError> {
        loop {
            match signaling.recv().await {
                Some(SignalFrame::Answer { sdp }) => return Ok(sdp),
                Some(SignalFrame::Hangup) => self.set_remote_audio(false),
                Some(SignalFrame::Offer { .. }) => {
                    return Err(ConnectionError::Negotiation("both sides renegotiated at once".into()));
                }
                Some(SignalFrame::Reject { reason }) => return Err(ConnectionError::Rejected(reason)),
                Some(SignalFrame::Bye) | None => return Err(ProtocolError::ConnectionClosed.into()),
                Some(other) => return Err(ProtocolError::UnexpectedFrame(other.kind()).into()),
            }
        }
    }

    async fn teardown(mut self, mut session: Session, outcome: Option<Result<(), ConnectionError>>) {
        *self.channel.write().await = None;

        if outcome.is_none() {
            if let Some(signaling) = session.signaling.as_ref() {
                signaling.try_send(SignalFrame::Bye);
            }
        }
        if let Some(pc) = session.pc.take() {
            if let Err(e) = pc.close().await {
                log::debug!("Closing peer connection to {} failed: {e}", self.peer.address);
            }
        }
        drop(session);

        self.set_remote_audio(false);
        self.shared.forget(&self.peer.address, self.generation).await;

        match outcome {
            Some(Err(e)) => {
                log::warn!("Connection to {} failed: {e}", self.peer.address);
                self.transition(ConnectionState::Error, Some(e.to_string()));
            }
            _ => {
                log::info!("Connection to {} closed", self.peer.address);
                self.transition(ConnectionState::Closed, None);
            }
        }
    }

    fn set_remote_audio(&mut self, active: bool) {
        if self.remote_audio == active {
            return;
        }
        self.remote_audio = active;
        self.shared.emit(ConnectionEvent::RemoteAudio {
            address: self.peer.address,
            active,
        });
    }

    fn transition(&self, next: ConnectionState, reason: Option<String>) {
        let current = *self.state_tx.borrow();
        if !current.can_transition_to(next) {
            log::debug!("Ignoring {current} -> {next} for {}", self.peer.address);
            return;
        }
        self.state_tx.send_replace(next);
        self.shared.emit(ConnectionEvent::StateChanged {
            peer: self.peer.clone(),
            state: next,
            reason,
        });
    }
}

fn build_api(config: &ConnectionConfig) -> Result<API, ConnectionError> {
    let mut media = MediaEngine::default();
    media.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media)?;

    let mut settings = SettingEngine::default();
    settings.set_include_loopback_candidate(config.include_loopback_candidates);

    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .with_setting_engine(settings)
        .build())
}

async fn new_peer_connection(
    config: &ConnectionConfig,
    signals: &mpsc::UnboundedSender<LinkSignal>,
) -> Result<Arc<RTCPeerConnection>, ConnectionError> {
    let api = build_api(config)?;
    let ice_servers = if config.ice_servers.is_empty() {
        Vec::new()
    } else {
        vec![RTCIceServer {
            urls: config.ice_servers.clone(),
            ..Default::default()
        }]
    };
    let pc = Arc::new(
        api.new_peer_connection(RTCConfiguration {
            ice_servers,
            ..Default::default()
        })
        .await?,
    );

    let states = signals.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        log::debug!("Peer connection state: {state}");
        let _ = states.send(LinkSignal::PeerState(state));
        Box::pin(async {})
    }));

    let tracks = signals.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let tracks = tracks.clone();
        tokio::spawn(async move {
            let _ = tracks.send(LinkSignal::RemoteTrack(true));
            while track.read_rtp().await.is_ok() {}
            let _ = tracks.send(LinkSignal::RemoteTrack(false));
        });
        Box::pin(async {})
    }));

    Ok(pc)
}

/// Hook a data channel's callbacks up to the worker and the router.
fn wire_channel(
    dc: &Arc<RTCDataChannel>,
    peer: PeerKey,
    inbound: &mpsc::UnboundedSender<InboundText>,
    signals: &mpsc::UnboundedSender<LinkSignal>,
) {
    let opened = signals.clone();
    let weak = Arc::downgrade(dc);
    dc.on_open(Box::new(move || {
        if let Some(dc) = weak.upgrade() {
            let _ = opened.send(LinkSignal::ChannelOpen(dc));
        }
        Box::pin(async {})
    }));

    let closed = signals.clone();
    dc.on_close(Box::new(move || {
        let _ = closed.send(LinkSignal::ChannelClosed);
        Box::pin(async {})
    }));

    // Forwarded from the callback itself so arrival order is kept.
    let inbound = inbound.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        match String::from_utf8(msg.data.to_vec()) {
            Ok(text) => {
                let _ = inbound.send(InboundText { peer, text });
            }
            Err(_) => log::warn!("Dropping non-UTF-8 message from {peer}"),
        }
        Box::pin(async {})
    }));

    if dc.ready_state() == RTCDataChannelState::Open {
        let _ = signals.send(LinkSignal::ChannelOpen(dc.clone()));
    }
}

/// Apply a local description and wait for ICE gathering to finish, so the
/// returned SDP carries every candidate.
async fn gather(pc: &RTCPeerConnection, description: RTCSessionDescription) -> Result<String, ConnectionError> {
    let mut complete = pc.gathering_complete_promise().await;
    pc.set_local_description(description).await?;
    let _ = complete.recv().await;
    pc.local_description()
        .await
        .map(|d| d.sdp)
        .ok_or_else(|| ConnectionError::Negotiation("no local description".into()))
}
