use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::util::vnet::net::{Net, NetConfig};
use webrtc::util::vnet::router::{Router, RouterConfig};

use super::{
    EngineError, EngineEvent, EngineEvents, EngineFactory, MediaKind, MediaTrack, RemoteTrack,
    TransportEngine,
};
use crate::model::{ConnectionState, DescriptionKind, IceCandidate, SessionDescription};

/// Builds the `SettingEngine` for each new peer connection.
pub type SettingsFn = Arc<dyn Fn() -> SettingEngine + Send + Sync>;

pub struct RtcEngineFactory {
    ice_servers: Vec<String>,
    settings: SettingsFn,
}

impl RtcEngineFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self::with_settings(ice_servers, Arc::new(SettingEngine::default))
    }

    pub fn with_settings(ice_servers: Vec<String>, settings: SettingsFn) -> Self {
        Self {
            ice_servers,
            settings,
        }
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl EngineFactory for RtcEngineFactory {
    async fn create(&self, events: EngineEvents) -> Result<Arc<dyn TransportEngine>, EngineError> {
        let api = build_api((self.settings)())?;
        let pc = Arc::new(
            api.new_peer_connection(self.configuration())
                .await
                .map_err(to_setup_error)?,
        );
        forward_callbacks(&pc, events);
        tracing::debug!(target = "pier", ice_servers = ?self.ice_servers, "peer connection created");
        Ok(Arc::new(RtcEngine { pc }))
    }
}

fn build_api(setting: SettingEngine) -> Result<API, EngineError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn forward_callbacks(pc: &Arc<RTCPeerConnection>, events: EngineEvents) {
    let candidates = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let candidates = candidates.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = candidates.send(EngineEvent::LocalCandidate(from_init(init)));
                }
                Err(err) => {
                    tracing::warn!(target = "pier", error = %err, "local candidate not serializable");
                }
            }
        })
    }));

    let tracks = events.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => MediaKind::Audio,
            _ => MediaKind::Video,
        };
        let _ = tracks.send(EngineEvent::RemoteTrack(RemoteTrack {
            id: track.id(),
            stream_id: track.stream_id(),
            kind,
        }));
        Box::pin(async {})
    }));

    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let mapped = match state {
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
            _ => ConnectionState::New,
        };
        let _ = events.send(EngineEvent::ConnectionState(mapped));
        Box::pin(async {})
    }));
}

/// `TransportEngine` backed by a webrtc-rs peer connection.
pub struct RtcEngine {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl TransportEngine for RtcEngine {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), EngineError> {
        let local: Arc<dyn TrackLocal + Send + Sync> = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind),
            track.id.clone(),
            track.stream_id.clone(),
        ));
        self.pc.add_track(local).await.map_err(to_setup_error)?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self.pc.create_offer(None).await.map_err(to_setup_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self.pc.create_answer(None).await.map_err(to_setup_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), EngineError> {
        let native = to_native(description).map_err(to_setup_error)?;
        self.pc
            .set_local_description(native)
            .await
            .map_err(to_setup_error)
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), EngineError> {
        let native = to_native(description)
            .map_err(|err| EngineError::InvalidRemoteDescription(err.to_string()))?;
        self.pc
            .set_remote_description(native)
            .await
            .map_err(|err| EngineError::InvalidRemoteDescription(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), EngineError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| EngineError::InvalidCandidate(err.to_string()))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.pc.close().await.map_err(to_setup_error)
    }
}

fn to_native(description: &SessionDescription) -> Result<RTCSessionDescription, webrtc::Error> {
    match description.kind {
        DescriptionKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
        DescriptionKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
    }
}

fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90_000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

/// In-process network so two engines can connect without touching OS sockets.
pub struct VirtualNetwork {
    _router: Arc<AsyncMutex<Router>>,
    nets: Vec<Arc<Net>>,
}

impl VirtualNetwork {
    /// Starts a router on `10.0.0.0/24` with one host per address in `hosts`.
    pub async fn start(hosts: &[&str]) -> Result<Self, EngineError> {
        let router = Arc::new(AsyncMutex::new(
            Router::new(RouterConfig {
                cidr: "10.0.0.0/24".to_owned(),
                ..Default::default()
            })
            .map_err(to_setup_error)?,
        ));

        let mut nets = Vec::with_capacity(hosts.len());
        for host in hosts {
            let net = Arc::new(Net::new(Some(NetConfig {
                static_ips: vec![(*host).to_owned()],
                ..Default::default()
            })));
            attach(&net, &router).await?;
            nets.push(net);
        }

        router.lock().await.start().await.map_err(to_setup_error)?;
        Ok(Self {
            _router: router,
            nets,
        })
    }

    /// Engine settings bound to the host at `index`, with short ICE timeouts.
    pub fn settings(&self, index: usize) -> Option<SettingsFn> {
        let net = self.nets.get(index)?.clone();
        Some(Arc::new(move || {
            let mut setting = SettingEngine::default();
            setting.set_vnet(Some(net.clone()));
            setting.set_ice_timeouts(
                Some(Duration::from_secs(1)),
                Some(Duration::from_secs(1)),
                Some(Duration::from_millis(200)),
            );
            setting
        }))
    }
}

async fn attach(net: &Arc<Net>, router: &Arc<AsyncMutex<Router>>) -> Result<(), EngineError> {
    let nic = net.get_nic().map_err(to_setup_error)?;
    router
        .lock()
        .await
        .add_net(Arc::clone(&nic))
        .await
        .map_err(to_setup_error)?;
    nic.lock()
        .await
        .set_router(Arc::clone(router))
        .await
        .map_err(to_setup_error)?;
    Ok(())
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> EngineError {
    EngineError::Setup(err.to_string())
}
