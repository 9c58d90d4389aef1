//! [`Negotiator`] on top of the `webrtc` crate.
//!
//! Trackers relay exactly one description in each direction, so ICE is not
//! trickled: every description waits for candidate gathering to finish.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::debug;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::RtcConfig;
use crate::negotiation::{
    DataChannel, LocalAnswer, LocalOffer, NegotiationError, Negotiator, OnOpenHdlrFn,
    PeerConnection,
};
use crate::wire::{SdpKind, SessionDescription};

fn setup_error(err: webrtc::Error) -> NegotiationError {
    NegotiationError::Setup(err.to_string())
}

fn description_error(err: webrtc::Error) -> NegotiationError {
    NegotiationError::Description(err.to_string())
}

fn to_rtc(description: &SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    let sdp = description.sdp.clone();
    let converted = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp),
        SdpKind::Answer => RTCSessionDescription::answer(sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpKind::Rollback => {
            return Err(NegotiationError::Description(
                "rollback descriptions are not supported".into(),
            ))
        }
    };
    converted.map_err(description_error)
}

fn from_rtc(description: &RTCSessionDescription) -> Result<SessionDescription, NegotiationError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(NegotiationError::Description(
                "local description has no type".into(),
            ))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp.clone(),
    })
}

/// Applies `description` locally and returns it once every candidate has
/// been folded in.
async fn gathered_local_description(
    pc: &RTCPeerConnection,
    description: RTCSessionDescription,
) -> Result<SessionDescription, NegotiationError> {
    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(description)
        .await
        .map_err(description_error)?;
    let _ = gathered.recv().await;
    let local = pc
        .local_description()
        .await
        .ok_or_else(|| NegotiationError::Setup("no local description after gathering".into()))?;
    from_rtc(&local)
}

async fn close_quietly(pc: &RTCPeerConnection) {
    if let Err(err) = pc.close().await {
        debug!(target = "webtorrent", error = %err, "error closing peer connection");
    }
}

pub struct RtcNegotiator {
    api: API,
    config: RtcConfig,
}

impl RtcNegotiator {
    pub fn new(config: RtcConfig) -> Self {
        Self {
            api: APIBuilder::new().build(),
            config,
        }
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
        let ice_servers = if self.config.ice_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.config.ice_urls.clone(),
                ..Default::default()
            }]
        };
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = self
            .api
            .new_peer_connection(rtc_config)
            .await
            .map_err(setup_error)?;
        Ok(Arc::new(pc))
    }

    async fn offer_on(
        &self,
        pc: &RTCPeerConnection,
    ) -> Result<(Arc<RtcDataChannel>, SessionDescription), NegotiationError> {
        let channel = pc
            .create_data_channel(&self.config.data_channel_label, None)
            .await
            .map_err(setup_error)?;
        let channel = RtcDataChannel::new(channel);
        let offer = pc.create_offer(None).await.map_err(setup_error)?;
        let offer = gathered_local_description(pc, offer).await?;
        Ok((channel, offer))
    }

    async fn answer_on(
        pc: &RTCPeerConnection,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        pc.set_remote_description(to_rtc(offer)?)
            .await
            .map_err(description_error)?;
        let answer = pc.create_answer(None).await.map_err(setup_error)?;
        gathered_local_description(pc, answer).await
    }
}

impl Default for RtcNegotiator {
    fn default() -> Self {
        Self::new(RtcConfig::default())
    }
}

#[async_trait]
impl Negotiator for RtcNegotiator {
    async fn create_offer(&self) -> Result<LocalOffer, NegotiationError> {
        let pc = self.new_peer_connection().await?;
        match self.offer_on(&pc).await {
            Ok((channel, offer)) => Ok(LocalOffer {
                connection: Arc::new(RtcPeerConnection::offering(pc, channel.clone())),
                data_channel: channel,
                offer,
            }),
            Err(err) => {
                close_quietly(&pc).await;
                Err(err)
            }
        }
    }

    async fn create_answering_connection(
        &self,
        offer: &SessionDescription,
    ) -> Result<LocalAnswer, NegotiationError> {
        let pc = self.new_peer_connection().await?;
        // Registered before the answer leaves so an early channel is not missed.
        let connection = RtcPeerConnection::answering(pc.clone());
        match Self::answer_on(&pc, offer).await {
            Ok(answer) => Ok(LocalAnswer {
                connection: Arc::new(connection),
                answer,
            }),
            Err(err) => {
                close_quietly(&pc).await;
                Err(err)
            }
        }
    }
}

/// First remote channel and the handler waiting for it; whichever arrives
/// second arms the open callback.
#[derive(Default)]
struct RemoteChannelSlot {
    channel: Option<Arc<RtcDataChannel>>,
    on_open: Option<OnOpenHdlrFn>,
    armed: bool,
}

impl RemoteChannelSlot {
    fn try_arm(&mut self) {
        if self.armed || self.on_open.is_none() {
            return;
        }
        let Some(channel) = self.channel.clone() else {
            return;
        };
        if let Some(on_open) = self.on_open.take() {
            self.armed = true;
            channel.arm_open(on_open);
        }
    }
}

pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    outbound: Option<Arc<RtcDataChannel>>,
    remote: Arc<Mutex<RemoteChannelSlot>>,
}

impl RtcPeerConnection {
    fn offering(pc: Arc<RTCPeerConnection>, channel: Arc<RtcDataChannel>) -> Self {
        Self {
            pc,
            outbound: Some(channel),
            remote: Arc::default(),
        }
    }

    fn answering(pc: Arc<RTCPeerConnection>) -> Self {
        let remote: Arc<Mutex<RemoteChannelSlot>> = Arc::default();
        let slot = remote.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let slot = slot.clone();
            Box::pin(async move {
                let mut slot = slot.lock();
                if slot.channel.is_some() {
                    debug!(target = "webtorrent", label = %dc.label(), "ignoring extra data channel");
                    return;
                }
                slot.channel = Some(RtcDataChannel::new(dc));
                slot.try_arm();
            })
        }));
        Self {
            pc,
            outbound: None,
            remote,
        }
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn set_answer(
        &self,
        answer: SessionDescription,
        on_open: OnOpenHdlrFn,
    ) -> Result<(), NegotiationError> {
        let channel = self.outbound.clone().ok_or_else(|| {
            NegotiationError::Setup("answer applied to a connection that made no offer".into())
        })?;
        let description = to_rtc(&answer)?;
        channel.arm_open(on_open);
        self.pc
            .set_remote_description(description)
            .await
            .map_err(description_error)
    }

    fn on_data_channel_open(&self, on_open: OnOpenHdlrFn) {
        let mut slot = self.remote.lock();
        slot.on_open = Some(on_open);
        slot.try_arm();
    }

    async fn close(&self) {
        close_quietly(&self.pc).await;
    }
}

/// Buffers inbound messages from the moment the channel is known, so nothing
/// sent right after open is lost.
pub struct RtcDataChannel {
    channel: Arc<RTCDataChannel>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl RtcDataChannel {
    fn new(channel: Arc<RTCDataChannel>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let message_tx = tx.clone();
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            if let Some(tx) = message_tx.lock().as_ref() {
                let _ = tx.send(msg.data);
            }
            Box::pin(async {})
        }));
        channel.on_close(Box::new(move || {
            tx.lock().take();
            Box::pin(async {})
        }));
        Arc::new(Self {
            channel,
            inbound: AsyncMutex::new(rx),
        })
    }

    fn arm_open(self: &Arc<Self>, on_open: OnOpenHdlrFn) {
        let opened = self.clone();
        self.channel.on_open(Box::new(move || {
            let channel: Arc<dyn DataChannel> = opened;
            on_open(channel)
        }));
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> String {
        self.channel.label().to_string()
    }

    async fn send(&self, data: Bytes) -> Result<(), NegotiationError> {
        self.channel
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|err| NegotiationError::Setup(format!("data channel send failed: {err}")))
    }

    async fn recv(&self) -> Option<Bytes> {
        self.inbound.lock().await.recv().await
    }

    async fn close(&self) {
        if let Err(err) = self.channel.close().await {
            debug!(target = "webtorrent", error = %err, "error closing data channel");
        }
    }
}
