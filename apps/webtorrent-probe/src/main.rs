use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use tokio::signal;
use tracing::{debug, info, warn};
use webtorrent_tracker::config::{DEFAULT_PEER_ID_PREFIX, DEFAULT_STUN_URL, DEFAULT_TRACKER_URL};
use webtorrent_tracker::{
    AnnounceEvent, AnnounceFields, DataChannel, DataChannelContext, InfoHash, PeerId, RtcConfig,
    RtcNegotiator, TrackerClient, TrackerClientConfig, WebSocketDialer,
};

mod telemetry;

#[derive(Debug, Parser)]
#[command(
    name = "webtorrent-probe",
    author,
    version,
    about = "Announce to a WebTorrent tracker and report the peers that connect"
)]
struct Cli {
    /// Websocket URL of the tracker.
    #[arg(long, env = "WEBTORRENT_TRACKER_URL", default_value = DEFAULT_TRACKER_URL)]
    tracker_url: String,

    /// Hex encoded info hash to announce. Repeat for several swarms.
    #[arg(long = "info-hash", required = true)]
    info_hashes: Vec<String>,

    #[arg(long, env = "WEBTORRENT_PEER_ID_PREFIX", default_value = DEFAULT_PEER_ID_PREFIX)]
    peer_id_prefix: String,

    /// Pause before redialing a dropped tracker connection.
    #[arg(long, env = "WEBTORRENT_RECONNECT_DELAY_SECS", default_value_t = 60)]
    reconnect_delay_secs: u64,

    /// How long a negotiated connection may take to open.
    #[arg(long, env = "WEBTORRENT_ANSWER_TIMEOUT_SECS", default_value_t = 30)]
    answer_timeout_secs: u64,

    /// Do not announce again after each answered offer.
    #[arg(long, default_value_t = false)]
    no_reannounce: bool,

    /// Gather host candidates only.
    #[arg(long, env = "WEBTORRENT_DISABLE_STUN", default_value_t = false)]
    no_stun: bool,

    #[arg(
        long = "stun-url",
        env = "WEBTORRENT_STUN_URLS",
        value_delimiter = ',',
        default_value = DEFAULT_STUN_URL
    )]
    stun_urls: Vec<String>,

    /// Bytes left to download, reported with every announce.
    #[arg(long, default_value_t = 0)]
    left: i64,

    /// Text sent over every data channel once it opens.
    #[arg(long)]
    greeting: Option<String>,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "WEBTORRENT_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

#[derive(Debug)]
struct ProbeConfig {
    client: TrackerClientConfig,
    rtc: RtcConfig,
    info_hashes: Vec<InfoHash>,
    left: i64,
    greeting: Option<String>,
    metrics_addr: Option<SocketAddr>,
}

impl TryFrom<Cli> for ProbeConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let info_hashes = cli
            .info_hashes
            .iter()
            .map(|hex| {
                InfoHash::from_hex(hex).with_context(|| format!("invalid info hash: {hex}"))
            })
            .collect::<Result<Vec<_>>>()?;
        let client = TrackerClientConfig {
            url: cli.tracker_url,
            peer_id: PeerId::generate(&cli.peer_id_prefix),
            reconnect_delay: Duration::from_secs(cli.reconnect_delay_secs),
            answer_timeout: Duration::from_secs(cli.answer_timeout_secs),
            reannounce_after_answer: !cli.no_reannounce,
        };
        let rtc = if cli.no_stun {
            RtcConfig::localhost()
        } else {
            RtcConfig {
                ice_urls: cli.stun_urls,
                ..RtcConfig::default()
            }
        };
        Ok(ProbeConfig {
            client,
            rtc,
            info_hashes,
            left: cli.left,
            greeting: cli.greeting,
            metrics_addr: cli.metrics_addr,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ProbeConfig::try_from(cli)?;
    telemetry::init(config.metrics_addr)?;
    info!(
        tracker = %config.client.url,
        peer_id = %config.client.peer_id,
        swarms = config.info_hashes.len(),
        "starting webtorrent probe"
    );

    run(config).await
}

async fn run(config: ProbeConfig) -> Result<()> {
    let left = config.left;
    let greeting = config.greeting.map(Bytes::from);
    let client = TrackerClient::new(
        config.client,
        Arc::new(RtcNegotiator::new(config.rtc)),
        Arc::new(WebSocketDialer::new()),
        move |_event: AnnounceEvent, _info_hash: &InfoHash| AnnounceFields {
            uploaded: 0,
            downloaded: 0,
            left,
        },
        move |channel: Arc<dyn DataChannel>, context: DataChannelContext| {
            tokio::spawn(drain_channel(channel, context, greeting.clone()));
        },
    );

    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };

    for info_hash in config.info_hashes {
        let client = client.clone();
        tokio::spawn(async move {
            match client.announce(AnnounceEvent::Started, info_hash).await {
                Ok(offer_id) => info!(%info_hash, %offer_id, "announced"),
                Err(err) => warn!(%info_hash, error = %err, "announce failed"),
            }
        });
    }

    signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    client.close().await;
    runner.await.context("tracker task panicked")??;

    let stats = client.stats().await;
    info!(
        dials = stats.dials,
        announces = stats.announces,
        inbound = stats.converted_inbound_conns,
        outbound = stats.converted_outbound_conns,
        inbound_timeouts = stats.inbound_timeouts,
        outbound_timeouts = stats.outbound_timeouts,
        "tracker client stopped"
    );
    Ok(())
}

async fn drain_channel(
    channel: Arc<dyn DataChannel>,
    context: DataChannelContext,
    greeting: Option<Bytes>,
) {
    info!(
        label = %channel.label(),
        info_hash = %context.info_hash,
        offer_id = %context.offer_id,
        local_offered = context.local_offered,
        "peer data channel open"
    );
    if let Some(greeting) = greeting {
        if let Err(err) = channel.send(greeting).await {
            warn!(error = %err, "failed to send greeting");
        }
    }
    let mut received = 0usize;
    while let Some(message) = channel.recv().await {
        received += message.len();
        debug!(len = message.len(), "peer message");
    }
    info!(info_hash = %context.info_hash, received, "peer data channel closed");
}
