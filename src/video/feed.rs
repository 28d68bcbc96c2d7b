//! Wiring for one video feed: source connector → decoder → filters →
//! backpressure queue → encoder → UDP/TCP sink + WebSocket fan-out.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{FeedConfig, NetworkConfig};
use crate::video::decoder::{ChildSlot, DecoderStage, FrameQueue};
use crate::video::encoder::EncoderStage;
use crate::video::ws::WsBroadcaster;

pub struct FeedHandles {
    pub id: u32,
    pub queue: Arc<FrameQueue>,
    pub broadcaster: Option<WsBroadcaster>,
    pub decoder: JoinHandle<()>,
    pub encoder: JoinHandle<()>,
}

/// Spawn the four workers of one feed. Fails fast if the feed's WebSocket
/// port cannot be bound.
pub async fn spawn_feed(
    feed: FeedConfig,
    network: &NetworkConfig,
    running: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<FeedHandles> {
    let id = feed.id;
    let queue: Arc<FrameQueue> = Arc::new(FrameQueue::new(
        feed.queue.max_queue_size,
        feed.queue.queue_timeout_ms,
    ));

    let broadcaster = if network.websocket_relay.enabled {
        Some(WsBroadcaster::start(id, feed.ws_port, shutdown.clone()).await?)
    } else {
        None
    };

    let decoder_slot: ChildSlot = Arc::new(tokio::sync::Mutex::new(None));
    let encoder_slot: ChildSlot = Arc::new(tokio::sync::Mutex::new(None));

    let decoder = DecoderStage::new(
        feed.clone(),
        network.host_ip.clone(),
        network.input_network_type,
        network.client_resilience,
        Arc::clone(&queue),
        decoder_slot,
        Arc::clone(&running),
        shutdown.clone(),
    );

    let encoder = EncoderStage::new(
        feed.clone(),
        network.target_ip.clone(),
        network.output_network_type,
        Arc::clone(&queue),
        broadcaster.clone(),
        encoder_slot,
        Arc::clone(&running),
        shutdown,
    );

    info!(
        stream_id = id,
        input_port = feed.input_port,
        output_port = feed.output_port,
        ws_port = feed.ws_port,
        "Feed configured"
    );

    Ok(FeedHandles {
        id,
        queue,
        broadcaster,
        decoder: tokio::spawn(decoder.run()),
        encoder: tokio::spawn(encoder.run()),
    })
}
