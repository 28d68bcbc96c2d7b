//! Encoder stage: consumes raw frames at the output cadence and produces an
//! MPEG-TS stream through an encoder child with a tee sink, feeding the
//! configured UDP/TCP endpoint and the WebSocket broadcaster simultaneously.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::clock;
use crate::config::{FeedConfig, PixelFormat};
use crate::net::TransportKind;
use crate::video::decoder::{ChildSlot, FrameQueue};
use crate::video::process::SupervisedChild;
use crate::video::ws::WsBroadcaster;

/// MPEG-TS chunk size carried to WebSocket clients, 7 x 188-byte TS packets
pub const TS_CHUNK_SIZE: usize = 1316;

const STATUS_INTERVAL: Duration = Duration::from_secs(5);
const RESTART_DELAY: Duration = Duration::from_secs(1);

pub struct EncoderStage {
    feed: FeedConfig,
    target_ip: String,
    output_transport: TransportKind,
    queue: Arc<FrameQueue>,
    broadcaster: Option<WsBroadcaster>,
    child_slot: ChildSlot,
    running: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
}

impl EncoderStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        feed: FeedConfig,
        target_ip: String,
        output_transport: TransportKind,
        queue: Arc<FrameQueue>,
        broadcaster: Option<WsBroadcaster>,
        child_slot: ChildSlot,
        running: Arc<AtomicBool>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        EncoderStage {
            feed,
            target_ip,
            output_transport,
            queue,
            broadcaster,
            child_slot,
            running,
            shutdown,
        }
    }

    /// Build the tee sink expression: one leg per configured destination
    fn tee_outputs(&self) -> Vec<String> {
        let mut outputs = Vec::new();
        if !self.target_ip.is_empty() {
            let scheme = match self.output_transport {
                TransportKind::Stream => Some("tcp"),
                TransportKind::Datagram => Some("udp"),
                TransportKind::None => None,
            };
            if let Some(scheme) = scheme {
                outputs.push(format!(
                    "[f=mpegts]{}://{}:{}?pkt_size={}",
                    scheme, self.target_ip, self.feed.output_port, TS_CHUNK_SIZE
                ));
            }
        }
        if self.broadcaster.is_some() {
            outputs.push("[f=mpegts]pipe:1".to_string());
        }
        outputs
    }

    fn encode_args(&self, tee: &str) -> Vec<String> {
        let pix_fmt = match self.feed.input.format {
            PixelFormat::Gray => "gray",
            PixelFormat::Bgr | PixelFormat::Stereo => "bgr24",
        };
        vec![
            "-loglevel".into(), "error".into(),
            "-f".into(), "rawvideo".into(),
            "-pix_fmt".into(), pix_fmt.into(),
            "-s".into(), format!("{}x{}", self.feed.input.width, self.feed.input.height),
            "-r".into(), self.feed.input.fps.to_string(),
            "-i".into(), "pipe:0".into(),
            "-map".into(), "0:v:0".into(),
            "-c:v".into(), "mpeg1video".into(),
            "-b:v".into(), "1000k".into(),
            "-f".into(), "tee".into(),
            tee.into(),
        ]
    }

    /// Run the encoder, restarting the child on failure until shutdown
    pub async fn run(mut self) {
        let stream_id = self.feed.id;
        let outputs = self.tee_outputs();
        if outputs.is_empty() {
            warn!(stream_id, "No encoder outputs configured, encoder stage idle");
            return;
        }
        let tee = outputs.join("|");
        info!(
            stream_id,
            fps = self.feed.output.fps,
            tee = %tee,
            "Starting MPEG-TS encoder"
        );

        while self.running.load(Ordering::Relaxed) {
            if let Err(e) = self.run_once(&tee).await {
                warn!(stream_id, error = %e, "Encoder run ended");
            }
            if !self.running.load(Ordering::Relaxed) {
                break;
            }
            if !clock::sleep_unless_shutdown(RESTART_DELAY, &mut self.shutdown).await {
                break;
            }
            info!(stream_id, "Restarting encoder");
        }

        info!(stream_id, "MPEG-TS encoder stopped");
    }

    async fn run_once(&mut self, tee: &str) -> anyhow::Result<()> {
        let stream_id = self.feed.id;
        let capture_stdout = self.broadcaster.is_some();

        let mut child =
            SupervisedChild::spawn("encoder", "ffmpeg", &self.encode_args(tee), capture_stdout)?;
        let stdout = if capture_stdout {
            Some(child.take_stdout()?)
        } else {
            None
        };

        {
            let mut slot = self.child_slot.lock().await;
            *slot = Some(child);
        }

        let stdout_reader = match (stdout, self.broadcaster.clone()) {
            (Some(stdout), Some(broadcaster)) => {
                let running = Arc::clone(&self.running);
                Some(tokio::spawn(read_encoder_stdout(
                    stream_id,
                    stdout,
                    broadcaster,
                    running,
                )))
            }
            _ => None,
        };

        // Feeder: capacity-1 channel to the stdin writer. A full channel is
        // the "encoder not ready" signal, and that frame is dropped.
        let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(1);
        let feeder = tokio::spawn(feed_encoder_stdin(
            stream_id,
            frame_rx,
            Arc::clone(&self.child_slot),
        ));

        self.write_frames(frame_tx).await;

        feeder.abort();
        if let Some(reader) = stdout_reader {
            reader.abort();
        }

        let child = self.child_slot.lock().await.take();
        if let Some(child) = child {
            child.stop().await;
        }
        Ok(())
    }

    /// Dequeue frames, throttle to the output cadence, and hand them to the
    /// stdin feeder; a not-ready feeder drops the frame.
    async fn write_frames(&mut self, frame_tx: mpsc::Sender<Bytes>) {
        let stream_id = self.feed.id;
        let target_fps = self.feed.output.fps.max(1);
        let frame_interval = Duration::from_secs_f64(1.0 / target_fps as f64);

        let mut frames_sent = 0u64;
        let mut dropped_not_ready = 0u64;
        let mut last_send = Instant::now() - frame_interval;
        let mut last_status = Instant::now();

        while self.running.load(Ordering::Relaxed) {
            let Some((frame, _metadata)) = self.queue.get(Duration::from_secs(1)).await else {
                if *self.shutdown.borrow() {
                    break;
                }
                continue;
            };

            // Throttle: sleep off the deficit relative to the previous send
            let since_last = last_send.elapsed();
            if since_last < frame_interval {
                tokio::time::sleep(frame_interval - since_last).await;
            }

            match frame_tx.try_send(frame.data) {
                Ok(()) => {
                    frames_sent += 1;
                    last_send = Instant::now();
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Encoder stdin is busy; preserve cadence by skipping
                    dropped_not_ready += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(stream_id, "Encoder feeder gone, ending writer loop");
                    break;
                }
            }

            if last_status.elapsed() >= STATUS_INTERVAL {
                info!(
                    stream_id,
                    frames_sent,
                    dropped_not_ready,
                    queue_depth = self.queue.size(),
                    queue_dropped = self.queue.dropped_count(),
                    "Encoder status"
                );
                last_status = Instant::now();
            }
        }
    }
}

/// Drain the feeder channel into the encoder's stdin. Writes hold the feed
/// mutex and verify the child is still present and alive first.
async fn feed_encoder_stdin(stream_id: u32, mut rx: mpsc::Receiver<Bytes>, slot: ChildSlot) {
    while let Some(data) = rx.recv().await {
        let mut guard = slot.lock().await;
        let Some(child) = guard.as_mut() else {
            debug!(stream_id, "Encoder process gone, stopping feeder");
            break;
        };
        if !child.is_alive() {
            warn!(stream_id, "Encoder process exited, stopping feeder");
            break;
        }
        if let Err(e) = child.write_stdin(&data).await {
            warn!(stream_id, error = %e, "Encoder stdin write failed");
            break;
        }
    }
}

/// Read ~1316-byte MPEG-TS chunks from the encoder's stdout and fan them out
async fn read_encoder_stdout(
    stream_id: u32,
    mut stdout: tokio::process::ChildStdout,
    broadcaster: WsBroadcaster,
    running: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; TS_CHUNK_SIZE];
    while running.load(Ordering::Relaxed) {
        match stdout.read(&mut buf).await {
            Ok(0) => {
                debug!(stream_id, "Encoder stdout closed");
                break;
            }
            Ok(n) => broadcaster.broadcast(Bytes::copy_from_slice(&buf[..n])),
            Err(e) => {
                warn!(stream_id, error = %e, "Encoder stdout read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeedSettings, QueueSettings};

    fn feed() -> FeedConfig {
        FeedConfig {
            id: 2,
            input: FeedSettings { width: 640, height: 480, fps: 30, format: PixelFormat::Bgr },
            output: FeedSettings { width: 640, height: 480, fps: 30, format: PixelFormat::Bgr },
            filters: Vec::new(),
            queue: QueueSettings::default(),
            input_port: 52522,
            output_port: 8556,
            ws_port: 9002,
        }
    }

    fn stage(target_ip: &str) -> EncoderStage {
        let (_tx, shutdown) = watch::channel(false);
        EncoderStage::new(
            feed(),
            target_ip.to_string(),
            TransportKind::Datagram,
            Arc::new(FrameQueue::new(10, 100)),
            None,
            Arc::new(tokio::sync::Mutex::new(None)),
            Arc::new(AtomicBool::new(true)),
            shutdown,
        )
    }

    #[test]
    fn tee_has_udp_leg_when_target_configured() {
        let stage = stage("10.0.0.9");
        let outputs = stage.tee_outputs();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0], "[f=mpegts]udp://10.0.0.9:8556?pkt_size=1316");
    }

    #[test]
    fn tee_is_empty_without_target_or_relay() {
        let stage = stage("");
        assert!(stage.tee_outputs().is_empty());
    }

    #[tokio::test]
    async fn tee_includes_pipe_leg_when_relay_enabled() {
        let (_tx, shutdown) = watch::channel(false);
        let broadcaster = WsBroadcaster::start(2, 0, shutdown.clone()).await.unwrap();

        let mut stage = stage("10.0.0.9");
        stage.broadcaster = Some(broadcaster);

        let outputs = stage.tee_outputs();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[1], "[f=mpegts]pipe:1");
        assert!(stage.encode_args(&outputs.join("|")).contains(&"tee".to_string()));
    }

    #[test]
    fn encode_args_carry_input_geometry() {
        let stage = stage("10.0.0.9");
        let args = stage.encode_args("[f=mpegts]pipe:1");
        assert!(args.contains(&"640x480".to_string()));
        assert!(args.contains(&"30".to_string()));
        assert!(args.contains(&"mpeg1video".to_string()));
    }
}
