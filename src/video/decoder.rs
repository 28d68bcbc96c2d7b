//! Decoder stage: turns an inbound MPEG-TS byte stream into raw frames.
//!
//! Per connection: open the transport endpoint, launch the decoder child,
//! forward socket bytes into its stdin, and read exact-size raw frames off
//! its stdout. Frames pass the filter pipeline, get tagged with metadata and
//! land in the backpressure queue. Connection failures go through the
//! reconnect policy; frame-level errors are counted and only a run of
//! `max_frame_errors` forces a reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::ChildStdout;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::clock;
use crate::config::{FeedConfig, PixelFormat, ResilienceConfig};
use crate::net::{self, TransportError, TransportKind};
use crate::video::backoff::{BackoffAction, ReconnectPolicy};
use crate::video::filters::FilterPipeline;
use crate::video::frame::{FrameMetadata, RawFrame};
use crate::video::process::{ProcessError, SupervisedChild};
use crate::video::queue::BackpressureQueue;

/// Shared slot for a feed's live codec child; the mutex is what makes
/// "check alive, then write stdin" atomic against teardown.
pub type ChildSlot = Arc<Mutex<Option<SupervisedChild>>>;

pub type FrameQueue = BackpressureQueue<(RawFrame, FrameMetadata)>;

const STATUS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum DecoderError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

fn decode_args(format: PixelFormat) -> Vec<String> {
    let pix_fmt = match format {
        PixelFormat::Gray => "gray",
        PixelFormat::Bgr | PixelFormat::Stereo => "bgr24",
    };
    [
        "-loglevel", "error",
        "-i", "pipe:0",
        "-f", "rawvideo",
        "-pix_fmt", pix_fmt,
        "-an",
        "pipe:1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

enum ReadOutcome {
    Full,
    Short(usize),
    Eof,
}

async fn read_frame(stdout: &mut ChildStdout, buf: &mut [u8]) -> std::io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stdout.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok(if filled == 0 {
                ReadOutcome::Eof
            } else {
                ReadOutcome::Short(filled)
            });
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}

pub struct DecoderStage {
    feed: FeedConfig,
    host_ip: String,
    transport: TransportKind,
    resilience: ResilienceConfig,
    queue: Arc<FrameQueue>,
    filters: FilterPipeline,
    child_slot: ChildSlot,
    running: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
    frame_counter: u64,
}

impl DecoderStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        feed: FeedConfig,
        host_ip: String,
        transport: TransportKind,
        resilience: ResilienceConfig,
        queue: Arc<FrameQueue>,
        child_slot: ChildSlot,
        running: Arc<AtomicBool>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let filters = FilterPipeline::from_specs(&feed.filters);
        DecoderStage {
            feed,
            host_ip,
            transport,
            resilience,
            queue,
            filters,
            child_slot,
            running,
            shutdown,
            frame_counter: 0,
        }
    }

    /// Connect-decode-reconnect loop; runs until shutdown
    pub async fn run(mut self) {
        let stream_id = self.feed.id;
        info!(
            stream_id,
            port = self.feed.input_port,
            "Starting MPEG-TS receiver"
        );

        let mut policy = ReconnectPolicy::new(&self.resilience);

        while self.running.load(Ordering::Relaxed) {
            let frames = match self.run_connection().await {
                Ok(frames) => frames,
                Err(DecoderError::Transport(TransportError::Cancelled)) => break,
                Err(e) => {
                    warn!(stream_id, error = %e, "Decoder connection failed");
                    0
                }
            };

            if !self.running.load(Ordering::Relaxed) {
                break;
            }

            if frames > 0 {
                policy.on_success();
            }

            match policy.on_failure() {
                BackoffAction::Retry(delay) => {
                    debug!(stream_id, delay_ms = delay.as_millis() as u64, "Reconnecting");
                    if !clock::sleep_unless_shutdown(delay, &mut self.shutdown).await {
                        break;
                    }
                }
                BackoffAction::Cooldown(delay) => {
                    warn!(
                        stream_id,
                        cooldown_s = delay.as_secs(),
                        "Max consecutive failures reached, entering extended cooldown"
                    );
                    if !clock::sleep_unless_shutdown(delay, &mut self.shutdown).await {
                        break;
                    }
                }
            }
        }

        info!(stream_id, "MPEG-TS receiver stopped");
    }

    /// One connection lifetime. Returns the number of frames produced.
    async fn run_connection(&mut self) -> Result<u64, DecoderError> {
        let stream_id = self.feed.id;

        let endpoint = net::open_input(
            self.transport,
            &self.host_ip,
            self.feed.input_port,
            &self.running,
        )
        .await?;

        let mut child = SupervisedChild::spawn(
            "decoder",
            "ffmpeg",
            &decode_args(self.feed.input.format),
            true,
        )?;
        let mut stdout = child.take_stdout()?;

        {
            let mut slot = self.child_slot.lock().await;
            *slot = Some(child);
        }

        let forwarder = spawn_forwarder(
            stream_id,
            endpoint,
            Arc::clone(&self.child_slot),
            Arc::clone(&self.running),
        );

        let frames = self.decode_frames(&mut stdout).await;

        // Teardown order: stop the forwarder, then the child, then reconnect
        forwarder.abort();
        let child = self.child_slot.lock().await.take();
        if let Some(child) = child {
            child.stop().await;
        }

        Ok(frames)
    }

    async fn decode_frames(&mut self, stdout: &mut ChildStdout) -> u64 {
        let stream_id = self.feed.id;
        let frame_size = self.feed.input_frame_size();
        let channels = self.feed.input.format.channels();
        let mut buf = vec![0u8; frame_size];

        let mut frames_processed = 0u64;
        let mut frame_errors = 0u32;
        let mut last_status = Instant::now();

        while self.running.load(Ordering::Relaxed) {
            match read_frame(stdout, &mut buf).await {
                Ok(ReadOutcome::Full) => {}
                Ok(ReadOutcome::Short(got)) => {
                    frame_errors += 1;
                    warn!(
                        stream_id,
                        got,
                        expected = frame_size,
                        errors = frame_errors,
                        "Incomplete frame from decoder"
                    );
                    if frame_errors >= self.resilience.max_frame_errors {
                        warn!(stream_id, "Too many consecutive frame errors, reconnecting");
                        break;
                    }
                    continue;
                }
                Ok(ReadOutcome::Eof) => {
                    debug!(stream_id, "Decoder output ended");
                    break;
                }
                Err(e) => {
                    frame_errors += 1;
                    warn!(stream_id, error = %e, errors = frame_errors, "Frame read error");
                    if frame_errors >= self.resilience.max_frame_errors {
                        warn!(stream_id, "Too many consecutive frame errors, reconnecting");
                        break;
                    }
                    continue;
                }
            }

            let frame = match RawFrame::from_buffer(
                buf.clone(),
                self.feed.input.width,
                self.feed.input.height,
                channels,
            ) {
                Some(frame) => self.filters.apply(frame),
                None => {
                    frame_errors += 1;
                    if frame_errors >= self.resilience.max_frame_errors {
                        break;
                    }
                    continue;
                }
            };

            frame_errors = 0;
            self.frame_counter += 1;
            frames_processed += 1;

            let metadata = FrameMetadata {
                frame_id: self.frame_counter,
                timestamp_received: clock::unix_now(),
                camera_type: self.feed.input.format.as_str().to_string(),
                stream_id,
                original_fps: self.feed.input.fps,
                target_fps: self.feed.output.fps,
                input_width: self.feed.input.width,
                input_height: self.feed.input.height,
                output_width: self.feed.output.width,
                output_height: self.feed.output.height,
            };

            self.queue.put((frame, metadata));

            if last_status.elapsed() >= STATUS_INTERVAL {
                info!(
                    stream_id,
                    frames_processed,
                    queue_depth = self.queue.size(),
                    dropped = self.queue.dropped_count(),
                    "Decoder status"
                );
                last_status = Instant::now();
            }
        }

        frames_processed
    }
}

/// Forward bytes from the transport endpoint into the decoder's stdin.
/// Stops on socket EOF or write failure and closes the child's stdin so the
/// decoder flushes and exits.
fn spawn_forwarder(
    stream_id: u32,
    mut endpoint: net::InputEndpoint,
    child_slot: ChildSlot,
    running: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        while running.load(Ordering::Relaxed) {
            let n = match endpoint.recv(&mut buf).await {
                Ok(0) => {
                    debug!(stream_id, "Source closed the connection");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(stream_id, error = %e, "Source read error");
                    break;
                }
            };

            let mut slot = child_slot.lock().await;
            let Some(child) = slot.as_mut() else {
                debug!(stream_id, "Decoder gone, stopping forwarder");
                break;
            };
            if let Err(e) = child.write_stdin(&buf[..n]).await {
                warn!(stream_id, error = %e, "Decoder stdin write failed");
                break;
            }
        }

        if let Some(child) = child_slot.lock().await.as_mut() {
            child.close_stdin();
        }
    })
}
