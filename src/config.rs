use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::net::TransportKind;

/// Main processor configuration, loaded from a JSON file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub video_config: VideoConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VideoConfig {
    #[serde(default)]
    pub input_feeds: Vec<FeedEntry>,

    #[serde(default)]
    pub output_feeds: Vec<FeedEntry>,
}

/// One configured stream, either on the input or the output side
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedEntry {
    pub id: u32,

    pub feed_settings: FeedSettings,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_settings: Option<FilterSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backpressure_queue_settings: Option<QueueSettings>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedSettings {
    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_fps")]
    pub fps: u32,

    #[serde(default)]
    pub format: PixelFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Bgr,
    Gray,
    Stereo,
}

impl PixelFormat {
    /// Bytes per pixel of the raw frames the codec engine produces
    pub fn channels(&self) -> usize {
        match self {
            PixelFormat::Gray => 1,
            PixelFormat::Bgr | PixelFormat::Stereo => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Bgr => "bgr",
            PixelFormat::Gray => "gray",
            PixelFormat::Stereo => "stereo",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FilterSettings {
    #[serde(default)]
    pub filters: Vec<FrameFilterSpec>,
}

/// One named transform in a feed's ordered filter pipeline.
/// Parameters are flattened; each filter reads only the ones it needs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FrameFilterSpec {
    pub name: String,

    #[serde(default = "default_filter_delta")]
    pub delta: f32,

    #[serde(default = "default_filter_alpha")]
    pub alpha: f32,

    #[serde(default = "default_filter_scale")]
    pub scale: f32,

    #[serde(default = "default_filter_ksize")]
    pub ksize: usize,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct QueueSettings {
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            max_queue_size: default_max_queue_size(),
            queue_timeout_ms: default_queue_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    #[serde(default = "default_host_ip")]
    pub host_ip: String,

    /// Empty string disables the UDP/TCP output leg of the encoder tee
    #[serde(default)]
    pub target_ip: String,

    #[serde(default = "default_input_base_port")]
    pub input_base_video_port: u16,

    #[serde(default = "default_output_base_port")]
    pub output_base_video_port: u16,

    #[serde(default = "default_input_network_type")]
    pub input_network_type: TransportKind,

    #[serde(default = "default_output_network_type")]
    pub output_network_type: TransportKind,

    #[serde(default)]
    pub websocket_relay: WebsocketRelayConfig,

    #[serde(default)]
    pub client_resilience: ResilienceConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebsocketRelayConfig {
    #[serde(default = "default_ws_enabled")]
    pub enabled: bool,

    #[serde(default = "default_ws_base_port")]
    pub base_port: u16,
}

impl Default for WebsocketRelayConfig {
    fn default() -> Self {
        WebsocketRelayConfig {
            enabled: default_ws_enabled(),
            base_port: default_ws_base_port(),
        }
    }
}

/// Reconnect policy knobs for the decoder side of every feed
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct ResilienceConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    #[serde(default = "default_extended_cooldown_ms")]
    pub extended_cooldown_ms: u64,

    #[serde(default = "default_max_frame_errors")]
    pub max_frame_errors: u32,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        ResilienceConfig {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            extended_cooldown_ms: default_extended_cooldown_ms(),
            max_frame_errors: default_max_frame_errors(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub input: TelemetryInputConfig,

    #[serde(default)]
    pub processing: ProcessingConfig,

    #[serde(default = "default_base_topic")]
    pub base_topic: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            input: TelemetryInputConfig::default(),
            processing: ProcessingConfig::default(),
            base_topic: default_base_topic(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryInputConfig {
    #[serde(default = "default_host_ip")]
    pub host: String,

    #[serde(default = "default_telemetry_port")]
    pub port: u16,

    #[serde(default = "default_input_network_type")]
    pub network_type: TransportKind,
}

impl Default for TelemetryInputConfig {
    fn default() -> Self {
        TelemetryInputConfig {
            host: default_host_ip(),
            port: default_telemetry_port(),
            network_type: default_input_network_type(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProcessingConfig {
    /// Per-sensor filter chains, keyed by sensor name
    #[serde(default)]
    pub filters: HashMap<String, Vec<SensorFilterSpec>>,

    #[serde(default)]
    pub aggregation: AggregationConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SensorFilterSpec {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default = "default_process_variance")]
    pub process_variance: f64,

    #[serde(default = "default_measurement_variance")]
    pub measurement_variance: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AggregationConfig {
    #[serde(default = "default_aggregation_enabled")]
    pub enabled: bool,

    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// High-frequency sensors routed through the time-window aggregator;
    /// everything else is written straight into the latest-state map.
    #[serde(default)]
    pub sensors: Vec<String>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        AggregationConfig {
            enabled: default_aggregation_enabled(),
            window_ms: default_window_ms(),
            sensors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default = "default_memory_threshold_mb")]
    pub memory_threshold_mb: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            memory_threshold_mb: default_memory_threshold_mb(),
        }
    }
}

// Default value functions
fn default_width() -> u32 { 640 }
fn default_height() -> u32 { 480 }
fn default_fps() -> u32 { 30 }
fn default_filter_delta() -> f32 { 30.0 }
fn default_filter_alpha() -> f32 { 1.5 }
fn default_filter_scale() -> f32 { 0.5 }
fn default_filter_ksize() -> usize { 5 }
fn default_max_queue_size() -> usize { 1000 }
fn default_queue_timeout_ms() -> u64 { 500 }
fn default_host_ip() -> String { "127.0.0.1".to_string() }
fn default_input_base_port() -> u16 { 52520 }
fn default_output_base_port() -> u16 { 8554 }
fn default_input_network_type() -> TransportKind { TransportKind::Stream }
fn default_output_network_type() -> TransportKind { TransportKind::Datagram }
fn default_ws_enabled() -> bool { true }
fn default_ws_base_port() -> u16 { 9000 }
fn default_base_delay_ms() -> u64 { 500 }
fn default_max_delay_ms() -> u64 { 30_000 }
fn default_max_consecutive_failures() -> u32 { 10 }
fn default_extended_cooldown_ms() -> u64 { 60_000 }
fn default_max_frame_errors() -> u32 { 50 }
fn default_base_topic() -> String { "hydrobotics/rov/0/telemetry".to_string() }
fn default_telemetry_port() -> u16 { 5000 }
fn default_process_variance() -> f64 { 1e-5 }
fn default_measurement_variance() -> f64 { 1e-2 }
fn default_aggregation_enabled() -> bool { true }
fn default_window_ms() -> u64 { 1000 }
fn default_memory_threshold_mb() -> f64 { 512.0 }

/// Fully-resolved settings for one feed, with input and output sides paired
/// by id and the per-feed ports computed from the base ports.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub id: u32,
    pub input: FeedSettings,
    pub output: FeedSettings,
    pub filters: Vec<FrameFilterSpec>,
    pub queue: QueueSettings,
    pub input_port: u16,
    pub output_port: u16,
    pub ws_port: u16,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;

        let config: Config =
            serde_json::from_str(&content).context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.video_config.input_feeds.is_empty() {
            anyhow::bail!("No input feeds configured");
        }
        for feed in &self.video_config.input_feeds {
            if feed.feed_settings.width == 0 || feed.feed_settings.height == 0 {
                anyhow::bail!("Feed {} has zero-sized frame dimensions", feed.id);
            }
            if feed.feed_settings.fps == 0 {
                anyhow::bail!("Feed {} has zero fps", feed.id);
            }
        }
        Ok(())
    }

    /// Pair input and output feed entries by id. A feed with no output entry
    /// keeps its input settings on the output side.
    pub fn feeds(&self) -> Vec<FeedConfig> {
        let net = &self.network;
        self.video_config
            .input_feeds
            .iter()
            .map(|input| {
                let output = self
                    .video_config
                    .output_feeds
                    .iter()
                    .find(|o| o.id == input.id)
                    .map(|o| o.feed_settings.clone())
                    .unwrap_or_else(|| input.feed_settings.clone());

                FeedConfig {
                    id: input.id,
                    input: input.feed_settings.clone(),
                    output,
                    filters: input
                        .filter_settings
                        .as_ref()
                        .map(|f| f.filters.clone())
                        .unwrap_or_default(),
                    queue: input.backpressure_queue_settings.unwrap_or_default(),
                    input_port: net.input_base_video_port + input.id as u16,
                    output_port: net.output_base_video_port + input.id as u16,
                    ws_port: net.websocket_relay.base_port + input.id as u16,
                }
            })
            .collect()
    }
}

impl FeedConfig {
    /// Size in bytes of one raw input frame
    pub fn input_frame_size(&self) -> usize {
        self.input.width as usize * self.input.height as usize * self.input.format.channels()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> &'static str {
        r#"{
            "video_config": {
                "input_feeds": [
                    {"id": 0, "feed_settings": {"width": 640, "height": 480, "fps": 30, "format": "bgr"}},
                    {"id": 1, "feed_settings": {"width": 1280, "height": 720, "fps": 60, "format": "stereo"},
                     "backpressure_queue_settings": {"max_queue_size": 500, "queue_timeout_ms": 250}}
                ],
                "output_feeds": [
                    {"id": 1, "feed_settings": {"width": 640, "height": 360, "fps": 30, "format": "bgr"}}
                ]
            },
            "network": {
                "host_ip": "10.0.0.2",
                "target_ip": "10.0.0.9",
                "input_base_video_port": 52520,
                "output_base_video_port": 8554,
                "input_network_type": "tcp",
                "output_network_type": "udp",
                "websocket_relay": {"enabled": true, "base_port": 9000},
                "client_resilience": {"base_delay_ms": 500, "max_delay_ms": 30000,
                                      "max_consecutive_failures": 3,
                                      "extended_cooldown_ms": 60000, "max_frame_errors": 50}
            }
        }"#
    }

    #[test]
    fn parses_minimal_config() {
        let config: Config = serde_json::from_str(minimal_json()).unwrap();
        assert_eq!(config.video_config.input_feeds.len(), 2);
        assert_eq!(config.network.input_network_type, TransportKind::Stream);
        assert_eq!(config.network.output_network_type, TransportKind::Datagram);
        assert_eq!(config.network.client_resilience.max_consecutive_failures, 3);
        config.validate().unwrap();
    }

    #[test]
    fn feeds_pair_input_and_output_by_id() {
        let config: Config = serde_json::from_str(minimal_json()).unwrap();
        let feeds = config.feeds();

        // Feed 0 has no output entry, so output mirrors input
        assert_eq!(feeds[0].output.width, 640);
        assert_eq!(feeds[0].input_port, 52520);
        assert_eq!(feeds[0].output_port, 8554);
        assert_eq!(feeds[0].ws_port, 9000);

        // Feed 1 has a distinct output side and custom queue settings
        assert_eq!(feeds[1].output.width, 640);
        assert_eq!(feeds[1].output.height, 360);
        assert_eq!(feeds[1].queue.max_queue_size, 500);
        assert_eq!(feeds[1].input_port, 52521);
        assert_eq!(feeds[1].input_frame_size(), 1280 * 720 * 3);
    }

    #[test]
    fn rejects_empty_feed_list() {
        let config: Config = serde_json::from_str(
            r#"{"video_config": {"input_feeds": []}, "network": {}}"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn gray_format_is_single_channel() {
        assert_eq!(PixelFormat::Gray.channels(), 1);
        assert_eq!(PixelFormat::Bgr.channels(), 3);
    }
}
