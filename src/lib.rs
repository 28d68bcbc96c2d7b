//! Per-stream MPEG-TS video relay and telemetry aggregator for a tethered
//! underwater ROV.
//!
//! Two pipelines share a transport abstraction and a schema-gated publish
//! discipline: per-feed video relays (decode → filter → bounded queue →
//! encode → UDP/TCP + WebSocket fan-out) and a single telemetry processor
//! (snapshot ingest → projection → smoothing → windowed aggregation →
//! broker publish).

pub mod clock;
pub mod config;
pub mod metrics;
pub mod mqtt;
pub mod net;
pub mod telemetry;
pub mod video;
