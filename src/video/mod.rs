//! Concurrent multi-stream video relay: per-feed decode, filter, backpressure
//! and re-encode pipelines with WebSocket fan-out.

pub mod backoff;
pub mod decoder;
pub mod encoder;
pub mod feed;
pub mod filters;
pub mod frame;
pub mod process;
pub mod queue;
pub mod ws;
