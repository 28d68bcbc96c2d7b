//! Telemetry receiver: length-prefixed snapshot records from a stream or
//! datagram source.
//!
//! Wire framing: an 8-byte little-endian unsigned length `L`, then `L` bytes
//! of a self-describing record (JSON-encoded snapshot). Records that arrive
//! short or fail to decode are skipped with a log line; connection failures
//! reconnect after a fixed 5 s delay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock;
use crate::config::TelemetryInputConfig;
use crate::net::{self, TransportError};
use crate::telemetry::data::RovSnapshot;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const RECV_BUFFER: usize = 8192;

/// Largest record we are willing to buffer; a corrupted length prefix would
/// otherwise stall the stream forever.
const MAX_RECORD_LEN: usize = 1 << 20;

pub struct TelemetryReceiver {
    config: TelemetryInputConfig,
    running: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
}

impl TelemetryReceiver {
    pub fn new(
        config: TelemetryInputConfig,
        running: Arc<AtomicBool>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        TelemetryReceiver {
            config,
            running,
            shutdown,
        }
    }

    /// Receive loop; every decoded snapshot is handed to `on_snapshot`.
    pub async fn run<F>(mut self, mut on_snapshot: F)
    where
        F: FnMut(RovSnapshot) + Send,
    {
        info!(
            host = %self.config.host,
            port = self.config.port,
            "Starting telemetry receiver"
        );

        while self.running.load(Ordering::Relaxed) {
            match self.run_connection(&mut on_snapshot).await {
                Ok(()) | Err(TransportError::Cancelled) => {}
                Err(e) => warn!(error = %e, "Telemetry connection failed"),
            }

            if !self.running.load(Ordering::Relaxed) {
                break;
            }
            debug!("Reconnecting telemetry source in 5s");
            if !clock::sleep_unless_shutdown(RECONNECT_DELAY, &mut self.shutdown).await {
                break;
            }
        }

        info!("Telemetry receiver stopped");
    }

    async fn run_connection<F>(&mut self, on_snapshot: &mut F) -> Result<(), TransportError>
    where
        F: FnMut(RovSnapshot) + Send,
    {
        let mut endpoint = net::open_input(
            self.config.network_type,
            &self.config.host,
            self.config.port,
            &self.running,
        )
        .await?;

        let mut buf = vec![0u8; RECV_BUFFER];
        let mut acc: Vec<u8> = Vec::new();

        while self.running.load(Ordering::Relaxed) {
            let n = endpoint.recv(&mut buf).await?;
            if n == 0 {
                debug!("Telemetry source closed the connection");
                return Ok(());
            }

            acc.extend_from_slice(&buf[..n]);
            for snapshot in drain_records(&mut acc) {
                on_snapshot(snapshot);
            }
        }

        Ok(())
    }
}

/// Pull every complete record out of the accumulator. Undecodable payloads
/// and oversized lengths are skipped; a trailing partial record stays
/// buffered for the next read.
fn drain_records(acc: &mut Vec<u8>) -> Vec<RovSnapshot> {
    let mut snapshots = Vec::new();

    loop {
        if acc.len() < 8 {
            break;
        }
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&acc[..8]);
        let len = u64::from_le_bytes(prefix) as usize;

        if len > MAX_RECORD_LEN {
            warn!(len, "Telemetry record length implausible, resynchronising");
            acc.clear();
            break;
        }
        if acc.len() < 8 + len {
            break;
        }

        match serde_json::from_slice::<RovSnapshot>(&acc[8..8 + len]) {
            Ok(snapshot) => snapshots.push(snapshot),
            Err(e) => warn!(error = %e, "Skipping undecodable telemetry record"),
        }
        acc.drain(..8 + len);
    }

    snapshots
}

/// Frame one snapshot the way the wire expects; used by tests and tooling
pub fn encode_record(snapshot: &RovSnapshot) -> Vec<u8> {
    let payload = serde_json::to_vec(snapshot).expect("snapshot serializes");
    let mut record = Vec::with_capacity(8 + payload.len());
    record.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    record.extend_from_slice(&payload);
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(depth: f64) -> RovSnapshot {
        RovSnapshot {
            depth,
            ..Default::default()
        }
    }

    #[test]
    fn drains_multiple_records_from_one_buffer() {
        let mut acc = Vec::new();
        acc.extend(encode_record(&snapshot(1.0)));
        acc.extend(encode_record(&snapshot(2.0)));

        let snapshots = drain_records(&mut acc);
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].depth, 1.0);
        assert_eq!(snapshots[1].depth, 2.0);
        assert!(acc.is_empty());
    }

    #[test]
    fn partial_record_stays_buffered() {
        let record = encode_record(&snapshot(3.0));
        let (head, tail) = record.split_at(record.len() - 5);

        let mut acc = head.to_vec();
        assert!(drain_records(&mut acc).is_empty());
        assert_eq!(acc.len(), head.len());

        acc.extend_from_slice(tail);
        let snapshots = drain_records(&mut acc);
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].depth, 3.0);
    }

    #[test]
    fn undecodable_payload_is_skipped() {
        let mut acc = Vec::new();
        let garbage = b"not-json";
        acc.extend_from_slice(&(garbage.len() as u64).to_le_bytes());
        acc.extend_from_slice(garbage);
        acc.extend(encode_record(&snapshot(4.0)));

        let snapshots = drain_records(&mut acc);
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].depth, 4.0);
    }

    #[test]
    fn implausible_length_resynchronises() {
        let mut acc = Vec::new();
        acc.extend_from_slice(&u64::MAX.to_le_bytes());
        acc.extend_from_slice(&[0u8; 32]);

        assert!(drain_records(&mut acc).is_empty());
        assert!(acc.is_empty());
    }
}
