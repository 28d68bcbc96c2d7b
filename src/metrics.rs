//! Resident-memory sampler: wakes every 500 ms, reads VmRSS from
//! /proc/self/status and warns past the configured threshold.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Parse VmRSS (in MB) out of a /proc/self/status dump
fn parse_rss_mb(status: &str) -> Option<f64> {
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: f64 = rest.split_whitespace().next()?.parse().ok()?;
            return Some(kb / 1024.0);
        }
    }
    None
}

pub fn resident_memory_mb() -> Option<f64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_rss_mb(&status)
}

pub async fn run_sampler(
    threshold_mb: f64,
    running: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
    while running.load(Ordering::Relaxed) {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.wait_for(|stop| *stop) => break,
        }

        if let Some(mem_mb) = resident_memory_mb() {
            debug!(mem_mb = format!("{:.1}", mem_mb), "Memory sample");
            if mem_mb > threshold_mb {
                warn!(
                    mem_mb = format!("{:.1}", mem_mb),
                    threshold_mb, "High memory usage"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vmrss_line() {
        let status = "Name:\tproc\nVmSize:\t  200000 kB\nVmRSS:\t   51200 kB\n";
        assert_eq!(parse_rss_mb(status), Some(50.0));
    }

    #[test]
    fn missing_vmrss_yields_none() {
        assert_eq!(parse_rss_mb("Name:\tproc\n"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn live_sample_is_positive() {
        let mem = resident_memory_mb().unwrap();
        assert!(mem > 0.0);
    }
}
