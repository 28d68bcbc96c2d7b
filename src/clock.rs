use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

/// Wall-clock seconds since the Unix epoch, the timestamp unit used across
/// frame metadata and telemetry samples.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Sleep for `duration` unless shutdown is signalled first. Returns `true`
/// if the full sleep elapsed, `false` on shutdown.
pub async fn sleep_unless_shutdown(
    duration: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.wait_for(|stop| *stop) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_now_is_positive_and_monotonic_enough() {
        let a = unix_now();
        let b = unix_now();
        assert!(a > 1.0e9);
        assert!(b >= a);
    }

    #[tokio::test]
    async fn sleep_is_cut_short_by_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let sleeper = tokio::spawn(async move {
            sleep_unless_shutdown(Duration::from_secs(30), &mut rx).await
        });
        tx.send(true).unwrap();
        assert!(!sleeper.await.unwrap());
    }
}
