use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use rand::Rng;
use tokio::time::{Duration, sleep};

pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// A delay of `base ± base * jitter`, clamped below at zero. Jittering every
/// periodic loop keeps a fleet of pools from synchronizing their polls.
pub fn jittered_delay(base_seconds: f64, jitter_factor: f64) -> Duration {
    if base_seconds <= 0.0 {
        return Duration::ZERO;
    }
    let jitter = jitter_factor.clamp(0.0, 0.99);
    let min_delay = (base_seconds * (1.0 - jitter)).max(0.0);
    let mut max_delay = base_seconds * (1.0 + jitter);
    if max_delay < min_delay {
        max_delay = min_delay;
    }
    let mut rng = rand::rng();
    Duration::from_secs_f64(rng.random_range(min_delay..=max_delay))
}

/// Sleeps in 100ms steps so a stop signal is observed promptly.
pub async fn sleep_with_shutdown(shutdown: &Arc<AtomicBool>, duration: Duration) {
    let mut remaining = duration;
    let step = Duration::from_millis(100);
    while remaining > Duration::ZERO && !shutdown.load(Ordering::SeqCst) {
        let next = if remaining > step { step } else { remaining };
        sleep(next).await;
        remaining = remaining.saturating_sub(next);
    }
}
