//! Delay calculations for reconnects and queue pacing.

use crate::config::ConnectionConfig;
use rand::Rng;
use std::time::Duration;

/// Growth factor between consecutive reconnect attempts.
const RECONNECT_FACTOR: f64 = 1.5;

/// Reconnect delay without jitter: `min(base * 1.5^attempts, max)`.
pub fn reconnect_base_delay(config: &ConnectionConfig, attempts: u32) -> Duration {
    let base = config.reconnect_base_delay_ms as f64;
    let max = config.reconnect_max_delay_ms as f64;
    // powi saturates to inf for large exponents, min() brings it back.
    let delay = (base * RECONNECT_FACTOR.powi(attempts.min(i32::MAX as u32) as i32)).min(max);
    Duration::from_millis(delay as u64)
}

/// Full reconnect delay: base delay plus uniform jitter in `[0, jitter_ms)`.
pub fn reconnect_delay(config: &ConnectionConfig, attempts: u32) -> Duration {
    reconnect_base_delay(config, attempts) + uniform_jitter(config.reconnect_jitter_ms)
}

/// Uniform jitter in `[0, max_ms)`.
pub fn uniform_jitter(max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
}

/// Spread `delay` by up to ±`factor` to avoid synchronized retries.
pub fn add_jitter(delay: Duration, factor: f64) -> Duration {
    let factor = factor.clamp(0.0, 1.0);
    if factor == 0.0 || delay.is_zero() {
        return delay;
    }
    let spread: f64 = rand::thread_rng().gen_range(-factor..=factor);
    Duration::from_secs_f64((delay.as_secs_f64() * (1.0 + spread)).max(0.0))
}
