//! Request pacing for the chat completions endpoint and Semantic Scholar.
//!
//! Every outbound call waits on an [`AdaptivePacer`] first. The gateway owns
//! one pacer shared by all runs cloned from it, so concurrent runs together
//! stay under the provider's requests-per-minute quota. A 429 from either
//! service widens the spacing; a minute without one restores it.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;

type Gate = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Widest spacing, as a multiple of the configured one.
const MAX_SLOWDOWN: u32 = 16;
/// Quiet time after the last 429 before the configured spacing returns.
const RECOVERY: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Throttle {
    factor: u32,
    last_hit: Option<Instant>,
}

/// Spaces calls at a fixed period, stretched while the service pushes back.
pub struct AdaptivePacer {
    gate: ArcSwap<Gate>,
    period: Duration,
    throttle: Mutex<Throttle>,
}

impl std::fmt::Debug for AdaptivePacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptivePacer")
            .field("period", &self.period)
            .field("slowdown", &self.slowdown())
            .finish()
    }
}

impl AdaptivePacer {
    /// At least `period` between calls; zero is raised to one millisecond.
    pub fn new(period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        Self {
            gate: ArcSwap::from_pointee(gate(period)),
            period,
            throttle: Mutex::new(Throttle {
                factor: 1,
                last_hit: None,
            }),
        }
    }

    /// `rpm` calls per minute, evenly spaced. Zero is treated as one.
    pub fn per_minute(rpm: u32) -> Self {
        Self::new(Duration::from_millis(60_000 / u64::from(rpm.max(1))))
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Current stretch of the configured period (1 means unthrottled).
    pub fn slowdown(&self) -> u32 {
        self.throttle.lock().map(|t| t.factor).unwrap_or(1)
    }

    /// Wait for the next slot.
    pub async fn wait(&self) {
        self.recover();
        let gate = self.gate.load_full();
        gate.until_ready().await;
    }

    /// The service answered 429: double the spacing, up to [`MAX_SLOWDOWN`].
    pub fn throttled(&self) {
        let Ok(mut throttle) = self.throttle.lock() else {
            return;
        };
        throttle.last_hit = Some(Instant::now());
        let factor = (throttle.factor * 2).min(MAX_SLOWDOWN);
        if factor != throttle.factor {
            throttle.factor = factor;
            tracing::debug!(slowdown = factor, "pacing widened after 429");
            self.gate.store(Arc::new(gate(self.period * factor)));
        }
    }

    fn recover(&self) {
        let Ok(mut throttle) = self.throttle.lock() else {
            return;
        };
        let quiet = throttle.last_hit.is_some_and(|t| t.elapsed() >= RECOVERY);
        if quiet && throttle.factor > 1 {
            throttle.factor = 1;
            throttle.last_hit = None;
            tracing::debug!("pacing restored");
            self.gate.store(Arc::new(gate(self.period)));
        }
    }
}

fn gate(period: Duration) -> Gate {
    let quota = Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(std::num::NonZeroU32::MIN));
    RateLimiter::direct(quota)
}

/// `Some(retry_after)` when the response is a 429, `None` otherwise.
pub fn rate_limit_delay(resp: &reqwest::Response) -> Option<Option<Duration>> {
    (resp.status() == StatusCode::TOO_MANY_REQUESTS).then(|| {
        resp.headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()))
    })
}

/// Retry-After as delta-seconds or an HTTP-date relative to `now`.
///
/// A date already in the past means "retry now".
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    Some((at.with_timezone(&Utc) - now).to_std().unwrap_or(Duration::ZERO))
}
