//! Per-server communication health
//!
//! Every command outcome is reported here. Each server keeps a rolling
//! window of outcomes that classifies it as OK, Degraded or Unusable, an
//! optional forced delay (server-directed backoff) and a token bucket that
//! throttles how fast the engine may issue proactive requests.
//!
//! One lock guards the whole map; lookups create trackers on first use.
//! Subscribers receive a [`QualityChange`] only when a server's
//! classification actually changes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;

/// Source of the current time, swappable in tests
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = *self.offset.lock().unwrap_or_else(|e| e.into_inner());
        self.base + offset
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommQuality {
    Ok,
    Degraded,
    Unusable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityChange {
    pub server_id: String,
    pub quality: CommQuality,
}

#[derive(Debug, Clone, Copy)]
struct ServerAccessRecord {
    success: bool,
    at: Instant,
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, window: Duration, now: Instant) -> Self {
        let capacity = capacity as f64;
        let secs = window.as_secs_f64().max(f64::EPSILON);
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / secs,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take a token; false when the bucket is empty
    fn take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
struct ServerTracker {
    quality: CommQuality,
    window: VecDeque<ServerAccessRecord>,
    delay_until: Option<Instant>,
    bucket: TokenBucket,
}

impl ServerTracker {
    fn new(config: &HealthConfig, now: Instant) -> Self {
        Self {
            quality: CommQuality::Ok,
            window: VecDeque::new(),
            delay_until: None,
            bucket: TokenBucket::new(config.rate_capacity(), config.rate_window(), now),
        }
    }

    fn classify(&mut self, config: &HealthConfig, now: Instant) -> CommQuality {
        let window = config.window();
        while let Some(front) = self.window.front() {
            if now.saturating_duration_since(front.at) > window {
                self.window.pop_front();
            } else {
                break;
            }
        }

        if let Some(until) = self.delay_until {
            if until > now {
                return CommQuality::Unusable;
            }
            self.delay_until = None;
        }

        let total = self.window.len();
        if total < config.min_samples() {
            return CommQuality::Ok;
        }

        let successes = self.window.iter().filter(|r| r.success).count();
        if successes == 0 {
            return CommQuality::Unusable;
        }

        let ratio = successes as f64 / total as f64;
        if ratio >= config.ok_threshold {
            CommQuality::Ok
        } else if ratio >= config.degraded_threshold {
            CommQuality::Degraded
        } else {
            CommQuality::Unusable
        }
    }
}

pub struct CommHealthTracker {
    config: HealthConfig,
    clock: Arc<dyn Clock>,
    trackers: Mutex<HashMap<String, ServerTracker>>,
    subscribers: Mutex<Vec<flume::Sender<QualityChange>>>,
}

impl CommHealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: HealthConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            trackers: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Receive quality changes from now on
    pub fn subscribe(&self) -> flume::Receiver<QualityChange> {
        let (tx, rx) = flume::unbounded();
        self.lock_subscribers().push(tx);
        rx
    }

    /// Record the outcome of one exchange with `server_id`
    pub fn report(&self, server_id: &str, success: bool) {
        let now = self.clock.now();
        self.update(server_id, |tracker| {
            tracker.window.push_back(ServerAccessRecord { success, at: now });
        });
    }

    /// The server asked us to back off; it stays Unusable until the delay passes
    pub fn report_delay(&self, server_id: &str, delay: Duration) {
        let until = self.clock.now() + delay;
        info!(server = server_id, delay_secs = delay.as_secs(), "Server requested backoff");
        self.update(server_id, |tracker| {
            if tracker.delay_until.map_or(true, |d| d < until) {
                tracker.delay_until = Some(until);
            }
        });
    }

    pub fn quality(&self, server_id: &str) -> CommQuality {
        self.update(server_id, |_| {});
        self.lock_trackers()
            .get(server_id)
            .map(|t| t.quality)
            .unwrap_or(CommQuality::Ok)
    }

    /// Time left on a forced delay, if one is active
    pub fn delay_remaining(&self, server_id: &str) -> Option<Duration> {
        let now = self.clock.now();
        let trackers = self.lock_trackers();
        trackers
            .get(server_id)
            .and_then(|t| t.delay_until)
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Take a token for a proactive request. Returns true (throttled)
    /// when the server's bucket is empty.
    pub fn is_rate_limited(&self, server_id: &str) -> bool {
        let now = self.clock.now();
        let mut trackers = self.lock_trackers();
        let tracker = trackers
            .entry(server_id.to_string())
            .or_insert_with(|| ServerTracker::new(&self.config, now));
        let throttled = !tracker.bucket.take(now);
        if throttled {
            debug!(server = server_id, "Rate limited");
        }
        throttled
    }

    /// Forget everything about `server_id`: back to OK, window cleared
    pub fn reset(&self, server_id: &str) {
        let now = self.clock.now();
        let changed = {
            let mut trackers = self.lock_trackers();
            let previous = trackers
                .insert(server_id.to_string(), ServerTracker::new(&self.config, now))
                .map(|t| t.quality);
            previous.is_some_and(|q| q != CommQuality::Ok)
        };
        if changed {
            self.notify(server_id, CommQuality::Ok);
        }
    }

    /// Re-classify every known server, e.g. so windows age out and delays lapse
    pub fn refresh(&self) {
        let now = self.clock.now();
        let changes: Vec<QualityChange> = {
            let mut trackers = self.lock_trackers();
            trackers
                .iter_mut()
                .filter_map(|(server_id, tracker)| {
                    let quality = tracker.classify(&self.config, now);
                    if quality != tracker.quality {
                        tracker.quality = quality;
                        Some(QualityChange {
                            server_id: server_id.clone(),
                            quality,
                        })
                    } else {
                        None
                    }
                })
                .collect()
        };
        for change in changes {
            self.notify(&change.server_id, change.quality);
        }
    }

    /// Re-evaluate all trackers every tick until `cancel` fires
    pub fn spawn_ticker(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        let period = self.config.tick();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Comm health ticker stopped");
                        break;
                    }
                    _ = interval.tick() => tracker.refresh(),
                }
            }
        })
    }

    fn update(&self, server_id: &str, mutate: impl FnOnce(&mut ServerTracker)) {
        let now = self.clock.now();
        let change = {
            let mut trackers = self.lock_trackers();
            let tracker = trackers
                .entry(server_id.to_string())
                .or_insert_with(|| ServerTracker::new(&self.config, now));
            mutate(tracker);
            let quality = tracker.classify(&self.config, now);
            if quality != tracker.quality {
                tracker.quality = quality;
                Some(quality)
            } else {
                None
            }
        };
        if let Some(quality) = change {
            self.notify(server_id, quality);
        }
    }

    fn notify(&self, server_id: &str, quality: CommQuality) {
        match quality {
            CommQuality::Ok => info!(server = server_id, "Comm quality is now OK"),
            other => warn!(server = server_id, quality = ?other, "Comm quality changed"),
        }
        let change = QualityChange {
            server_id: server_id.to_string(),
            quality,
        };
        // Drop subscribers whose receiver is gone
        self.lock_subscribers()
            .retain(|tx| tx.send(change.clone()).is_ok());
    }

    fn lock_trackers(&self) -> MutexGuard<'_, HashMap<String, ServerTracker>> {
        self.trackers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Vec<flume::Sender<QualityChange>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (CommHealthTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = HealthConfig {
            rate_capacity: 3,
            rate_window_secs: 30,
            ..HealthConfig::default()
        };
        (CommHealthTracker::with_clock(config, clock.clone()), clock)
    }

    fn report_many(t: &CommHealthTracker, server: &str, ok: usize, failed: usize) {
        for _ in 0..ok {
            t.report(server, true);
        }
        for _ in 0..failed {
            t.report(server, false);
        }
    }

    #[test]
    fn test_few_samples_stay_ok() {
        let (t, _) = tracker();
        report_many(&t, "s1", 0, 3);
        assert_eq!(t.quality("s1"), CommQuality::Ok);
    }

    #[test]
    fn test_ratio_classification() {
        let (t, _) = tracker();
        report_many(&t, "eight", 8, 2);
        report_many(&t, "six", 6, 4);
        report_many(&t, "none", 0, 10);
        assert_eq!(t.quality("eight"), CommQuality::Ok);
        assert_eq!(t.quality("six"), CommQuality::Degraded);
        assert_eq!(t.quality("none"), CommQuality::Unusable);
    }

    #[test]
    fn test_window_ages_out() {
        let (t, clock) = tracker();
        report_many(&t, "s1", 0, 10);
        assert_eq!(t.quality("s1"), CommQuality::Unusable);

        clock.advance(Duration::from_secs(181));
        t.refresh();
        assert_eq!(t.quality("s1"), CommQuality::Ok);
    }

    #[test]
    fn test_forced_delay() {
        let (t, clock) = tracker();
        t.report_delay("s1", Duration::from_secs(10));
        assert_eq!(t.quality("s1"), CommQuality::Unusable);
        assert_eq!(t.delay_remaining("s1"), Some(Duration::from_secs(10)));

        clock.advance(Duration::from_secs(4));
        assert_eq!(t.delay_remaining("s1"), Some(Duration::from_secs(6)));

        clock.advance(Duration::from_secs(6));
        assert_eq!(t.delay_remaining("s1"), None);
        t.refresh();
        assert_eq!(t.quality("s1"), CommQuality::Ok);
    }

    #[test]
    fn test_change_events_only_on_change() {
        let (t, _) = tracker();
        let rx = t.subscribe();

        report_many(&t, "s1", 0, 4);
        // Fourth failure crosses into Unusable; later ones do not fire again
        report_many(&t, "s1", 0, 3);
        let changes: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            changes,
            vec![QualityChange {
                server_id: "s1".into(),
                quality: CommQuality::Unusable
            }]
        );

        t.reset("s1");
        assert_eq!(t.quality("s1"), CommQuality::Ok);
        let changes: Vec<_> = rx.try_iter().collect();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].quality, CommQuality::Ok);

        // Resetting a healthy server is silent
        t.reset("s1");
        assert!(rx.try_iter().next().is_none());
    }

    #[test]
    fn test_rate_limiter() {
        let (t, clock) = tracker();
        assert!(!t.is_rate_limited("s1"));
        assert!(!t.is_rate_limited("s1"));
        assert!(!t.is_rate_limited("s1"));
        assert!(t.is_rate_limited("s1"));

        // Other servers have their own bucket
        assert!(!t.is_rate_limited("s2"));

        clock.advance(Duration::from_secs(30));
        assert!(!t.is_rate_limited("s1"));
        assert!(!t.is_rate_limited("s1"));
        assert!(!t.is_rate_limited("s1"));
        assert!(t.is_rate_limited("s1"));
    }

    #[tokio::test]
    async fn test_ticker_stops_on_cancel() {
        let (t, _) = tracker();
        let t = Arc::new(t);
        let cancel = CancellationToken::new();
        let handle = t.spawn_ticker(cancel.clone());
        cancel.cancel();
        handle.await.expect("ticker task panicked");
    }

    #[tokio::test]
    async fn test_zeroed_config_is_clamped() {
        let config = HealthConfig {
            tick_ms: 0,
            rate_capacity: 0,
            min_samples: 0,
            ..HealthConfig::default()
        };
        let t = Arc::new(CommHealthTracker::new(config));
        assert!(!t.is_rate_limited("s1"));

        let cancel = CancellationToken::new();
        let handle = t.spawn_ticker(cancel.clone());
        tokio::time::sleep(Duration::from_millis(5)).await;
        cancel.cancel();
        handle.await.expect("ticker task panicked");
    }
}
