//! The token bucket shared by every stream of one user.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use event_listener::{Event, EventListener};
use tracing::trace;

use crate::TrafficRateLimit;

/// Smallest grant we will hand out when a request can't be satisfied in
/// full.
///
/// Granting a handful of bytes at a time would turn one read into hundreds
/// of tiny reads; instead we make the caller wait until this many bytes (or
/// the whole request, or the whole burst, if smaller) are available.
const MIN_GRANT: u64 = 1024;

/// Shortest sleep we ask a blocked stream to perform.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Mutable state of a [`RateGate`].
#[derive(Debug)]
struct GateInner {
    /// The limit we are enforcing.
    limit: TrafficRateLimit,
    /// Number of tokens currently in the bucket.
    ///
    /// Fractional, so that frequent refills don't lose partial bytes.
    level: f64,
    /// When we last added tokens to the bucket.
    ///
    /// `None` until the first request: the bucket starts full.
    last_refill: Option<Instant>,
}

impl GateInner {
    /// Add the tokens that have accumulated since `last_refill`.
    fn refill(&mut self, now: Instant) {
        if let Some(last) = self.last_refill {
            let elapsed = now.saturating_duration_since(last);
            let added = elapsed.as_secs_f64() * self.limit.bytes_per_sec() as f64;
            self.level = (self.level + added).min(self.capacity());
        }
        self.last_refill = Some(now);
    }

    /// Capacity of the bucket, as a token count.
    fn capacity(&self) -> f64 {
        self.limit.max_burst() as f64
    }
}

/// A reconfigurable byte token bucket.
///
/// Every stream that belongs to the same user takes its bytes from the same
/// `RateGate`, so throttling applies per user rather than per connection.
///
/// The gate is clock-agnostic: callers pass in the current time, normally
/// from [`SleepProvider::now`](tor_rtcompat::SleepProvider::now).
#[derive(Debug)]
pub struct RateGate {
    /// The bucket itself.
    inner: Mutex<GateInner>,
    /// Notified whenever the limit changes, so that blocked streams can
    /// recompute how long they need to wait.
    reconfigured: Event,
}

/// A request that could not be granted yet.
#[derive(Debug)]
#[non_exhaustive]
pub struct Blocked {
    /// How long to wait before enough tokens will be available, if the
    /// limit does not change meanwhile.
    pub wait: Duration,
    /// Becomes ready when the gate is reconfigured.
    pub reconfigured: EventListener,
}

impl RateGate {
    /// Create a new gate enforcing `limit`, with a full bucket.
    pub fn new(limit: TrafficRateLimit) -> Self {
        RateGate {
            inner: Mutex::new(GateInner {
                limit,
                level: limit.max_burst() as f64,
                last_refill: None,
            }),
            reconfigured: Event::new(),
        }
    }

    /// Return the limit that this gate currently enforces.
    pub fn limit(&self) -> TrafficRateLimit {
        self.inner.lock().expect("poisoned lock").limit
    }

    /// Return the number of whole tokens available at `now`.
    pub fn available(&self, now: Instant) -> u64 {
        let mut inner = self.inner.lock().expect("poisoned lock");
        inner.refill(now);
        inner.level as u64
    }

    /// Change the limit of this gate in place.
    ///
    /// Accumulated tokens are kept, but never more than the new burst size.
    /// Every stream that is currently blocked on this gate is woken up.
    pub fn reconfigure(&self, limit: TrafficRateLimit, now: Instant) {
        {
            let mut inner = self.inner.lock().expect("poisoned lock");
            if inner.limit == limit {
                return;
            }
            inner.refill(now);
            trace!(
                "Rate gate reconfigured from {} to {} bytes/s",
                inner.limit.bytes_per_sec(),
                limit.bytes_per_sec()
            );
            inner.limit = limit;
            inner.level = inner.level.min(inner.capacity());
        }
        self.reconfigured.notify(usize::MAX);
    }

    /// Submit a request to consume `n` bytes at time `now`.
    ///
    /// On success, return a [`Permit`] for some number of bytes no greater
    /// than `n`.  On failure, return how long to wait before asking again,
    /// and a listener for reconfiguration.
    pub fn take_bytes(&self, n: usize, now: Instant) -> Result<Permit<'_>, Blocked> {
        let mut inner = self.inner.lock().expect("poisoned lock");
        if inner.limit.is_unlimited() {
            return Ok(Permit { n, gate: self });
        }
        inner.refill(now);

        let wanted = n as u64;
        let unit = wanted.min(MIN_GRANT).min(inner.limit.max_burst());
        let level = inner.level.floor() as u64;
        if wanted <= level {
            // We can satisfy all of this request.
            inner.level -= wanted as f64;
            Ok(Permit { n, gate: self })
        } else if unit <= level {
            // We can satisfy part of it.
            inner.level -= level as f64;
            Ok(Permit {
                n: level as usize,
                gate: self,
            })
        } else {
            let missing = unit as f64 - inner.level;
            let secs = missing / inner.limit.bytes_per_sec() as f64;
            let wait = Duration::from_secs_f64(secs).max(MIN_WAIT);
            Err(Blocked {
                wait,
                reconfigured: self.reconfigured.listen(),
            })
        }
    }

    /// Return `n` unused bytes to the bucket.
    ///
    /// This can violate our limits unless you have previously received
    /// permission to consume this many bytes.
    fn put_back(&self, n: usize) {
        let mut inner = self.inner.lock().expect("poisoned lock");
        if inner.limit.is_unlimited() {
            return;
        }
        inner.level = (inner.level + n as f64).min(inner.capacity());
    }
}

/// Permission to consume a certain number of bytes from a [`RateGate`].
///
/// On failure, the caller should call `unused()` to "give back" these bytes.
///
/// On partial success, the caller should call `used()` to "give back" the
/// unused portion of these bytes.
#[derive(Debug)]
#[must_use]
pub struct Permit<'a> {
    /// Number of bytes we may consume.
    n: usize,
    /// The gate the bytes came from.
    gate: &'a RateGate,
}

impl Permit<'_> {
    /// Return the number of bytes that this permit allows.
    pub fn len(&self) -> usize {
        self.n
    }

    /// Return true if this permit allows nothing.
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Report the amount of bytes from this permit that have actually been
    /// used.
    pub fn used(self, used: usize) {
        debug_assert!(used <= self.n);
        self.gate.put_back(self.n.saturating_sub(used));
    }

    /// Report that no amount of this permit was actually used.
    pub fn unused(self) {
        self.gate.put_back(self.n);
    }
}
