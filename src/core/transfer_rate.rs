use std::{
    cmp::Ordering,
    collections::VecDeque,
    fmt::Display,
    ops::{Add, AddAssign},
    time::{Duration, Instant},
};

use size::Size;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct TransferRate(pub Size, pub Duration);

impl Display for TransferRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/s", Size::from_bytes(self.bps() as u64))
    }
}

impl TransferRate {
    pub const EMPTY: Self = Self(Size::from_const(0), Duration::ZERO);

    pub fn bps(&self) -> f64 {
        let seconds = self.1.as_secs_f64();
        if seconds == 0.0 {
            return 0.0;
        }
        (self.0.bytes() as f64) / seconds
    }
}

impl Add for TransferRate {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        let mut sum = self;
        sum += rhs;
        sum
    }
}

impl AddAssign for TransferRate {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
        self.1 += rhs.1;
    }
}

impl PartialOrd for TransferRate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TransferRate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bps().total_cmp(&other.bps())
    }
}

/// Rolling byte counter. Samples older than the window are dropped on every update.
#[derive(Debug, Clone)]
pub struct RateMeter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    in_window: u64,
    total: u64,
    started: Option<Instant>,
}

impl RateMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            in_window: 0,
            total: 0,
            started: None,
        }
    }

    pub fn record(&mut self, bytes: usize, now: Instant) {
        let bytes = bytes as u64;
        self.started.get_or_insert(now);
        self.samples.push_back((now, bytes));
        self.in_window += bytes;
        self.total += bytes;
        self.expire(now);
    }

    /// Bytes seen over the last window, averaged over the window (or the meter's age if it
    /// is younger than the window).
    pub fn rate(&mut self, now: Instant) -> TransferRate {
        self.expire(now);
        let Some(started) = self.started else {
            return TransferRate::EMPTY;
        };
        let elapsed = now.saturating_duration_since(started).min(self.window);
        let elapsed = elapsed.max(Duration::from_secs(1));
        TransferRate(Size::from_bytes(self.in_window), elapsed)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(at, bytes)) = self.samples.front() {
            if now.saturating_duration_since(at) < self.window {
                break;
            }
            self.samples.pop_front();
            self.in_window -= bytes;
        }
    }
}
