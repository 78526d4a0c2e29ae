use std::time::{Duration, Instant};

/// Time without activity after which the clock pauses
pub const STALE_DATA_TIMEOUT: Duration = Duration::from_secs(3);

/// Period at which the owning device ticks the clock
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// The one workout duration accumulator of a session
///
/// Runs while the device is connected and reports activity. Every stop
/// flushes the running segment into the accumulator, so pausing and
/// resuming never loses or double counts time.
#[derive(Debug, Clone, Default)]
pub struct WorkoutClock {
    accumulated: Duration,
    running_since: Option<Instant>,
    last_activity: Option<Instant>,
    reported: u32,
}

impl WorkoutClock {
    /// Stopped clock at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a segment is running
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running_since.is_some()
    }

    /// Observe the merged telemetry state after an update
    pub fn observe(&mut self, connected: bool, active: bool, now: Instant) {
        if connected && active {
            self.last_activity = Some(now);
            if self.running_since.is_none() {
                self.running_since = Some(now);
            }
        } else {
            self.stop(now);
        }
    }

    /// Pause, flushing the running segment
    pub fn stop(&mut self, now: Instant) {
        if let Some(since) = self.running_since.take() {
            self.accumulated += now.saturating_duration_since(since);
        }
    }

    /// Back to zero, stopped
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Total workout time at `now`
    #[must_use]
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.accumulated
            + self
                .running_since
                .map_or(Duration::ZERO, |since| now.saturating_duration_since(since))
    }

    /// Whole seconds of workout time at `now`
    #[must_use]
    pub fn duration_secs(&self, now: Instant) -> u32 {
        u32::try_from(self.elapsed(now).as_secs()).unwrap_or(u32::MAX)
    }

    /// Periodic tick; returns the duration when it changed since the last report
    ///
    /// Pauses the clock once no activity was seen for [`STALE_DATA_TIMEOUT`].
    pub fn tick(&mut self, now: Instant) -> Option<u32> {
        let stale = self
            .last_activity
            .is_some_and(|last| now.saturating_duration_since(last) > STALE_DATA_TIMEOUT);
        if stale && self.is_running() {
            self.stop(now);
            return None;
        }

        let secs = self.duration_secs(now);
        (secs != self.reported).then(|| {
            self.reported = secs;
            secs
        })
    }
}
