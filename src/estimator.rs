use std::time::Instant;

use crate::types::{EstimatorConfig, NormalizedTelemetry};

const KCAL_PER_WATT_HOUR: f64 = 0.86;

/// Derives speed, distance, power and calories from cadence samples
///
/// Used for devices that only report cadence and resistance. Each sample is
/// integrated over the wall-clock time since the previous accepted one:
///
/// - the first sample after a stop only primes the reference instant;
/// - samples closer than `min_delta_secs` are dropped and the reference is
///   kept, so a burst of duplicates cannot starve the integration;
/// - samples further than `max_delta_secs` are dropped and the reference
///   moves to them, so a gap never produces one huge increment.
#[derive(Debug, Clone)]
pub struct IntervalEstimator {
    config: EstimatorConfig,
    last_sample: Option<Instant>,
    distance_m: f64,
    calories: f64,
}

impl IntervalEstimator {
    /// Estimator with the given tuning
    #[must_use]
    pub const fn new(config: EstimatorConfig) -> Self {
        Self {
            config,
            last_sample: None,
            distance_m: 0.0,
            calories: 0.0,
        }
    }

    /// Accumulated distance, meters
    #[must_use]
    pub const fn distance(&self) -> f64 {
        self.distance_m
    }

    /// Accumulated energy, kcal
    #[must_use]
    pub const fn calories(&self) -> f64 {
        self.calories
    }

    /// Whether a reference instant is held
    #[must_use]
    pub const fn is_primed(&self) -> bool {
        self.last_sample.is_some()
    }

    /// Zero the accumulators after a workout reset
    ///
    /// The reference instant is kept, so the next in-range sample is
    /// integrated on its own.
    pub fn reset(&mut self) {
        self.distance_m = 0.0;
        self.calories = 0.0;
    }

    /// Zero everything, including the reference instant
    pub fn stop(&mut self) {
        self.reset();
        self.last_sample = None;
    }

    /// Feed one cadence sample taken at `now`
    ///
    /// Returns `None` when the sample only primes or is rejected.
    pub fn sample(&mut self, cadence: f64, resistance: f64, now: Instant) -> Option<NormalizedTelemetry> {
        if cadence <= 0.0 {
            let was_moving = self.last_sample.take().is_some();
            return was_moving.then(|| NormalizedTelemetry {
                speed: Some(0.0),
                power: Some(0.0),
                ..Default::default()
            });
        }

        let Some(previous) = self.last_sample else {
            self.last_sample = Some(now);
            return None;
        };

        let delta = now.saturating_duration_since(previous).as_secs_f64();
        if delta < self.config.min_delta_secs {
            return None;
        }
        self.last_sample = Some(now);
        if delta > self.config.max_delta_secs {
            return None;
        }

        let hours = delta / 3600.0;
        let speed = cadence * self.config.stride_length_m * 60.0 / 1000.0;
        let power = (self.config.power_constant * cadence * resistance).round();
        self.distance_m += speed * hours * 1000.0;
        self.calories += power * KCAL_PER_WATT_HOUR * hours;

        Some(NormalizedTelemetry {
            speed: Some((speed * 10.0).round() / 10.0),
            distance: Some((self.distance_m * 10.0).round() / 10.0),
            power: Some(power),
            calories: Some(self.calories.round()),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn estimator() -> IntervalEstimator {
        IntervalEstimator::new(EstimatorConfig::default())
    }

    #[test]
    fn test_first_sample_only_primes() {
        let mut est = estimator();
        assert!(est.sample(60.0, 10.0, Instant::now()).is_none());
        assert!(est.is_primed());
    }

    #[test]
    fn test_valid_delta() {
        let mut est = estimator();
        let start = Instant::now();
        est.sample(60.0, 10.0, start);

        let update = est.sample(60.0, 10.0, start + Duration::from_secs(2)).unwrap();
        // 60 * 0.55 * 60 / 1000
        assert_eq!(update.speed, Some(2.0));
        assert_eq!(update.power, Some(600.0));
        // 1.98 km/h for 2 s
        assert!((est.distance() - 1.1).abs() < 1e-9);
        assert!((est.calories() - 600.0 * 0.86 * 2.0 / 3600.0).abs() < 1e-9);
    }

    #[test]
    fn test_debounce_and_gap() {
        let mut est = estimator();
        let start = Instant::now();
        est.sample(60.0, 10.0, start);

        assert!(est.sample(60.0, 10.0, start + Duration::from_millis(400)).is_none());
        assert!(est.distance().abs() < f64::EPSILON);

        // Reference kept at `start`: 1 s later is a valid delta
        assert!(est.sample(60.0, 10.0, start + Duration::from_secs(1)).is_some());
        let after_valid = est.distance();

        assert!(est.sample(60.0, 10.0, start + Duration::from_secs(7)).is_none());
        assert!((est.distance() - after_valid).abs() < f64::EPSILON);

        // Gap moved the reference, the next delta is 1 s, not 7 s
        est.sample(60.0, 10.0, start + Duration::from_secs(8)).unwrap();
        let increment = est.distance() - after_valid;
        assert!((increment - 1.98 / 3.6).abs() < 1e-9, "increment {increment}");
    }

    #[test]
    fn test_reset_does_not_leak_prior_accumulation() {
        let mut est = estimator();
        let start = Instant::now();
        est.sample(60.0, 10.0, start);
        for s in 1..=4 {
            est.sample(60.0, 10.0, start + Duration::from_secs(s));
        }
        assert!(est.distance() > 2.0);

        est.reset();
        let update = est.sample(60.0, 10.0, start + Duration::from_secs(5)).unwrap();

        let single = 1.98 / 3.6;
        assert!((est.distance() - single).abs() < 1e-9);
        assert!(update.distance.is_some_and(|d| d < 1.0));
    }

    #[test]
    fn test_zero_cadence_clears_prime() {
        let mut est = estimator();
        let start = Instant::now();
        est.sample(60.0, 10.0, start);

        let stopped = est.sample(0.0, 10.0, start + Duration::from_secs(1)).unwrap();
        assert_eq!(stopped.speed, Some(0.0));
        assert!(!est.is_primed());
        assert!(est.sample(0.0, 10.0, start + Duration::from_secs(2)).is_none());

        // Primes again instead of integrating over the pause
        assert!(est.sample(60.0, 10.0, start + Duration::from_secs(3)).is_none());
        assert!(est.distance().abs() < f64::EPSILON);
    }

    #[test]
    fn test_stop_forgets_reference() {
        let mut est = estimator();
        let start = Instant::now();
        est.sample(60.0, 10.0, start);
        est.stop();
        assert!(!est.is_primed());
        assert!(est.sample(60.0, 10.0, start + Duration::from_secs(1)).is_none());
    }
}
