use crate::types::{DragProfile, NormalizedTelemetry, UserProfile};

/// Stroke intervals longer than this put the engine in idle mode, milliseconds
pub const IDLE_TIMEOUT_MS: f64 = 6000.0;

/// Intervals shorter than this are sensor bounce (over 100 spm), milliseconds
pub const MIN_STROKE_INTERVAL_MS: f64 = 600.0;

/// Number of strokes averaged into the reported stroke rate
pub const SMOOTHING_WINDOW: usize = 3;

// Concept2 pace constant: watts = 2.80 * (m/s)^3
const PACE_CONSTANT: f64 = 2.80;
const REFERENCE_MASS_KG: f64 = 84.0;
const KCAL_PER_WATT_HOUR: f64 = 0.8604;
const MUSCLE_EFFICIENCY_FACTOR: f64 = 4.0;
const RESTING_KCAL_PER_HOUR: f64 = 300.0;
const RESTING_REFERENCE_KG: f64 = 80.0;

impl DragProfile {
    /// Watts produced per (strokes/min)^3
    #[must_use]
    pub const fn drag_coefficient(self) -> f64 {
        match self {
            Self::Water => 0.0108,
            Self::Magnet => 0.0095,
            Self::Wind => 0.0122,
        }
    }

    /// Rower plus boat mass moved by the drive, kilograms
    #[must_use]
    pub fn effective_mass(self, weight_kg: f64) -> f64 {
        match self {
            Self::Water => weight_kg + 14.0,
            Self::Magnet | Self::Wind => weight_kg.mul_add(2.0, 27.0) / 2.0,
        }
    }
}

/// Converts successive stroke intervals into rowing metrics
///
/// Stroke rate is averaged over the last [`SMOOTHING_WINDOW`] strokes,
/// power follows a cubic drag model and boat speed is derived from power
/// with a body-mass correction. Distance, calories and stroke count
/// accumulate until [`RowingAnalysis::reset`].
#[derive(Debug, Clone)]
pub struct RowingAnalysis {
    profile: DragProfile,
    weight_kg: f64,
    window: Vec<f64>,
    distance_m: f64,
    calories: f64,
    strokes: u32,
    idle: bool,
}

impl RowingAnalysis {
    /// Engine for a drag profile and rower
    #[must_use]
    pub fn new(profile: DragProfile, user: UserProfile) -> Self {
        Self {
            profile,
            weight_kg: user.weight_kg,
            window: Vec::with_capacity(SMOOTHING_WINDOW),
            distance_m: 0.0,
            calories: 0.0,
            strokes: 0,
            idle: false,
        }
    }

    /// Whether the last interval exceeded the idle timeout
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.idle
    }

    /// Accumulated distance, meters
    #[must_use]
    pub const fn distance(&self) -> f64 {
        self.distance_m
    }

    /// Accumulated strokes
    #[must_use]
    pub const fn strokes(&self) -> u32 {
        self.strokes
    }

    /// Forget every accumulated value
    pub fn reset(&mut self) {
        self.window.clear();
        self.distance_m = 0.0;
        self.calories = 0.0;
        self.strokes = 0;
        self.idle = false;
    }

    /// Feed one stroke interval in milliseconds
    pub fn append(&mut self, interval_ms: f64) -> NormalizedTelemetry {
        if interval_ms <= 0.0 {
            // Machine stopped
            self.reset();
            return Self::stopped();
        }
        if interval_ms < MIN_STROKE_INTERVAL_MS {
            return NormalizedTelemetry::default();
        }
        if interval_ms > IDLE_TIMEOUT_MS {
            self.idle = true;
            self.window.clear();
            return Self::stopped();
        }
        self.idle = false;

        let spm = self.smoothed_rate(60_000.0 / interval_ms);
        let power = self.profile.drag_coefficient() * spm.powi(3);
        let speed_ms = (REFERENCE_MASS_KG / self.profile.effective_mass(self.weight_kg)).cbrt()
            * (power / PACE_CONSTANT).cbrt();

        let seconds = interval_ms / 1000.0;
        self.distance_m += speed_ms * seconds;
        self.calories += self.kcal_per_hour(power) * seconds / 3600.0;
        self.strokes += 1;

        NormalizedTelemetry {
            spm: Some((spm * 10.0).round() / 10.0),
            speed: Some((speed_ms * 36.0).round() / 10.0),
            power: Some(power.round()),
            distance: Some(self.distance_m.round()),
            calories: Some(self.calories.round()),
            stroke_count: Some(self.strokes),
            ..Default::default()
        }
    }

    fn smoothed_rate(&mut self, rate: f64) -> f64 {
        if self.window.is_empty() {
            self.window.resize(SMOOTHING_WINDOW, rate);
        } else {
            self.window.remove(0);
            self.window.push(rate);
        }
        #[allow(clippy::cast_precision_loss)]
        let len = self.window.len() as f64;
        self.window.iter().sum::<f64>() / len
    }

    fn kcal_per_hour(&self, power: f64) -> f64 {
        (MUSCLE_EFFICIENCY_FACTOR * power).mul_add(
            KCAL_PER_WATT_HOUR,
            RESTING_KCAL_PER_HOUR * self.weight_kg / RESTING_REFERENCE_KG,
        )
    }

    fn stopped() -> NormalizedTelemetry {
        NormalizedTelemetry {
            spm: Some(0.0),
            speed: Some(0.0),
            power: Some(0.0),
            ..Default::default()
        }
    }
}
