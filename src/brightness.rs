//! Outside brightness history and the dim / normal / very-bright classifier.
//!
//! Samples are the maximum over all outdoor light sensors, kept for a sliding
//! time span. The scalar fed to the classifier is either the plain maximum of
//! the window or a log-linear regression evaluated at "now", which follows a
//! rising or falling trend without being dragged by a single cloud.
//!
//! Condition changes go through directional hysteresis: a reversal of the
//! last change direction is only accepted after a minimum time and with a
//! relative margin past the threshold.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Values at or below this are treated as darkness in the log fit.
const LOG_FLOOR: f64 = 0.01;
/// Guards the margin quotient against a zero reading.
const MARGIN_EPSILON: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BrightnessCondition {
    Dim,
    Normal,
    VeryBright,
    /// Nothing in the sliding window
    NoMeasurement,
}

impl BrightnessCondition {
    pub fn as_str(self) -> &'static str {
        match self {
            BrightnessCondition::Dim => "dim",
            BrightnessCondition::Normal => "normal",
            BrightnessCondition::VeryBright => "very-bright",
            BrightnessCondition::NoMeasurement => "no-measurement",
        }
    }

    /// Value to use for a table lookup
    pub fn or_normal(self) -> BrightnessCondition {
        match self {
            BrightnessCondition::NoMeasurement => BrightnessCondition::Normal,
            c => c,
        }
    }

    pub const ALL: [BrightnessCondition; 3] = [
        BrightnessCondition::Dim,
        BrightnessCondition::Normal,
        BrightnessCondition::VeryBright,
    ];

    fn level(self) -> i8 {
        match self {
            BrightnessCondition::Dim => 0,
            BrightnessCondition::Normal => 1,
            BrightnessCondition::VeryBright => 2,
            BrightnessCondition::NoMeasurement => 1,
        }
    }
}

impl fmt::Display for BrightnessCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the window of samples is reduced to one value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Estimator {
    Max,
    Regression,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
}

/// Classifier settings, taken from the parameter snapshot each cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrightnessSettings {
    pub dim: f64,
    pub very_bright: f64,
    pub time_span: f64,
    pub update_interval: f64,
    pub minimum_reversal_time: f64,
    pub reversal_margin: f64,
    pub estimator: Estimator,
}

impl Default for BrightnessSettings {
    fn default() -> Self {
        Self {
            dim: 2000.0,
            very_bright: 25000.0,
            time_span: 1800.0,
            update_interval: 60.0,
            minimum_reversal_time: 1200.0,
            reversal_margin: 1.3,
            estimator: Estimator::Regression,
        }
    }
}

/// Least-squares fit `y = a * x + b`; `None` for fewer than two points or
/// when all abscissae coincide.
pub fn linear_regression(x: &[f64], y: &[f64]) -> Option<(f64, f64)> {
    let n = x.len();
    if n < 2 || y.len() != n {
        return None;
    }
    let nf = n as f64;
    let sum_x: f64 = x.iter().sum();
    let sum_y: f64 = y.iter().sum();
    let sum_xy: f64 = x.iter().zip(y).map(|(a, b)| a * b).sum();
    let sum_x2: f64 = x.iter().map(|a| a * a).sum();
    let denom = sum_x2 - sum_x * sum_x / nf;
    if denom.abs() < f64::EPSILON {
        return None;
    }
    let a = (sum_xy - sum_x * sum_y / nf) / denom;
    let b = (sum_y - a * sum_x) / nf;
    Some((a, b))
}

/// Persistent brightness state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrightnessHistory {
    pub samples: Vec<(i64, f64)>,
    #[serde(default)]
    pub last_updated: i64,
    /// Most recent max-over-sensors reading
    #[serde(default)]
    pub current: Option<f64>,
    #[serde(default)]
    pub last_condition: Option<BrightnessCondition>,
    #[serde(default)]
    pub last_direction: Option<Direction>,
    #[serde(default)]
    pub last_change: i64,
}

impl BrightnessHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add this cycle's readings (one per sensor) and trim the window.
    /// Returns true if a new sample was stored.
    pub fn update(&mut self, now: i64, readings: &[f64], s: &BrightnessSettings) -> bool {
        let mut stored = false;
        let due = self.samples.is_empty() || (now - self.last_updated) as f64 > s.update_interval;
        if due {
            if let Some(max) = readings.iter().copied().fold(None, |acc: Option<f64>, v| {
                Some(acc.map_or(v, |a| a.max(v)))
            }) {
                self.current = Some(max);
                self.samples.push((now, max));
                self.last_updated = now;
                stored = true;
            }
        }
        self.samples
            .retain(|&(t, _)| (now - t) as f64 <= s.time_span);
        stored
    }

    /// Scalar brightness at `now`, `None` when the window is empty.
    pub fn value(&self, now: i64, estimator: Estimator) -> Option<f64> {
        let max = self
            .samples
            .iter()
            .map(|&(_, v)| v)
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))?;
        if estimator == Estimator::Max || self.samples.len() == 1 {
            return Some(max);
        }
        let x: Vec<f64> = self.samples.iter().map(|&(t, _)| (t - now) as f64).collect();
        let y: Vec<f64> = self
            .samples
            .iter()
            .map(|&(_, v)| v.max(LOG_FLOOR).ln())
            .collect();
        match linear_regression(&x, &y) {
            Some((_, b)) => Some(b.exp()),
            None => Some(max),
        }
    }

    /// Classify with hysteresis.
    pub fn condition(&mut self, now: i64, s: &BrightnessSettings) -> BrightnessCondition {
        let value = match self.value(now, s.estimator) {
            Some(v) => v,
            None => return BrightnessCondition::NoMeasurement,
        };
        let raw = if value > s.very_bright {
            BrightnessCondition::VeryBright
        } else if value < s.dim {
            BrightnessCondition::Dim
        } else {
            BrightnessCondition::Normal
        };
        self.commit(now, raw, value, s)
    }

    fn commit(
        &mut self,
        now: i64,
        raw: BrightnessCondition,
        value: f64,
        s: &BrightnessSettings,
    ) -> BrightnessCondition {
        let last = match self.last_condition {
            None => {
                self.last_condition = Some(raw);
                self.last_change = now;
                return raw;
            }
            Some(last) if last == raw => return raw,
            Some(last) => last,
        };

        let direction = if raw.level() > last.level() {
            Direction::Up
        } else {
            Direction::Down
        };

        let accept = match self.last_direction {
            None => true,
            Some(d) if d == direction => true,
            Some(_) => {
                let elapsed = (now - self.last_change) as f64;
                elapsed > s.minimum_reversal_time
                    && reversal_margin(raw, direction, value, s) > s.reversal_margin
            }
        };

        if accept {
            self.last_condition = Some(raw);
            self.last_direction = Some(direction);
            self.last_change = now;
            raw
        } else {
            last
        }
    }
}

/// Relative distance of `value` past the threshold it just crossed.
fn reversal_margin(
    raw: BrightnessCondition,
    direction: Direction,
    value: f64,
    s: &BrightnessSettings,
) -> f64 {
    match (raw, direction) {
        (BrightnessCondition::VeryBright, _) | (BrightnessCondition::NoMeasurement, _) => {
            value / s.very_bright
        }
        (BrightnessCondition::Dim, _) => s.dim / (value + MARGIN_EPSILON),
        (BrightnessCondition::Normal, Direction::Up) => value / s.dim,
        (BrightnessCondition::Normal, Direction::Down) => s.very_bright / (value + MARGIN_EPSILON),
    }
}
