//! Outside temperature statistics.
//!
//! Keeps the current reading, the samples since the last extremum update,
//! and yesterday's maximum / this morning's minimum. Extrema are recomputed
//! once per day, on the first update after 18:00 local solar time, from
//! samples inside fixed day-part windows. An optional forecast series adds
//! forecast-qualified categories.

use std::fmt;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::local_solar_hour;

/// Extrema are not recomputed more often than this
const EXTREMA_MIN_AGE: i64 = 18 * 3600;
const EXTREMA_AFTER_HOUR: f64 = 18.0;
const MAX_WINDOW: (f64, f64) = (13.0, 18.0);
const MIN_WINDOW: (f64, f64) = (3.0, 9.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TemperatureCondition {
    Cold,
    Normal,
    Hot,
    HotForecast,
    VeryHot,
    VeryHotForecast,
}

impl TemperatureCondition {
    pub const ALL: [TemperatureCondition; 6] = [
        TemperatureCondition::Cold,
        TemperatureCondition::Normal,
        TemperatureCondition::Hot,
        TemperatureCondition::HotForecast,
        TemperatureCondition::VeryHot,
        TemperatureCondition::VeryHotForecast,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TemperatureCondition::Cold => "cold",
            TemperatureCondition::Normal => "normal",
            TemperatureCondition::Hot => "hot",
            TemperatureCondition::HotForecast => "hot-forecast",
            TemperatureCondition::VeryHot => "very-hot",
            TemperatureCondition::VeryHotForecast => "very-hot-forecast",
        }
    }

    fn severity(self) -> u8 {
        match self {
            TemperatureCondition::Cold => 0,
            TemperatureCondition::Normal => 1,
            TemperatureCondition::Hot | TemperatureCondition::HotForecast => 2,
            TemperatureCondition::VeryHot | TemperatureCondition::VeryHotForecast => 3,
        }
    }

    fn forecast_qualified(self) -> Self {
        match self {
            TemperatureCondition::Hot => TemperatureCondition::HotForecast,
            TemperatureCondition::VeryHot => TemperatureCondition::VeryHotForecast,
            c => c,
        }
    }
}

impl fmt::Display for TemperatureCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureSettings {
    pub update_interval: f64,
    pub utc_shift: f64,
    pub max_cold: f64,
    pub max_hot: f64,
    pub max_very_hot: f64,
    pub current_hot: f64,
    pub current_very_hot: f64,
}

impl Default for TemperatureSettings {
    fn default() -> Self {
        Self {
            update_interval: 1800.0,
            utc_shift: 7.9 / 15.0,
            max_cold: 12.0,
            max_hot: 25.0,
            max_very_hot: 30.0,
            current_hot: 27.0,
            current_very_hot: 31.0,
        }
    }
}

impl TemperatureSettings {
    /// Classify a daily maximum
    fn classify_max(&self, t: f64) -> TemperatureCondition {
        if t > self.max_very_hot {
            TemperatureCondition::VeryHot
        } else if t > self.max_hot {
            TemperatureCondition::Hot
        } else if t < self.max_cold {
            TemperatureCondition::Cold
        } else {
            TemperatureCondition::Normal
        }
    }
}

/// Forecast aggregate over the configured horizon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub samples: Vec<(i64, f64)>,
    pub min: f64,
    pub max: f64,
    pub average: f64,
}

impl Forecast {
    /// Keep samples in `[from, until)`; `None` if nothing remains.
    pub fn from_series(series: &[(i64, f64)], from: i64, until: i64) -> Option<Self> {
        let samples: Vec<(i64, f64)> = series
            .iter()
            .copied()
            .filter(|&(t, v)| t >= from && t < until && v.is_finite())
            .collect();
        if samples.is_empty() {
            return None;
        }
        let (min, max, sum) = samples.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, 0.0),
            |(lo, hi, sum), &(_, v)| (lo.min(v), hi.max(v), sum + v),
        );
        Some(Self {
            average: sum / samples.len() as f64,
            samples,
            min,
            max,
        })
    }
}

/// Persistent temperature state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureStats {
    pub current: f64,
    pub samples: Vec<(i64, f64)>,
    pub last_updated: i64,
    pub extrema_updated: i64,
    pub min: f64,
    pub min_time: i64,
    pub max: f64,
    pub max_time: i64,
    /// Last non-empty series fetched
    #[serde(default)]
    pub forecast_series: Vec<(i64, f64)>,
    /// Part of `forecast_series` inside the current horizon
    #[serde(default)]
    pub forecast: Option<Forecast>,
}

impl Default for TemperatureStats {
    fn default() -> Self {
        Self::new(5.0, 10.0)
    }
}

impl TemperatureStats {
    /// Fresh statistics seeded with assumed extrema.
    pub fn new(min: f64, max: f64) -> Self {
        Self {
            current: (min + max) / 2.0,
            samples: Vec::new(),
            last_updated: 0,
            extrema_updated: 0,
            min,
            min_time: 3 * 3600,
            max,
            max_time: 11 * 3600,
            forecast_series: Vec::new(),
            forecast: None,
        }
    }

    /// Whether a new reading should be taken.
    pub fn is_due(&self, now: i64, s: &TemperatureSettings) -> bool {
        (now - self.last_updated) as f64 > s.update_interval
    }

    /// Store a reading. Returns false if the update interval has not passed.
    pub fn update(&mut self, now: i64, reading: f64, s: &TemperatureSettings) -> bool {
        if !self.is_due(now, s) || !reading.is_finite() {
            return false;
        }
        self.current = reading;
        self.last_updated = now;

        let hour = local_solar_hour(now, s.utc_shift);
        if now - self.extrema_updated > EXTREMA_MIN_AGE && hour > EXTREMA_AFTER_HOUR {
            self.update_extrema(s.utc_shift);
            self.extrema_updated = now;
            self.samples = vec![(now, reading)];
        } else {
            self.samples.push((now, reading));
        }
        true
    }

    fn update_extrema(&mut self, utc_shift: f64) {
        let mut max: Option<(i64, f64)> = None;
        let mut min: Option<(i64, f64)> = None;
        for &(t, v) in &self.samples {
            let hour = local_solar_hour(t, utc_shift);
            if hour > MAX_WINDOW.0 && hour < MAX_WINDOW.1 && max.map_or(true, |(_, m)| v > m) {
                max = Some((t, v));
            }
            if hour > MIN_WINDOW.0 && hour < MIN_WINDOW.1 && min.map_or(true, |(_, m)| v < m) {
                min = Some((t, v));
            }
        }
        if max.is_none() && min.is_none() {
            debug!(target: "temperature", "no new minimum or maximum found");
        }
        if let Some((t, v)) = max {
            info!(target: "temperature", "new maximum {:.1} at {}", v, t);
            self.max = v;
            self.max_time = t;
        }
        if let Some((t, v)) = min {
            info!(target: "temperature", "new minimum {:.1} at {}", v, t);
            self.min = v;
            self.min_time = t;
        }
    }

    /// Take a freshly fetched series and aggregate it over `[from, until)`.
    /// An empty series keeps the previous one.
    pub fn set_forecast(&mut self, series: &[(i64, f64)], from: i64, until: i64) {
        if series.is_empty() {
            if !self.forecast_series.is_empty() {
                warn!(target: "temperature", "no forecast received, keeping the previous one");
            }
        } else {
            self.forecast_series = series.to_vec();
        }
        self.refresh_forecast(from, until);
        if let Some(f) = &self.forecast {
            debug!(
                target: "temperature",
                "forecast min {:.1} max {:.1} avg {:.1} ({} samples)",
                f.min,
                f.max,
                f.average,
                f.samples.len()
            );
        }
    }

    /// Re-aggregate the stored series over `[from, until)`.
    pub fn refresh_forecast(&mut self, from: i64, until: i64) {
        self.forecast = Forecast::from_series(&self.forecast_series, from, until);
    }

    pub fn clear_forecast(&mut self) {
        self.forecast_series.clear();
        self.forecast = None;
    }

    pub fn condition(&self, s: &TemperatureSettings) -> TemperatureCondition {
        let mut cond = s.classify_max(self.max);

        if let Some(f) = &self.forecast {
            let predicted = s.classify_max(f.max);
            if predicted != cond {
                cond = predicted.forecast_qualified();
            }
        }

        let now = if self.current > s.current_very_hot {
            Some(TemperatureCondition::VeryHot)
        } else if self.current > s.current_hot {
            Some(TemperatureCondition::Hot)
        } else {
            None
        };
        match now {
            Some(c) if c.severity() > cond.severity() => c,
            _ => cond,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TemperatureSettings {
        TemperatureSettings {
            update_interval: 0.0,
            utc_shift: 0.0,
            ..TemperatureSettings::default()
        }
    }

    const DAY: i64 = 86400 * 20000;

    fn at(hour: f64) -> i64 {
        DAY + (hour * 3600.0) as i64
    }

    #[test]
    fn update_is_rate_limited() {
        let s = TemperatureSettings {
            update_interval: 600.0,
            ..settings()
        };
        let mut t = TemperatureStats::default();
        assert!(t.update(at(8.0), 12.0, &s));
        assert!(!t.update(at(8.0) + 300, 13.0, &s));
        assert_eq!(t.current, 12.0);
        assert!(t.update(at(8.0) + 601, 14.0, &s));
        assert_eq!(t.current, 14.0);
    }

    #[test]
    fn extrema_come_from_day_part_windows() {
        let s = settings();
        let mut t = TemperatureStats::new(5.0, 10.0);
        t.extrema_updated = at(0.0) - 86400;
        // Warm night, not a minimum candidate
        t.update(at(1.0), 2.0, &s);
        t.update(at(5.0), 8.0, &s);
        t.update(at(7.0), 9.0, &s);
        // Hot late morning, outside the maximum window
        t.update(at(12.0), 40.0, &s);
        t.update(at(15.0), 24.0, &s);
        t.update(at(17.0), 22.0, &s);
        assert_eq!(t.samples.len(), 6);

        t.update(at(19.0), 18.0, &s);
        assert_eq!(t.max, 24.0);
        assert_eq!(t.max_time, at(15.0));
        assert_eq!(t.min, 8.0);
        assert_eq!(t.samples, vec![(at(19.0), 18.0)]);
        assert_eq!(t.extrema_updated, at(19.0));
    }

    #[test]
    fn extrema_not_recomputed_twice_a_day() {
        let s = settings();
        let mut t = TemperatureStats::new(5.0, 10.0);
        t.update(at(15.0), 24.0, &s);
        t.extrema_updated = at(19.0) - 3600;
        t.update(at(19.0), 18.0, &s);
        assert_eq!(t.max, 10.0);
        assert_eq!(t.samples.len(), 2);
    }

    #[test]
    fn historical_categories() {
        let s = settings();
        let mut t = TemperatureStats::new(5.0, 26.0);
        t.current = 20.0;
        assert_eq!(t.condition(&s), TemperatureCondition::Hot);
        t.max = 31.0;
        assert_eq!(t.condition(&s), TemperatureCondition::VeryHot);
        t.max = 8.0;
        assert_eq!(t.condition(&s), TemperatureCondition::Cold);
        t.max = 18.0;
        assert_eq!(t.condition(&s), TemperatureCondition::Normal);
    }

    #[test]
    fn forecast_disagreement_is_qualified() {
        let s = settings();
        let mut t = TemperatureStats::new(5.0, 18.0);
        t.current = 15.0;
        let series = [(100, 20.0), (200, 27.0), (300, 22.0)];
        t.set_forecast(&series, 0, 1000);
        assert_eq!(t.condition(&s), TemperatureCondition::HotForecast);

        t.set_forecast(&[(100, 33.0)], 0, 1000);
        assert_eq!(t.condition(&s), TemperatureCondition::VeryHotForecast);

        // Forecast says cooler than yesterday
        t.max = 27.0;
        t.set_forecast(&[(100, 19.0)], 0, 1000);
        assert_eq!(t.condition(&s), TemperatureCondition::Normal);

        // Agreement keeps the plain category
        t.set_forecast(&[(100, 26.0)], 0, 1000);
        assert_eq!(t.condition(&s), TemperatureCondition::Hot);
    }

    #[test]
    fn forecast_horizon_is_bounded() {
        let series = [(50, 40.0), (100, 20.0), (200, 22.0), (1000, 35.0)];
        let f = Forecast::from_series(&series, 100, 1000).unwrap();
        assert_eq!(f.samples.len(), 2);
        assert_eq!(f.max, 22.0);
        assert_eq!(f.min, 20.0);
        assert!((f.average - 21.0).abs() < 1e-12);
        assert!(Forecast::from_series(&series, 2000, 3000).is_none());
    }

    #[test]
    fn failed_fetch_keeps_last_forecast() {
        let s = settings();
        let mut t = TemperatureStats::new(5.0, 18.0);
        t.current = 15.0;
        t.set_forecast(&[(100, 20.0), (200, 33.0), (300, 22.0)], 0, 1000);
        assert_eq!(t.condition(&s), TemperatureCondition::VeryHotForecast);

        t.set_forecast(&[], 50, 1000);
        assert_eq!(t.forecast.as_ref().map(|f| f.max), Some(33.0));
        assert_eq!(t.condition(&s), TemperatureCondition::VeryHotForecast);
    }

    #[test]
    fn forecast_window_moves_with_time() {
        let s = settings();
        let mut t = TemperatureStats::new(5.0, 18.0);
        t.current = 15.0;
        t.set_forecast(&[(100, 33.0), (500, 27.0)], 0, 1000);
        assert_eq!(t.condition(&s), TemperatureCondition::VeryHotForecast);

        // The hot sample is in the past now
        t.refresh_forecast(200, 1000);
        assert_eq!(t.forecast.as_ref().map(|f| f.samples.len()), Some(1));
        assert_eq!(t.condition(&s), TemperatureCondition::HotForecast);

        t.refresh_forecast(600, 1000);
        assert!(t.forecast.is_none());
        assert_eq!(t.condition(&s), TemperatureCondition::Normal);
        assert_eq!(t.forecast_series.len(), 2);
    }

    #[test]
    fn current_reading_escalates() {
        let s = settings();
        let mut t = TemperatureStats::new(5.0, 18.0);
        t.current = 28.0;
        assert_eq!(t.condition(&s), TemperatureCondition::Hot);
        t.current = 32.0;
        assert_eq!(t.condition(&s), TemperatureCondition::VeryHot);

        // Never downgrades a forecast category
        t.current = 28.0;
        t.set_forecast(&[(100, 33.0)], 0, 1000);
        assert_eq!(t.condition(&s), TemperatureCondition::VeryHotForecast);
    }
}
