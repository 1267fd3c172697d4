//! Horizon profiles and the sunlit/shade classifier.
//!
//! A window sees the patch of sky between two polylines: the lower one traces
//! obstructions (neighbouring roofs, trees), the upper one the ceiling of the
//! visible sky (eaves, balconies). Both are sampled in azimuth over a full
//! turn, so every compass direction has a lower and an upper elevation.
//!
//! Classification changes are debounced against the sun's predicted track so
//! a shutter does not flap while the sun grazes a profile edge.

use std::fmt;

use log::error;
use thiserror::Error as ThisError;

use crate::solar::{SunPosition, SunState};

const FULL_TURN: f64 = 360.0;
const CLOSURE_EPSILON: f64 = 1e-9;

/// Below this elevation the sun is too weak to count, whatever the profile says.
pub const DEFAULT_MIN_ELEVATION: f64 = 3.0;

#[derive(Debug, Clone, PartialEq, ThisError)]
pub enum HorizonError {
    #[error("profile needs at least two points, got {0}")]
    TooFewPoints(usize),
    #[error("profile point {0} is not finite")]
    NotFinite(usize),
    #[error("azimuth not strictly increasing at point {0}")]
    NotIncreasing(usize),
    #[error("profile spans {span:.3} degrees, expected 360")]
    NotClosed { span: f64 },
    #[error("azimuth {azimuth:.3} outside profile range [{first:.3}, {last:.3}]")]
    OutOfRange { azimuth: f64, first: f64, last: f64 },
}

/// Sun visibility from a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sunlit {
    Sunlit,
    Shade,
}

impl Sunlit {
    pub fn as_str(self) -> &'static str {
        match self {
            Sunlit::Sunlit => "sunlit",
            Sunlit::Shade => "shade",
        }
    }
}

impl fmt::Display for Sunlit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Azimuth-ordered (azimuth, elevation) points in degrees, closing the circle.
#[derive(Debug, Clone, PartialEq)]
pub struct Polyline {
    points: Vec<(f64, f64)>,
}

impl Polyline {
    pub fn new(points: Vec<(f64, f64)>) -> Result<Self, HorizonError> {
        if points.len() < 2 {
            return Err(HorizonError::TooFewPoints(points.len()));
        }
        for (i, &(az, el)) in points.iter().enumerate() {
            if !az.is_finite() || !el.is_finite() {
                return Err(HorizonError::NotFinite(i));
            }
            if i > 0 && az <= points[i - 1].0 {
                return Err(HorizonError::NotIncreasing(i));
            }
        }
        let span = points[points.len() - 1].0 - points[0].0;
        if (span - FULL_TURN).abs() > CLOSURE_EPSILON {
            return Err(HorizonError::NotClosed { span });
        }
        Ok(Self { points })
    }

    /// Flat line at a constant elevation, starting at azimuth 0.
    pub fn flat(elevation: f64) -> Self {
        Self {
            points: vec![(0.0, elevation), (FULL_TURN, elevation)],
        }
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    fn first_azimuth(&self) -> f64 {
        self.points[0].0
    }

    fn last_azimuth(&self) -> f64 {
        self.points[self.points.len() - 1].0
    }

    /// Linear interpolation of the elevation at `azimuth`, without wrapping.
    pub fn elevation_at(&self, azimuth: f64) -> Result<f64, HorizonError> {
        let first = self.first_azimuth();
        let last = self.last_azimuth();
        if !(first..=last).contains(&azimuth) {
            return Err(HorizonError::OutOfRange { azimuth, first, last });
        }

        let mut left: Option<(f64, f64)> = None;
        for &(az, el) in &self.points {
            if az < azimuth {
                left = Some((az, el));
                continue;
            }
            if az == azimuth {
                return Ok(el);
            }
            return match left {
                Some((az_l, el_l)) => {
                    let w = (azimuth - az_l) / (az - az_l);
                    Ok(el_l + w * (el - el_l))
                }
                None => Ok(el),
            };
        }
        // Unreachable for validated profiles; `last` bounds the loop above.
        Err(HorizonError::OutOfRange { azimuth, first, last })
    }

    /// Elevation at a compass azimuth, wrapped into this polyline's turn.
    pub fn elevation_wrapped(&self, azimuth: f64) -> Result<f64, HorizonError> {
        let first = self.first_azimuth();
        let wrapped = first + (azimuth - first).rem_euclid(FULL_TURN);
        self.elevation_at(wrapped)
    }
}

/// Visible sky of a window
#[derive(Debug, Clone, PartialEq)]
pub struct HorizonProfile {
    pub lower: Polyline,
    pub upper: Polyline,
    pub min_elevation: f64,
}

impl HorizonProfile {
    pub fn new(lower: Polyline, upper: Polyline) -> Self {
        Self {
            lower,
            upper,
            min_elevation: DEFAULT_MIN_ELEVATION,
        }
    }

    pub fn with_min_elevation(mut self, min_elevation: f64) -> Self {
        self.min_elevation = min_elevation;
        self
    }

    pub fn classify(&self, sun: SunPosition) -> Result<Sunlit, HorizonError> {
        let low = self
            .lower
            .elevation_wrapped(sun.azimuth)?
            .max(self.min_elevation);
        let high = self.upper.elevation_wrapped(sun.azimuth)?;
        if low <= sun.elevation && sun.elevation <= high {
            Ok(Sunlit::Sunlit)
        } else {
            Ok(Sunlit::Shade)
        }
    }
}

/// Committed sunlit condition for one window.
#[derive(Debug, Clone, Default)]
pub struct SunlitDebounce {
    committed: Option<Sunlit>,
}

impl SunlitDebounce {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committed(&self) -> Option<Sunlit> {
        self.committed
    }

    /// Classify the current sun and commit a change only once every lookahead
    /// sample agrees with it.
    pub fn update(&mut self, window: &str, profile: &HorizonProfile, sun: &SunState) -> Sunlit {
        let now = match profile.classify(sun.current) {
            Ok(c) => c,
            Err(e) => {
                error!(target: "horizon", "window {}: {}", window, e);
                Sunlit::Shade
            }
        };

        let previous = match self.committed {
            None => {
                self.committed = Some(now);
                return now;
            }
            Some(p) if p == now => return now,
            Some(p) => p,
        };

        let confirmed = sun
            .lookahead()
            .all(|pos| matches!(profile.classify(pos), Ok(c) if c == now));

        if confirmed {
            self.committed = Some(now);
            now
        } else {
            previous
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> HorizonProfile {
        HorizonProfile::new(
            Polyline::flat(0.0),
            Polyline::new(vec![(0.0, 5.0), (180.0, 60.0), (360.0, 5.0)]).unwrap(),
        )
    }

    fn pos(azimuth: f64, elevation: f64) -> SunPosition {
        SunPosition { azimuth, elevation }
    }

    #[test]
    fn exact_point_returns_its_elevation() {
        let p = profile();
        assert_eq!(p.upper.elevation_at(180.0).unwrap(), 60.0);
        assert_eq!(p.upper.elevation_at(0.0).unwrap(), 5.0);
        assert_eq!(p.upper.elevation_at(360.0).unwrap(), 5.0);
    }

    #[test]
    fn interpolates_between_points() {
        let p = profile();
        let el = p.upper.elevation_at(90.0).unwrap();
        assert!((el - 32.5).abs() < 1e-12);
    }

    #[test]
    fn out_of_range_without_wrapping() {
        let p = profile();
        assert!(matches!(
            p.upper.elevation_at(360.5),
            Err(HorizonError::OutOfRange { .. })
        ));
        assert!(p.upper.elevation_wrapped(360.5).is_ok());
        assert!(p.upper.elevation_wrapped(-10.0).is_ok());
    }

    #[test]
    fn rejects_non_closing_profile() {
        let err = Polyline::new(vec![(10.0, 5.0), (180.0, 40.0), (350.0, 5.0)]).unwrap_err();
        assert!(matches!(err, HorizonError::NotClosed { .. }));
    }

    #[test]
    fn rejects_unordered_profile() {
        let err = Polyline::new(vec![(0.0, 5.0), (200.0, 40.0), (150.0, 4.0), (360.0, 5.0)])
            .unwrap_err();
        assert_eq!(err, HorizonError::NotIncreasing(2));
    }

    #[test]
    fn profile_may_start_anywhere() {
        let upper = Polyline::new(vec![(90.0, 10.0), (270.0, 50.0), (450.0, 10.0)]).unwrap();
        let p = HorizonProfile::new(Polyline::flat(0.0), upper);
        assert_eq!(p.classify(pos(45.0, 20.0)).unwrap(), Sunlit::Sunlit);
        assert_eq!(p.classify(pos(90.0, 20.0)).unwrap(), Sunlit::Shade);
    }

    #[test]
    fn classifies_scenario() {
        let p = profile();
        assert_eq!(p.classify(pos(90.0, 30.0)).unwrap(), Sunlit::Sunlit);
        assert_eq!(p.classify(pos(90.0, 2.0)).unwrap(), Sunlit::Shade);
        assert_eq!(p.classify(pos(90.0, 40.0)).unwrap(), Sunlit::Shade);
    }

    #[test]
    fn minimum_elevation_can_be_lowered() {
        let p = profile().with_min_elevation(0.0);
        assert_eq!(p.classify(pos(90.0, 2.0)).unwrap(), Sunlit::Sunlit);
    }

    #[test]
    fn below_obstruction_is_shade() {
        let p = HorizonProfile::new(
            Polyline::new(vec![(0.0, 10.0), (180.0, 20.0), (360.0, 10.0)]).unwrap(),
            Polyline::new(vec![(0.0, 5.0), (180.0, 60.0), (360.0, 5.0)]).unwrap(),
        )
        .with_min_elevation(0.0);
        assert_eq!(p.classify(pos(90.0, 30.0)).unwrap(), Sunlit::Sunlit);
        assert_eq!(p.classify(pos(90.0, 12.0)).unwrap(), Sunlit::Shade);
    }

    #[test]
    fn debounce_holds_until_all_lookahead_agree() {
        let p = profile();
        let mut d = SunlitDebounce::new();

        let shade = SunState::fixed(pos(90.0, 50.0), vec![]);
        assert_eq!(d.update("w", &p, &shade), Sunlit::Shade);

        // Now sunlit, but one lookahead sample still in shade.
        let flapping = SunState::fixed(
            pos(90.0, 30.0),
            vec![pos(91.0, 30.0), pos(92.0, 50.0), pos(93.0, 30.0)],
        );
        assert_eq!(d.update("w", &p, &flapping), Sunlit::Shade);
        assert_eq!(d.committed(), Some(Sunlit::Shade));

        let settled = SunState::fixed(
            pos(90.0, 30.0),
            vec![pos(91.0, 30.0), pos(92.0, 29.0), pos(93.0, 28.0)],
        );
        assert_eq!(d.update("w", &p, &settled), Sunlit::Sunlit);
        assert_eq!(d.committed(), Some(Sunlit::Sunlit));
    }

    #[test]
    fn first_classification_commits_immediately() {
        let p = profile();
        let mut d = SunlitDebounce::new();
        let sun = SunState::fixed(pos(90.0, 30.0), vec![pos(91.0, 80.0)]);
        assert_eq!(d.update("w", &p, &sun), Sunlit::Sunlit);
    }

    #[test]
    fn nan_azimuth_falls_back_to_shade() {
        let p = profile();
        let mut d = SunlitDebounce::new();
        let sun = SunState::fixed(pos(f64::NAN, 30.0), vec![]);
        assert_eq!(d.update("w", &p, &sun), Sunlit::Shade);
    }
}
