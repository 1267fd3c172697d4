//! Manual operation detection and write gating.
//!
//! A shutter moved by hand (or by its local switch) no longer matches the
//! level this daemon last saw. From then on automatic writes are held
//! back until the shutter is opened fully again, or an induced activity
//! takes over.

use log::{debug, info};

use crate::Clock;

/// Per-window bookkeeping owned by the controller
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowState {
    /// Nominal value of the last successful write
    pub last_commanded: Option<f64>,
    /// Raw level seen in the last cycle (or just written)
    pub last_observed: Option<f64>,
    pub manual_active: bool,
    pub last_manual_at: Option<i64>,
}

impl WindowState {
    /// Record a successful write.
    pub fn commanded(&mut self, nominal: f64) {
        self.last_commanded = Some(nominal);
        self.last_observed = Some(nominal);
    }

    /// An induced setting ends manual intervention.
    pub fn release(&mut self) {
        self.manual_active = false;
    }

    /// Seconds since the shutter was moved by hand, while that still holds.
    pub fn manual_for(&self, now: i64) -> Option<i64> {
        self.last_manual_at
            .filter(|_| self.manual_active)
            .map(|at| now - at)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Observation {
    /// Manual intervention just ended by opening the shutter fully
    pub edge: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ManualDetector {
    pub tolerance: f64,
}

impl ManualDetector {
    pub fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }

    /// Compare a fresh raw reading with what was seen before.
    pub fn observe(&self, window: &str, state: &mut WindowState, raw: f64, now: i64) -> Observation {
        let mut obs = Observation::default();
        if state.last_commanded.is_some() {
            let reference = state.last_observed.or(state.last_commanded).unwrap_or(raw);
            if (raw - reference).abs() > self.tolerance {
                if (raw - 1.0).abs() <= self.tolerance {
                    if state.manual_active {
                        info!(target: "manual", "end of manual intervention for {}", window);
                    }
                    state.manual_active = false;
                    obs.edge = true;
                } else {
                    info!(
                        target: "manual",
                        "manual intervention for {} found, new level {:.2}",
                        window,
                        raw
                    );
                    state.manual_active = true;
                    state.last_manual_at = Some(now);
                }
            }
        }
        state.last_observed = Some(raw);
        obs
    }
}

/// Civil night hours. Ordinary writes are held back at night.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NightSchedule {
    pub begin: f64,
    pub end_weekday: f64,
    pub end_saturday: f64,
    pub end_sunday: f64,
}

impl Default for NightSchedule {
    fn default() -> Self {
        Self {
            begin: 22.0,
            end_weekday: 6.5,
            end_saturday: 7.5,
            end_sunday: 8.5,
        }
    }
}

impl NightSchedule {
    /// `weekday`: Monday = 0 .. Sunday = 6; `hour` local civil hour.
    pub fn is_night(&self, weekday: u8, hour: f64) -> bool {
        let end = match weekday {
            5 => self.end_saturday,
            6 => self.end_sunday,
            _ => self.end_weekday,
        };
        !(end < hour && hour < self.begin)
    }
}

/// Wait after a write so sibling actuators do not collide on the radio.
pub fn settle(clock: &dyn Clock, delay: f64) {
    if delay > 0.0 {
        debug!(target: "manual", "settling for {:.0} s", delay);
        clock.sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;

    #[test]
    fn divergence_sets_manual_and_full_open_clears_it() {
        let d = ManualDetector::new(0.02);
        let mut st = WindowState::default();
        st.commanded(0.0);

        let obs = d.observe("kitchen", &mut st, 0.5, 100);
        assert!(st.manual_active);
        assert!(!obs.edge);
        assert_eq!(st.last_manual_at, Some(100));

        let obs = d.observe("kitchen", &mut st, 1.0, 200);
        assert!(!st.manual_active);
        assert!(obs.edge);
    }

    #[test]
    fn manual_hold_reports_its_age() {
        let d = ManualDetector::new(0.02);
        let mut st = WindowState::default();
        st.commanded(0.0);
        assert_eq!(st.manual_for(50), None);

        d.observe("w", &mut st, 0.5, 100);
        assert_eq!(st.manual_for(160), Some(60));

        d.observe("w", &mut st, 1.0, 200);
        assert_eq!(st.manual_for(260), None);
    }

    #[test]
    fn edge_fires_once() {
        let d = ManualDetector::new(0.02);
        let mut st = WindowState::default();
        st.commanded(0.3);
        assert!(d.observe("w", &mut st, 1.0, 0).edge);
        assert!(!d.observe("w", &mut st, 1.0, 1).edge);
    }

    #[test]
    fn no_detection_before_first_write() {
        let d = ManualDetector::new(0.02);
        let mut st = WindowState::default();
        let obs = d.observe("w", &mut st, 0.5, 0);
        assert!(!st.manual_active && !obs.edge);
        assert_eq!(st.last_observed, Some(0.5));
    }

    #[test]
    fn small_drift_is_tolerated() {
        let d = ManualDetector::new(0.02);
        let mut st = WindowState::default();
        st.commanded(0.40);
        d.observe("w", &mut st, 0.41, 0);
        assert!(!st.manual_active);
    }

    #[test]
    fn manual_stays_while_level_is_unchanged() {
        let d = ManualDetector::new(0.02);
        let mut st = WindowState::default();
        st.commanded(0.0);
        d.observe("w", &mut st, 0.5, 0);
        d.observe("w", &mut st, 0.5, 1);
        assert!(st.manual_active);
        st.release();
        assert!(!st.manual_active);
    }

    #[test]
    fn night_hours_depend_on_weekday() {
        let n = NightSchedule::default();
        assert!(n.is_night(0, 6.0));
        assert!(!n.is_night(0, 7.0));
        assert!(n.is_night(5, 7.0));
        assert!(!n.is_night(5, 8.0));
        assert!(n.is_night(6, 8.0));
        assert!(!n.is_night(6, 9.0));
        assert!(n.is_night(2, 23.0));
    }

    #[test]
    fn settle_sleeps_on_the_clock() {
        let c = ManualClock::new(0);
        settle(&c, 40.0);
        assert_eq!(c.slept(), 40.0);
    }
}
