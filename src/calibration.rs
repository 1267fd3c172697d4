//! Shutter actuator calibration.
//!
//! Shutter actuators report travel time, not slat position, so the value
//! sent to them ("nominal") differs from the physical opening ("true").
//! Per window the mapping is a quadratic fitted offline from three
//! measured (nominal, true) pairs:
//!
//!   nominal = c0 * true^2 + c1 * true + c2
//!
//! Fully closed and fully open are exact regardless of the fit.

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

#[derive(Debug, Clone, PartialEq, ThisError)]
pub enum CalibrationError {
    #[error("coefficient {0} is not finite")]
    NotFinite(usize),
    #[error("measured points do not determine a quadratic (singular system)")]
    Singular,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub coef: [f64; 3],
}

impl Default for Calibration {
    /// Identity mapping
    fn default() -> Self {
        Self {
            coef: [0.0, 1.0, 0.0],
        }
    }
}

impl Calibration {
    pub fn new(coef: [f64; 3]) -> Result<Self, CalibrationError> {
        if let Some(i) = coef.iter().position(|c| !c.is_finite()) {
            return Err(CalibrationError::NotFinite(i));
        }
        Ok(Self { coef })
    }

    /// Translate an intended (true) setting into the value for the actuator.
    pub fn true_to_nominal(&self, setting_true: f64) -> f64 {
        if setting_true == 1.0 {
            return 1.0;
        }
        if setting_true == 0.0 {
            return 0.0;
        }
        let [c0, c1, c2] = self.coef;
        (c0 * setting_true * setting_true + c1 * setting_true + c2).clamp(0.0, 1.0)
    }

    /// Fit coefficients from three measured `(nominal, true)` pairs.
    pub fn fit(pairs: [(f64, f64); 3]) -> Result<Self, CalibrationError> {
        let mut m = [[0.0f64; 4]; 3];
        for (row, &(nominal, t)) in m.iter_mut().zip(pairs.iter()) {
            *row = [t * t, t, 1.0, nominal];
        }

        // Gaussian elimination with partial pivoting
        for col in 0..3 {
            let pivot = (col..3)
                .max_by(|&a, &b| m[a][col].abs().total_cmp(&m[b][col].abs()))
                .unwrap_or(col);
            if m[pivot][col].abs() < 1e-12 {
                return Err(CalibrationError::Singular);
            }
            m.swap(col, pivot);
            for r in (col + 1)..3 {
                let f = m[r][col] / m[col][col];
                for c in col..4 {
                    m[r][c] -= f * m[col][c];
                }
            }
        }

        let mut x = [0.0f64; 3];
        for r in (0..3).rev() {
            let mut acc = m[r][3];
            for c in (r + 1)..3 {
                acc -= m[r][c] * x[c];
            }
            x[r] = acc / m[r][r];
        }
        Self::new(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_are_exact() {
        let c = Calibration::new([-0.72, 1.72, 0.3]).unwrap();
        assert_eq!(c.true_to_nominal(0.0), 0.0);
        assert_eq!(c.true_to_nominal(1.0), 1.0);
    }

    #[test]
    fn intermediate_values_are_clamped() {
        let c = Calibration::new([0.0, 3.0, 0.5]).unwrap();
        assert_eq!(c.true_to_nominal(0.5), 1.0);
        let c = Calibration::new([0.0, 1.0, -0.5]).unwrap();
        assert_eq!(c.true_to_nominal(0.2), 0.0);
    }

    #[test]
    fn quadratic_is_applied() {
        let c = Calibration::new([-0.12959185, 0.86158566, 0.25446371]).unwrap();
        let n = c.true_to_nominal(0.4);
        let expected = -0.12959185 * 0.16 + 0.86158566 * 0.4 + 0.25446371;
        assert!((n - expected).abs() < 1e-12);
    }

    #[test]
    fn fit_reproduces_measured_points() {
        // Nominal 0.3/0.6/0.9 measured at 70/485/1033 mm of 1200 mm
        let pairs = [
            (0.3, 70.0 / 1200.0),
            (0.6, 485.0 / 1200.0),
            (0.9, 1033.0 / 1200.0),
        ];
        let c = Calibration::fit(pairs).unwrap();
        for (nominal, t) in pairs {
            assert!((c.true_to_nominal(t) - nominal).abs() < 1e-9);
        }
    }

    #[test]
    fn fit_rejects_duplicate_points() {
        let err = Calibration::fit([(0.3, 0.2), (0.3, 0.2), (0.9, 0.8)]).unwrap_err();
        assert_eq!(err, CalibrationError::Singular);
    }

    #[test]
    fn rejects_nan_coefficients() {
        assert_eq!(
            Calibration::new([0.0, f64::NAN, 0.0]).unwrap_err(),
            CalibrationError::NotFinite(1)
        );
    }
}
