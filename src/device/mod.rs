//! Device capabilities and backend selection.
//!
//! The controller only talks to these traits:
//!   Shutter       - read / write one actuator's level
//!   SensorSource  - brightness and temperature readings, battery state
//!   SysvarStore   - boolean system variables set by remote controls
//!
//! Backends:
//!   1. ccu       - HomeMatic CCU JSON-RPC over HTTP (feature "ccu")
//!   2. simulated - in-memory home, used for dry runs and tests

#[cfg(feature = "ccu")]
pub mod ccu;
pub mod simulated;

use std::fmt;

use log::{error, warn};

use crate::error::DeviceError;
use crate::Clock;

/// Reading kinds offered by sensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    Brightness,
    Temperature,
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorKind::Brightness => write!(f, "brightness"),
            SensorKind::Temperature => write!(f, "temperature"),
        }
    }
}

pub trait Shutter {
    fn name(&self) -> &str;
    /// Current level, 0 = closed, 1 = open
    fn read_position(&self) -> Result<f64, DeviceError>;
    fn write_position(&self, value: f64) -> Result<(), DeviceError>;
}

pub trait SensorSource {
    fn read_sensor(&self, kind: SensorKind, device: &str) -> Result<f64, DeviceError>;
    fn battery_low(&self, device: &str) -> Result<bool, DeviceError>;
}

pub trait SysvarStore {
    fn get_bool(&self, name: &str) -> Result<bool, DeviceError>;
    fn set_bool(&self, name: &str, value: bool) -> Result<(), DeviceError>;
}

/// Result of looking a device up by name
#[derive(Debug)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
    /// Several devices share the name; `first` is the one that would be used.
    Ambiguous { first: T, count: usize },
}

impl<T> Lookup<T> {
    /// Resolve to a device, taking the first of several with a warning.
    pub fn into_first(self, name: &str) -> Option<T> {
        match self {
            Lookup::Found(t) => Some(t),
            Lookup::NotFound => None,
            Lookup::Ambiguous { first, count } => {
                warn!(target: "device", "{} devices named {}, first one taken", count, name);
                Some(first)
            }
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Found(t) => Lookup::Found(f(t)),
            Lookup::NotFound => Lookup::NotFound,
            Lookup::Ambiguous { first, count } => Lookup::Ambiguous {
                first: f(first),
                count,
            },
        }
    }

    /// Build from every match of a query
    pub fn from_matches(mut matches: Vec<T>) -> Self {
        match matches.len() {
            0 => Lookup::NotFound,
            1 => Lookup::Found(matches.remove(0)),
            count => Lookup::Ambiguous {
                first: matches.remove(0),
                count,
            },
        }
    }
}

/// A whole installation: shutters, sensors and system variables.
pub trait Home: SensorSource + SysvarStore {
    fn backend_name(&self) -> &str;
    fn shutter(&self, name: &str) -> Result<Lookup<Box<dyn Shutter>>, DeviceError>;
    /// Names of all devices of a device type, e.g. "HM-Sen-LI-O"
    fn sensors_of_type(&self, type_name: &str) -> Result<Vec<String>, DeviceError>;
    /// Resolve a sensor device name
    fn sensor(&self, name: &str) -> Result<Lookup<String>, DeviceError>;
}

/// Read a shutter level and reject values outside [0, 1].
pub fn read_level(shutter: &dyn Shutter) -> Result<f64, DeviceError> {
    let value = shutter.read_position()?;
    if !(0.0..=1.0).contains(&value) {
        return Err(DeviceError::OutOfRange {
            name: shutter.name().to_string(),
            value,
        });
    }
    Ok(value)
}

/// Startup lookup with exponential backoff. Gives up after `retries`
/// additional attempts and returns `None`.
pub fn lookup_with_retry<T>(
    name: &str,
    retries: u32,
    backoff: f64,
    clock: &dyn Clock,
    mut lookup: impl FnMut() -> Result<Lookup<T>, DeviceError>,
) -> Option<T> {
    let mut delay = backoff;
    for attempt in 0..=retries {
        match lookup() {
            Ok(found) => {
                if let Some(t) = found.into_first(name) {
                    return Some(t);
                }
                warn!(target: "device", "no device named {} (attempt {})", name, attempt + 1);
            }
            Err(e) => warn!(target: "device", "lookup of {} failed: {} (attempt {})", name, e, attempt + 1),
        }
        if attempt < retries {
            clock.sleep(delay);
            delay *= 2.0;
        }
    }
    error!(target: "device", "giving up on {}", name);
    None
}

/// Why `connect` would settle for the simulated home, if it would.
fn simulated_fallback(params: &crate::config::Params) -> Option<&'static str> {
    match (cfg!(feature = "ccu"), params.ccu_address.is_some()) {
        (true, false) => Some("no ccu_address configured"),
        (false, true) => Some("built without CCU support"),
        _ => None,
    }
}

/// Connect to the configured backend.
///
/// Falls back to the simulated home when no CCU address is configured or
/// the build has no CCU support.
pub fn connect(params: &crate::config::Params) -> Result<Box<dyn Home>, DeviceError> {
    #[cfg(feature = "ccu")]
    {
        if let Some(address) = params.ccu_address.as_deref() {
            let ccu = ccu::Ccu::login(
                address,
                &params.ccu_user,
                &params.ccu_password,
                params.connect_timeout,
            )?;
            return Ok(Box::new(ccu));
        }
    }

    if let Some(reason) = simulated_fallback(params) {
        warn!(target: "device", "{}, using simulated home", reason);
    }
    Ok(Box::new(simulated::SimulatedHome::from_params(params)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;

    #[test]
    fn lookup_from_matches() {
        assert!(matches!(Lookup::<u8>::from_matches(vec![]), Lookup::NotFound));
        assert!(matches!(Lookup::from_matches(vec![3]), Lookup::Found(3)));
        match Lookup::from_matches(vec![4, 5, 6]) {
            Lookup::Ambiguous { first, count } => assert_eq!((first, count), (4, 3)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn fallback_to_simulated_home_is_reported() {
        let mut params = crate::config::Params::default();
        let home = connect(&params).unwrap();
        assert_eq!(home.backend_name(), "simulated");
        if cfg!(feature = "ccu") {
            assert_eq!(simulated_fallback(&params), Some("no ccu_address configured"));
        } else {
            assert_eq!(simulated_fallback(&params), None);
            params.ccu_address = Some("http://ccu.local".into());
            assert_eq!(simulated_fallback(&params), Some("built without CCU support"));
        }
    }

    #[test]
    fn ambiguous_takes_first() {
        let l = Lookup::Ambiguous { first: "a", count: 2 };
        assert_eq!(l.into_first("x"), Some("a"));
    }

    #[test]
    fn retry_backs_off_then_finds() {
        let clock = ManualClock::new(0);
        let mut calls = 0;
        let found = lookup_with_retry("kitchen", 3, 2.0, &clock, || {
            calls += 1;
            if calls < 3 {
                Err(DeviceError::Unreachable {
                    name: "kitchen".into(),
                    reason: "timeout".into(),
                })
            } else {
                Ok(Lookup::Found(7))
            }
        });
        assert_eq!(found, Some(7));
        // 2 s then 4 s
        assert_eq!(clock.slept(), 6.0);
    }

    #[test]
    fn retry_gives_up() {
        let clock = ManualClock::new(0);
        let found: Option<u8> = lookup_with_retry("gone", 2, 1.0, &clock, || Ok(Lookup::NotFound));
        assert_eq!(found, None);
        assert_eq!(clock.slept(), 3.0);
    }
}
