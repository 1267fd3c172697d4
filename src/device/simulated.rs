//! In-memory home.
//!
//! Shutters hold a level, sensors a value per reading kind, and system
//! variables a flag. Handles share one state, so a test can move a shutter
//! "by hand" or break a device while the controller holds its own handle.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use log::debug;

use super::{Home, Lookup, SensorKind, SensorSource, Shutter, SysvarStore};
use crate::config::Params;
use crate::error::DeviceError;

#[derive(Debug, Clone, Default)]
struct SimShutter {
    level: f64,
    fail_read: bool,
    fail_write: bool,
    writes: Vec<f64>,
}

#[derive(Debug, Clone, Default)]
struct SimSensor {
    type_name: String,
    brightness: Option<f64>,
    temperature: Option<f64>,
    battery_low: bool,
}

#[derive(Debug, Default)]
struct State {
    shutters: BTreeMap<String, SimShutter>,
    /// Extra devices sharing a shutter's name
    duplicates: BTreeMap<String, usize>,
    sensors: BTreeMap<String, SimSensor>,
    sysvars: BTreeMap<String, bool>,
    sysvars_unreachable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedHome {
    state: Rc<RefCell<State>>,
}

impl SimulatedHome {
    pub fn new() -> Self {
        Self::default()
    }

    /// A home with every configured shutter open and plausible sensors.
    pub fn from_params(params: &Params) -> Self {
        let home = Self::new();
        for w in &params.windows {
            home.add_shutter(&w.shutter, 1.0);
        }
        home.add_sensor(
            &params.temperature_sensor,
            "HM-WDS10-TH-O",
            SensorKind::Temperature,
            15.0,
        );
        home.add_sensor(
            "simulated brightness",
            &params.brightness_sensor_type,
            SensorKind::Brightness,
            20000.0,
        );
        home
    }

    pub fn add_shutter(&self, name: &str, level: f64) {
        self.state.borrow_mut().shutters.insert(
            name.to_string(),
            SimShutter {
                level,
                ..SimShutter::default()
            },
        );
    }

    /// Register another device under an existing shutter name.
    pub fn add_duplicate(&self, name: &str) {
        *self
            .state
            .borrow_mut()
            .duplicates
            .entry(name.to_string())
            .or_insert(0) += 1;
    }

    /// Move a shutter without going through the controller.
    pub fn set_level(&self, name: &str, level: f64) {
        if let Some(s) = self.state.borrow_mut().shutters.get_mut(name) {
            s.level = level;
        }
    }

    pub fn level(&self, name: &str) -> Option<f64> {
        self.state.borrow().shutters.get(name).map(|s| s.level)
    }

    /// Every value written to a shutter, oldest first.
    pub fn writes(&self, name: &str) -> Vec<f64> {
        self.state
            .borrow()
            .shutters
            .get(name)
            .map(|s| s.writes.clone())
            .unwrap_or_default()
    }

    pub fn fail_reads(&self, name: &str, fail: bool) {
        if let Some(s) = self.state.borrow_mut().shutters.get_mut(name) {
            s.fail_read = fail;
        }
    }

    pub fn fail_writes(&self, name: &str, fail: bool) {
        if let Some(s) = self.state.borrow_mut().shutters.get_mut(name) {
            s.fail_write = fail;
        }
    }

    pub fn add_sensor(&self, name: &str, type_name: &str, kind: SensorKind, value: f64) {
        let mut st = self.state.borrow_mut();
        let sensor = st.sensors.entry(name.to_string()).or_default();
        sensor.type_name = type_name.to_string();
        match kind {
            SensorKind::Brightness => sensor.brightness = Some(value),
            SensorKind::Temperature => sensor.temperature = Some(value),
        }
    }

    pub fn set_sensor(&self, name: &str, kind: SensorKind, value: f64) {
        if let Some(sensor) = self.state.borrow_mut().sensors.get_mut(name) {
            match kind {
                SensorKind::Brightness => sensor.brightness = Some(value),
                SensorKind::Temperature => sensor.temperature = Some(value),
            }
        }
    }

    pub fn set_battery_low(&self, name: &str, low: bool) {
        if let Some(sensor) = self.state.borrow_mut().sensors.get_mut(name) {
            sensor.battery_low = low;
        }
    }

    pub fn set_sysvar(&self, name: &str, value: bool) {
        self.state
            .borrow_mut()
            .sysvars
            .insert(name.to_string(), value);
    }

    pub fn sysvar(&self, name: &str) -> Option<bool> {
        self.state.borrow().sysvars.get(name).copied()
    }

    pub fn sysvars_unreachable(&self, unreachable: bool) {
        self.state.borrow_mut().sysvars_unreachable = unreachable;
    }
}

/// Handle to one simulated shutter
pub struct SimulatedShutter {
    name: String,
    state: Rc<RefCell<State>>,
}

impl Shutter for SimulatedShutter {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_position(&self) -> Result<f64, DeviceError> {
        let st = self.state.borrow();
        let s = st
            .shutters
            .get(&self.name)
            .ok_or_else(|| DeviceError::NotFound(self.name.clone()))?;
        if s.fail_read {
            return Err(DeviceError::Read {
                name: self.name.clone(),
                reason: "simulated failure".into(),
            });
        }
        Ok(s.level)
    }

    fn write_position(&self, value: f64) -> Result<(), DeviceError> {
        let mut st = self.state.borrow_mut();
        let s = st
            .shutters
            .get_mut(&self.name)
            .ok_or_else(|| DeviceError::NotFound(self.name.clone()))?;
        if s.fail_write {
            return Err(DeviceError::Write {
                name: self.name.clone(),
                reason: "simulated failure".into(),
            });
        }
        debug!(target: "simulated", "{} -> {:.3}", self.name, value);
        s.level = value;
        s.writes.push(value);
        Ok(())
    }
}

impl SensorSource for SimulatedHome {
    fn read_sensor(&self, kind: SensorKind, device: &str) -> Result<f64, DeviceError> {
        let st = self.state.borrow();
        let sensor = st
            .sensors
            .get(device)
            .ok_or_else(|| DeviceError::NotFound(device.to_string()))?;
        let value = match kind {
            SensorKind::Brightness => sensor.brightness,
            SensorKind::Temperature => sensor.temperature,
        };
        value.ok_or_else(|| DeviceError::Read {
            name: device.to_string(),
            reason: format!("no {} reading", kind),
        })
    }

    fn battery_low(&self, device: &str) -> Result<bool, DeviceError> {
        self.state
            .borrow()
            .sensors
            .get(device)
            .map(|s| s.battery_low)
            .ok_or_else(|| DeviceError::NotFound(device.to_string()))
    }
}

impl SysvarStore for SimulatedHome {
    fn get_bool(&self, name: &str) -> Result<bool, DeviceError> {
        let st = self.state.borrow();
        if st.sysvars_unreachable {
            return Err(DeviceError::Sysvar(name.to_string()));
        }
        Ok(st.sysvars.get(name).copied().unwrap_or(false))
    }

    fn set_bool(&self, name: &str, value: bool) -> Result<(), DeviceError> {
        let mut st = self.state.borrow_mut();
        if st.sysvars_unreachable {
            return Err(DeviceError::Sysvar(name.to_string()));
        }
        st.sysvars.insert(name.to_string(), value);
        Ok(())
    }
}

impl Home for SimulatedHome {
    fn backend_name(&self) -> &str {
        "simulated"
    }

    fn shutter(&self, name: &str) -> Result<Lookup<Box<dyn Shutter>>, DeviceError> {
        let st = self.state.borrow();
        if !st.shutters.contains_key(name) {
            return Ok(Lookup::NotFound);
        }
        let handle: Box<dyn Shutter> = Box::new(SimulatedShutter {
            name: name.to_string(),
            state: Rc::clone(&self.state),
        });
        Ok(match st.duplicates.get(name) {
            Some(&extra) if extra > 0 => Lookup::Ambiguous {
                first: handle,
                count: extra + 1,
            },
            _ => Lookup::Found(handle),
        })
    }

    fn sensors_of_type(&self, type_name: &str) -> Result<Vec<String>, DeviceError> {
        Ok(self
            .state
            .borrow()
            .sensors
            .iter()
            .filter(|(_, s)| s.type_name == type_name)
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn sensor(&self, name: &str) -> Result<Lookup<String>, DeviceError> {
        Ok(if self.state.borrow().sensors.contains_key(name) {
            Lookup::Found(name.to_string())
        } else {
            Lookup::NotFound
        })
    }
}
