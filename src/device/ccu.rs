//! HomeMatic CCU JSON-RPC client.
//!
//! Every call is a POST of `{"method", "params"}` to
//! `http://<address>/api/homematic.cgi`; the reply carries `result` or
//! `error`. A session id from `Session.login` goes into each request as
//! `_session_id_`.
//!
//! Device names are resolved once from `Device.listAllDetail`; shutter and
//! sensor values live on channel 1 (`LEVEL`, `LUX`, `TEMPERATURE`), battery
//! state on the maintenance channel 0 (`LOWBAT`).

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, info};
use serde_json::{json, Value};

use super::{Home, Lookup, SensorKind, SensorSource, Shutter, SysvarStore};
use crate::error::DeviceError;

const INTERFACE: &str = "BidCos-RF";
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct DeviceInfo {
    name: String,
    address: String,
    type_name: String,
}

struct Session {
    agent: ureq::Agent,
    url: String,
    session_id: String,
    devices: RefCell<Option<Vec<DeviceInfo>>>,
}

impl Session {
    fn call(&self, method: &str, mut params: Value) -> Result<Value, DeviceError> {
        if let Value::Object(map) = &mut params {
            map.insert("_session_id_".into(), Value::String(self.session_id.clone()));
        }
        rpc(&self.agent, &self.url, method, params)
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        if let Some(d) = self.devices.borrow().as_ref() {
            return Ok(d.clone());
        }
        let list = self.call("Device.listAllDetail", json!({}))?;
        let devices: Vec<DeviceInfo> = list
            .as_array()
            .ok_or_else(|| DeviceError::Backend("device list is not an array".into()))?
            .iter()
            .filter_map(|d| {
                Some(DeviceInfo {
                    name: d["name"].as_str()?.to_string(),
                    address: d["address"].as_str()?.to_string(),
                    type_name: d["type"].as_str().unwrap_or("").to_string(),
                })
            })
            .collect();
        info!(target: "ccu", "{} devices listed", devices.len());
        *self.devices.borrow_mut() = Some(devices.clone());
        Ok(devices)
    }

    fn get_value(&self, name: &str, address: &str, key: &str) -> Result<Value, DeviceError> {
        self.call(
            "Interface.getValue",
            json!({ "interface": INTERFACE, "address": address, "valueKey": key }),
        )
        .map_err(|e| DeviceError::Read {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }
}

fn rpc(agent: &ureq::Agent, url: &str, method: &str, params: Value) -> Result<Value, DeviceError> {
    let body = json!({ "version": "1.1", "method": method, "params": params });
    let response = agent
        .post(url)
        .timeout(CALL_TIMEOUT)
        .send_json(&body)
        .map_err(|e| match e {
            ureq::Error::Status(code, _) => {
                DeviceError::Backend(format!("{} returned status {}", method, code))
            }
            ureq::Error::Transport(t) => DeviceError::Unreachable {
                name: url.to_string(),
                reason: t.to_string(),
            },
        })?;
    let reply: Value = response
        .into_json()
        .map_err(|e| DeviceError::Backend(format!("{}: {}", method, e)))?;
    if !reply["error"].is_null() {
        return Err(DeviceError::Backend(format!(
            "{}: {}",
            method,
            reply["error"]["message"].as_str().unwrap_or("error")
        )));
    }
    Ok(reply["result"].clone())
}

/// Values come back as JSON numbers or as strings, depending on firmware.
fn as_f64(v: &Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str()?.trim().parse().ok())
}

fn as_bool(v: &Value) -> Option<bool> {
    v.as_bool().or_else(|| match v.as_str()? {
        "true" | "1" => Some(true),
        "false" | "0" | "" => Some(false),
        _ => None,
    })
}

pub struct Ccu {
    session: Rc<Session>,
}

impl Ccu {
    /// Log in. The connect timeout applies to the whole session.
    pub fn login(
        address: &str,
        user: &str,
        password: &str,
        connect_timeout: f64,
    ) -> Result<Self, DeviceError> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs_f64(connect_timeout.max(0.1)))
            .build();
        let url = format!("http://{}/api/homematic.cgi", address);
        let result = rpc(
            &agent,
            &url,
            "Session.login",
            json!({ "username": user, "password": password }),
        )?;
        let session_id = result
            .as_str()
            .ok_or_else(|| DeviceError::Backend("login returned no session".into()))?
            .to_string();
        info!(target: "ccu", "logged in to {}", address);
        Ok(Self {
            session: Rc::new(Session {
                agent,
                url,
                session_id,
                devices: RefCell::new(None),
            }),
        })
    }

    fn matches(&self, name: &str) -> Result<Vec<DeviceInfo>, DeviceError> {
        Ok(self
            .session
            .devices()?
            .into_iter()
            .filter(|d| d.name == name)
            .collect())
    }

    fn address_of(&self, device: &str) -> Result<String, DeviceError> {
        self.matches(device)?
            .into_iter()
            .next()
            .map(|d| d.address)
            .ok_or_else(|| DeviceError::NotFound(device.to_string()))
    }
}

impl Drop for Ccu {
    fn drop(&mut self) {
        let _ = self.session.call("Session.logout", json!({}));
    }
}

pub struct CcuShutter {
    name: String,
    channel: String,
    session: Rc<Session>,
}

impl Shutter for CcuShutter {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_position(&self) -> Result<f64, DeviceError> {
        let v = self.session.get_value(&self.name, &self.channel, "LEVEL")?;
        as_f64(&v).ok_or_else(|| DeviceError::Read {
            name: self.name.clone(),
            reason: format!("unexpected LEVEL value {}", v),
        })
    }

    fn write_position(&self, value: f64) -> Result<(), DeviceError> {
        debug!(target: "ccu", "{} LEVEL <- {:.3}", self.name, value);
        self.session
            .call(
                "Interface.setValue",
                json!({
                    "interface": INTERFACE,
                    "address": self.channel,
                    "valueKey": "LEVEL",
                    "type": "double",
                    "value": value,
                }),
            )
            .map(|_| ())
            .map_err(|e| DeviceError::Write {
                name: self.name.clone(),
                reason: e.to_string(),
            })
    }
}

impl SensorSource for Ccu {
    fn read_sensor(&self, kind: SensorKind, device: &str) -> Result<f64, DeviceError> {
        let channel = format!("{}:1", self.address_of(device)?);
        let key = match kind {
            SensorKind::Brightness => "LUX",
            SensorKind::Temperature => "TEMPERATURE",
        };
        let v = self.session.get_value(device, &channel, key)?;
        as_f64(&v).ok_or_else(|| DeviceError::Read {
            name: device.to_string(),
            reason: format!("unexpected {} value {}", key, v),
        })
    }

    fn battery_low(&self, device: &str) -> Result<bool, DeviceError> {
        let channel = format!("{}:0", self.address_of(device)?);
        let v = self.session.get_value(device, &channel, "LOWBAT")?;
        Ok(as_bool(&v).unwrap_or(false))
    }
}

impl SysvarStore for Ccu {
    fn get_bool(&self, name: &str) -> Result<bool, DeviceError> {
        let v = self
            .session
            .call("SysVar.getValueByName", json!({ "name": name }))
            .map_err(|e| DeviceError::Sysvar(format!("{}: {}", name, e)))?;
        as_bool(&v).ok_or_else(|| DeviceError::Sysvar(format!("{}: not a boolean ({})", name, v)))
    }

    fn set_bool(&self, name: &str, value: bool) -> Result<(), DeviceError> {
        self.session
            .call("SysVar.setBool", json!({ "name": name, "value": value }))
            .map(|_| ())
            .map_err(|e| DeviceError::Sysvar(format!("{}: {}", name, e)))
    }
}

impl Home for Ccu {
    fn backend_name(&self) -> &str {
        "ccu"
    }

    fn shutter(&self, name: &str) -> Result<Lookup<Box<dyn Shutter>>, DeviceError> {
        let found = Lookup::from_matches(self.matches(name)?);
        Ok(found.map(|d| {
            Box::new(CcuShutter {
                name: name.to_string(),
                channel: format!("{}:1", d.address),
                session: Rc::clone(&self.session),
            }) as Box<dyn Shutter>
        }))
    }

    fn sensors_of_type(&self, type_name: &str) -> Result<Vec<String>, DeviceError> {
        Ok(self
            .session
            .devices()?
            .into_iter()
            .filter(|d| d.type_name == type_name)
            .map(|d| d.name)
            .collect())
    }

    fn sensor(&self, name: &str) -> Result<Lookup<String>, DeviceError> {
        Ok(Lookup::from_matches(self.matches(name)?).map(|d| d.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_and_strings_are_accepted() {
        assert_eq!(as_f64(&json!(0.5)), Some(0.5));
        assert_eq!(as_f64(&json!("0.250000")), Some(0.25));
        assert_eq!(as_f64(&json!(null)), None);
        assert_eq!(as_bool(&json!("true")), Some(true));
        assert_eq!(as_bool(&json!(false)), Some(false));
        assert_eq!(as_bool(&json!("maybe")), None);
    }
}
