//! Parameters, window and activity definitions, persisted state, and path
//! resolution.
//!
//! The parameter file is one flat JSON object. Scalar keys carry thresholds
//! and intervals; `shutter_<temperature>_<brightness>_<sunlit>` keys fill
//! the base setting table; `window:<name>` and `activity:<name>` keys carry
//! structured definitions. Anything missing or malformed falls back to its
//! default with a warning.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::brightness::{BrightnessCondition, BrightnessHistory, BrightnessSettings, Estimator};
use crate::calibration::Calibration;
use crate::error::{ConfigError, Error, Result};
use crate::horizon::{HorizonProfile, Polyline, Sunlit, DEFAULT_MIN_ELEVATION};
use crate::manual::NightSchedule;
use crate::overrides::{Activity, ActivityKind, Scope, VentilationSchedule};
use crate::temperature::{TemperatureCondition, TemperatureSettings, TemperatureStats};
use crate::MAX_STATE_FILE_BYTES;

const MAX_PARAM_FILE_BYTES: u64 = 1024 * 1024;
const WINDOW_PREFIX: &str = "window:";
const ACTIVITY_PREFIX: &str = "activity:";
const TABLE_PREFIX: &str = "shutter_";

/// Resolved filesystem paths
#[derive(Debug, Clone)]
pub struct Paths {
    pub config_dir: PathBuf,
    pub params_file: PathBuf,
    pub state_file: PathBuf,
    pub pid_file: PathBuf,
}

impl Paths {
    /// `$HOME/.config/shutterd`
    pub fn init() -> Result<Self, io::Error> {
        let home = std::env::var("HOME")
            .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "HOME not set"))?;
        Self::in_dir(PathBuf::from(&home).join(".config").join("shutterd"))
    }

    pub fn in_dir(config_dir: impl Into<PathBuf>) -> Result<Self, io::Error> {
        let config_dir = config_dir.into();
        fs::create_dir_all(&config_dir)?;
        Ok(Self {
            params_file: config_dir.join("params.json"),
            state_file: config_dir.join("state.json"),
            pid_file: config_dir.join("daemon.pid"),
            config_dir,
        })
    }
}

/// Raw parameter file contents, key -> value
pub type ParamMap = BTreeMap<String, Value>;

/// Read the parameter file. A missing file is an empty map.
pub fn load_param_map(path: &Path) -> Result<ParamMap> {
    let meta = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ParamMap::new()),
        Err(e) => return Err(e.into()),
    };
    if meta.len() > MAX_PARAM_FILE_BYTES {
        return Err(Error::InvalidValue(format!(
            "{} is larger than {} bytes",
            path.display(),
            MAX_PARAM_FILE_BYTES
        )));
    }
    let content = fs::read_to_string(path)?;
    match serde_json::from_str::<Value>(&content)? {
        Value::Object(map) => Ok(map.into_iter().collect()),
        _ => Err(ConfigError::NotAnObject.into()),
    }
}

/// One window's static definition
#[derive(Debug, Clone, PartialEq)]
pub struct WindowDef {
    pub name: String,
    pub room: String,
    /// Name of the shutter actuator device
    pub shutter: String,
    pub profile: HorizonProfile,
    pub calibration: Calibration,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WindowJson {
    #[serde(default)]
    room: String,
    shutter: Option<String>,
    lower: Option<Vec<(f64, f64)>>,
    upper: Option<Vec<(f64, f64)>>,
    min_elevation: Option<f64>,
    calibration: Option<[f64; 3]>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ActivityJson {
    kind: String,
    value: Option<f64>,
    windows: Option<Vec<String>>,
    #[serde(default)]
    light_shade_separate: bool,
    #[serde(default)]
    priority: i64,
}

/// Base setting table, (temperature, brightness, sunlit) -> true setting
#[derive(Debug, Clone, PartialEq)]
pub struct BaseTable {
    entries: HashMap<(TemperatureCondition, BrightnessCondition, Sunlit), f64>,
}

impl BaseTable {
    pub fn key(t: TemperatureCondition, b: BrightnessCondition, s: Sunlit) -> String {
        format!("{}{}_{}_{}", TABLE_PREFIX, t.as_str(), b.as_str(), s.as_str())
    }

    fn default_value(t: TemperatureCondition, b: BrightnessCondition, s: Sunlit) -> f64 {
        use BrightnessCondition as B;
        use TemperatureCondition as T;
        match (s, t, b) {
            (Sunlit::Shade, T::VeryHot | T::VeryHotForecast, _) => 0.8,
            (Sunlit::Shade, _, _) => 1.0,
            (Sunlit::Sunlit, T::Cold, _) => 1.0,
            (Sunlit::Sunlit, T::Normal, B::VeryBright) => 0.7,
            (Sunlit::Sunlit, T::Normal, _) => 1.0,
            (Sunlit::Sunlit, T::Hot | T::HotForecast, B::Dim) => 1.0,
            (Sunlit::Sunlit, T::Hot | T::HotForecast, B::VeryBright) => 0.3,
            (Sunlit::Sunlit, T::Hot | T::HotForecast, _) => 0.4,
            (Sunlit::Sunlit, T::VeryHot | T::VeryHotForecast, B::Dim) => 0.8,
            (Sunlit::Sunlit, T::VeryHot | T::VeryHotForecast, B::VeryBright) => 0.2,
            (Sunlit::Sunlit, T::VeryHot | T::VeryHotForecast, _) => 0.25,
        }
    }

    /// Look up a true setting. "No measurement" reads as normal brightness.
    pub fn get(&self, t: TemperatureCondition, b: BrightnessCondition, s: Sunlit) -> f64 {
        let b = b.or_normal();
        self.entries
            .get(&(t, b, s))
            .copied()
            .unwrap_or_else(|| Self::default_value(t, b, s))
    }
}

impl Default for BaseTable {
    fn default() -> Self {
        let mut entries = HashMap::new();
        for t in TemperatureCondition::ALL {
            for b in BrightnessCondition::ALL {
                for s in [Sunlit::Sunlit, Sunlit::Shade] {
                    entries.insert((t, b, s), Self::default_value(t, b, s));
                }
            }
        }
        Self { entries }
    }
}

/// Immutable parameter snapshot, rebuilt whenever the file changes.
#[derive(Debug, Clone, PartialEq)]
pub struct Params {
    pub output_level: u8,
    pub ccu_address: Option<String>,
    pub ccu_user: String,
    pub ccu_password: String,
    pub connect_timeout: f64,
    /// Seconds between control cycles
    pub main_loop_sleep_time: f64,
    pub latitude: f64,
    pub longitude: f64,
    /// longitude / 15, hours
    pub utc_shift: f64,
    pub sun_twilight_threshold: f64,
    pub sunrise_decision_width: f64,
    pub sunrise_decision_interval: f64,
    pub day_brightness_threshold: f64,
    pub night_brightness_threshold: f64,
    pub lookahead_seconds: f64,
    pub shutter_setting_tolerance: f64,
    pub shutter_trigger_delay: f64,
    pub night: NightSchedule,
    pub brightness: BrightnessSettings,
    pub brightness_sensor_type: String,
    pub temperature: TemperatureSettings,
    pub temperature_sensor: String,
    pub min_temperature: f64,
    pub max_temperature: f64,
    pub forecast_url: Option<String>,
    pub forecast_days: u32,
    pub forecast_refresh_interval: f64,
    pub lookup_retries: u32,
    pub lookup_backoff: f64,
    pub table: BaseTable,
    pub windows: Vec<WindowDef>,
    pub activities: Vec<Activity>,
    pub ventilation: VentilationSchedule,
}

impl Default for Params {
    fn default() -> Self {
        Params::parse(&ParamMap::new()).0
    }
}

/// Typed reads with fallback, collecting problems on the way.
struct Reader<'a> {
    map: &'a ParamMap,
    problems: Vec<ConfigError>,
}

impl<'a> Reader<'a> {
    fn invalid(&mut self, key: &str, reason: impl Into<String>) {
        self.problems.push(ConfigError::InvalidKey {
            key: key.to_string(),
            reason: reason.into(),
        });
    }

    fn f64(&mut self, key: &str, default: f64) -> f64 {
        match self.map.get(key) {
            None => default,
            Some(v) => match v.as_f64().or_else(|| v.as_str()?.trim().parse().ok()) {
                Some(x) if x.is_finite() => x,
                _ => {
                    self.invalid(key, format!("expected a number, using {}", default));
                    default
                }
            },
        }
    }

    fn fraction(&mut self, key: &str, default: f64) -> f64 {
        let v = self.f64(key, default);
        if (0.0..=1.0).contains(&v) {
            v
        } else {
            self.invalid(key, format!("{} outside [0, 1], using {}", v, default));
            default
        }
    }

    fn non_negative(&mut self, key: &str, default: f64) -> f64 {
        let v = self.f64(key, default);
        if v >= 0.0 {
            v
        } else {
            self.invalid(key, format!("negative, using {}", default));
            default
        }
    }

    fn u32(&mut self, key: &str, default: u32) -> u32 {
        match self.map.get(key) {
            None => default,
            Some(v) => match v.as_u64().and_then(|n| u32::try_from(n).ok()) {
                Some(n) => n,
                None => {
                    self.invalid(key, format!("expected a small integer, using {}", default));
                    default
                }
            },
        }
    }

    fn string(&mut self, key: &str, default: &str) -> String {
        self.opt_string(key).unwrap_or_else(|| default.to_string())
    }

    fn opt_string(&mut self, key: &str) -> Option<String> {
        match self.map.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::String(_) | Value::Null => None,
            _ => {
                self.invalid(key, "expected a string");
                None
            }
        }
    }

    fn string_list(&mut self, key: &str) -> Vec<String> {
        match self.map.get(key) {
            None => Vec::new(),
            Some(v) => match serde_json::from_value::<Vec<String>>(v.clone()) {
                Ok(list) => list,
                Err(e) => {
                    self.invalid(key, e.to_string());
                    Vec::new()
                }
            },
        }
    }
}

impl Params {
    /// Build a snapshot and report every key that fell back to a default.
    pub fn parse(map: &ParamMap) -> (Params, Vec<ConfigError>) {
        let mut r = Reader {
            map,
            problems: Vec::new(),
        };

        let longitude = r.f64("longitude", 7.9);
        let output_level = r.u32("output_level", 1).min(3) as u8;

        let brightness = BrightnessSettings {
            dim: r.non_negative("brightness_dim", 2000.0),
            very_bright: r.non_negative("brightness_very_bright", 25000.0),
            time_span: r.non_negative("brightness_time_span", 1800.0),
            update_interval: r.non_negative("brightness_update_interval", 60.0),
            minimum_reversal_time: r.non_negative("brightness_minimum_reversal_time", 1200.0),
            reversal_margin: r.non_negative("brightness_reversal_margin", 1.3),
            estimator: match r.string("brightness_estimator", "regression").as_str() {
                "max" => Estimator::Max,
                "regression" => Estimator::Regression,
                other => {
                    r.invalid(
                        "brightness_estimator",
                        format!("unknown estimator {}, using regression", other),
                    );
                    Estimator::Regression
                }
            },
        };

        let temperature = TemperatureSettings {
            update_interval: r.non_negative("temperature_update_interval", 1800.0),
            utc_shift: longitude / 15.0,
            max_cold: r.f64("max_temperature_cold", 12.0),
            max_hot: r.f64("max_temperature_hot", 25.0),
            max_very_hot: r.f64("max_temperature_very_hot", 30.0),
            current_hot: r.f64("current_temperature_hot", 27.0),
            current_very_hot: r.f64("current_temperature_very_hot", 31.0),
        };

        let night = NightSchedule {
            begin: r.f64("night_begin", 22.0),
            end_weekday: r.f64("night_end", 6.5),
            end_saturday: r.f64("night_end_saturday", 7.5),
            end_sunday: r.f64("night_end_sunday", 8.5),
        };

        let mut table = BaseTable::default();
        for t in TemperatureCondition::ALL {
            for b in BrightnessCondition::ALL {
                for s in [Sunlit::Sunlit, Sunlit::Shade] {
                    let key = BaseTable::key(t, b, s);
                    let default = BaseTable::default_value(t, b, s);
                    table.entries.insert((t, b, s), r.fraction(&key, default));
                }
            }
        }

        let min_elevation = r.f64("sunlit_minimum_elevation", DEFAULT_MIN_ELEVATION);
        let mut windows = Vec::new();
        let mut activities: Vec<(i64, Activity)> = Vec::new();
        for (key, value) in map {
            if let Some(name) = key.strip_prefix(WINDOW_PREFIX) {
                match parse_window(name, value, min_elevation) {
                    Ok(w) => windows.push(w),
                    Err(e) => r.problems.push(e),
                }
            } else if let Some(name) = key.strip_prefix(ACTIVITY_PREFIX) {
                match parse_activity(name, value) {
                    Ok(a) => activities.push(a),
                    Err(e) => r.problems.push(e),
                }
            } else if table_key_unknown(key) {
                r.invalid(key, "not a base table entry");
            }
        }
        // Stable: equal priorities keep key order
        activities.sort_by_key(|(priority, _)| *priority);

        let ventilation = VentilationSchedule::new(
            r.string("ventilation_until_morning", ""),
            r.string_list("ventilation_activities"),
        );

        let params = Params {
            output_level,
            ccu_address: r.opt_string("ccu_address"),
            ccu_user: r.string("user", ""),
            ccu_password: r.string("password", ""),
            connect_timeout: r.non_negative("connect_timeout", 5.0),
            main_loop_sleep_time: r.non_negative("main_loop_sleep_time", 121.0).max(1.0),
            latitude: r.f64("latitude", 50.7),
            longitude,
            utc_shift: longitude / 15.0,
            sun_twilight_threshold: r.f64("sun_twilight_threshold", -1.0),
            sunrise_decision_width: r.non_negative("sunrise_decision_width", 3.0),
            sunrise_decision_interval: r.non_negative("sunrise_decision_interval", 900.0),
            day_brightness_threshold: r.non_negative("day_brightness_threshold", 500.0),
            night_brightness_threshold: r.non_negative("night_brightness_threshold", 300.0),
            lookahead_seconds: r.non_negative("lookahead_seconds", 300.0),
            shutter_setting_tolerance: r.fraction("shutter_setting_tolerance", 0.02),
            shutter_trigger_delay: r.non_negative("shutter_trigger_delay", 40.0),
            night,
            brightness,
            brightness_sensor_type: r.string("brightness_sensor_type", "HM-Sen-LI-O"),
            temperature,
            temperature_sensor: r.string("temperature_sensor", "outside temperature"),
            min_temperature: r.f64("min_temperature", 5.0),
            max_temperature: r.f64("max_temperature", 10.0),
            forecast_url: r.opt_string("forecast_url"),
            forecast_days: r.u32("forecast_days", 1),
            forecast_refresh_interval: r.non_negative("forecast_refresh_interval", 3600.0),
            lookup_retries: r.u32("lookup_retries", 5),
            lookup_backoff: r.non_negative("lookup_backoff", 10.0),
            table,
            windows,
            activities: activities.into_iter().map(|(_, a)| a).collect(),
            ventilation,
        };
        (params, r.problems)
    }

    /// Build a snapshot, logging every fallback.
    pub fn from_map(map: &ParamMap) -> Params {
        let (params, problems) = Params::parse(map);
        for p in &problems {
            warn!(target: "config", "{}", p);
        }
        params
    }

    pub fn temperature_stats(&self) -> TemperatureStats {
        TemperatureStats::new(self.min_temperature, self.max_temperature)
    }
}

/// Keys that look like base table entries but name no known combination.
fn table_key_unknown(key: &str) -> bool {
    let looks_like_table = TemperatureCondition::ALL
        .iter()
        .any(|t| key.starts_with(&format!("{}{}_", TABLE_PREFIX, t.as_str())));
    let known = TemperatureCondition::ALL.iter().any(|&t| {
        BrightnessCondition::ALL.iter().any(|&b| {
            [Sunlit::Sunlit, Sunlit::Shade]
                .iter()
                .any(|&s| BaseTable::key(t, b, s) == key)
        })
    });
    looks_like_table && !known
}

fn parse_window(name: &str, value: &Value, min_elevation: f64) -> Result<WindowDef, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidWindow {
        window: name.to_string(),
        reason,
    };
    let def: WindowJson =
        serde_json::from_value(value.clone()).map_err(|e| invalid(e.to_string()))?;

    let lower = match def.lower {
        Some(points) => Polyline::new(points).map_err(|e| invalid(format!("lower: {}", e)))?,
        None => Polyline::flat(0.0),
    };
    let upper = match def.upper {
        Some(points) => Polyline::new(points).map_err(|e| invalid(format!("upper: {}", e)))?,
        None => Polyline::flat(90.0),
    };
    let calibration = match def.calibration {
        Some(coef) => Calibration::new(coef).map_err(|e| invalid(e.to_string()))?,
        None => Calibration::default(),
    };

    Ok(WindowDef {
        name: name.to_string(),
        room: def.room,
        shutter: def.shutter.unwrap_or_else(|| name.to_string()),
        profile: HorizonProfile::new(lower, upper)
            .with_min_elevation(def.min_elevation.unwrap_or(min_elevation)),
        calibration,
    })
}

fn parse_activity(name: &str, value: &Value) -> Result<(i64, Activity), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidActivity {
        activity: name.to_string(),
        reason,
    };
    let def: ActivityJson =
        serde_json::from_value(value.clone()).map_err(|e| invalid(e.to_string()))?;

    let scope = match def.windows {
        Some(list) => Scope::windows(list),
        None => Scope::All,
    };
    let value = || -> Result<f64, ConfigError> {
        match def.value {
            Some(v) if (0.0..=1.0).contains(&v) => Ok(v),
            Some(v) => Err(invalid(format!("value {} outside [0, 1]", v))),
            None => Err(invalid("missing value".into())),
        }
    };

    let kind = match def.kind.as_str() {
        "suspend" => ActivityKind::Suspend { scope },
        "induced" => ActivityKind::InducedSetting {
            value: value()?,
            scope,
        },
        "constant_daytime" => ActivityKind::ConstantDaytimeSetting {
            value: value()?,
            scope,
            light_shade_separate: def.light_shade_separate,
        },
        other => return Err(invalid(format!("unknown kind {}", other))),
    };
    Ok((def.priority, Activity::new(name, kind)))
}

/// Re-reads the parameter file each cycle and hands out a new snapshot
/// only when its contents changed.
#[derive(Debug, Default)]
pub struct ParamWatcher {
    last: Option<ParamMap>,
}

impl ParamWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poll(&mut self, path: &Path) -> Option<Params> {
        let map = match load_param_map(path) {
            Ok(m) => m,
            Err(e) => {
                warn!(target: "config", "{}: {}", path.display(), e);
                if self.last.is_some() {
                    return None;
                }
                ParamMap::new()
            }
        };
        self.offer(map)
    }

    /// Returns a snapshot if `map` differs from the previous one.
    pub fn offer(&mut self, map: ParamMap) -> Option<Params> {
        if self.last.as_ref() == Some(&map) {
            return None;
        }
        let params = Params::from_map(&map);
        self.last = Some(map);
        Some(params)
    }
}

/// Everything that survives a restart
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    pub temperature: TemperatureStats,
    pub brightness: BrightnessHistory,
}

pub fn load_state(paths: &Paths) -> Option<PersistedState> {
    let meta = fs::metadata(&paths.state_file).ok()?;
    if meta.len() > MAX_STATE_FILE_BYTES {
        warn!(target: "config", "{} too large, ignored", paths.state_file.display());
        return None;
    }
    let content = fs::read_to_string(&paths.state_file).ok()?;
    match serde_json::from_str(&content) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(target: "config", "{}: {}", paths.state_file.display(), e);
            None
        }
    }
}

/// Write via a temporary file so a crash never leaves half a state file.
pub fn save_state(paths: &Paths, state: &PersistedState) -> Result<(), io::Error> {
    let json = serde_json::to_string(state).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    let tmp = paths.state_file.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, &paths.state_file)
}

/// Check if daemon process is alive via PID file
pub fn check_daemon_alive(paths: &Paths) -> bool {
    let content = match fs::read_to_string(&paths.pid_file) {
        Ok(c) => c,
        Err(_) => return false,
    };
    let pid: i32 = match content.trim().parse() {
        Ok(p) => p,
        Err(_) => return false,
    };
    if pid <= 0 {
        return false;
    }
    unsafe { libc::kill(pid, 0) == 0 }
}

pub fn write_pid(paths: &Paths) -> Result<(), io::Error> {
    let pid = unsafe { libc::getpid() };
    fs::write(&paths.pid_file, format!("{}\n", pid))
}

pub fn remove_pid(paths: &Paths) {
    let _ = fs::remove_file(&paths.pid_file);
}
