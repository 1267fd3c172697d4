//! Daemon loop.
//!
//! One cycle per `main_loop_sleep_time`: reload parameters, compute the
//! sun, update temperature and brightness, read activity flags, decide and
//! write shutters, persist state. SIGTERM/SIGINT arrive on a signalfd that
//! is polled between one-second sleep slices, so shutdown is prompt and
//! state is saved on the way out.

use std::collections::BTreeSet;
use std::io;

use log::{debug, error, info, warn};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};

use crate::brightness::BrightnessCondition;
use crate::config::{self, ParamWatcher, Params, Paths, PersistedState};
use crate::controller::{CycleInput, ShutterCommand, ShutterController};
use crate::device::{self, simulated::SimulatedHome, Home, Lookup, SensorKind};
use crate::error::{DeviceError, Result};
use crate::forecast::{ForecastProvider, HttpForecast, NoForecast};
use crate::overrides::{Arbitrator, VentilationSchedule};
use crate::solar::{self, Observer, SunState};
use crate::{local_midnight, local_solar_hour, local_time, logging, Clock, SLEEP_SLICE_SEC};

/// Decides whether the sun counts as up.
///
/// Clearly above or below the twilight band, elevation decides. Inside the
/// band the outside brightness decides (morning: bright enough to open,
/// evening: dim enough to close), and a decision sticks for at least
/// `sunrise_decision_interval` so passing clouds cannot flip it.
#[derive(Debug, Clone, Default)]
pub struct TwilightGate {
    sun_is_up: Option<bool>,
    last_changed: i64,
}

impl TwilightGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the hold time, e.g. after a parameter change.
    pub fn reset(&mut self) {
        self.last_changed = 0;
    }

    pub fn update(&mut self, now: i64, elevation: f64, brightness: Option<f64>, p: &Params) -> bool {
        let upper = p.sun_twilight_threshold + p.sunrise_decision_width;
        let lower = p.sun_twilight_threshold - p.sunrise_decision_width;
        let previous = self
            .sun_is_up
            .unwrap_or(elevation > p.sun_twilight_threshold);

        let up = if elevation > upper {
            true
        } else if elevation < lower {
            false
        } else if (now - self.last_changed) as f64 <= p.sunrise_decision_interval {
            previous
        } else {
            match brightness {
                None => previous,
                Some(b) if local_solar_hour(now, p.utc_shift) < 12.0 => {
                    if b > p.day_brightness_threshold {
                        self.last_changed = now;
                        true
                    } else {
                        false
                    }
                }
                Some(b) => {
                    if b < p.night_brightness_threshold {
                        self.last_changed = now;
                        false
                    } else {
                        true
                    }
                }
            }
        };

        if self.sun_is_up != Some(up) {
            info!(target: "daemon", "sun is {} (elevation {:.1})", if up { "up" } else { "down" }, elevation);
        }
        self.sun_is_up = Some(up);
        up
    }
}

fn forecast_provider(p: &Params) -> Box<dyn ForecastProvider> {
    match &p.forecast_url {
        Some(url) => Box::new(HttpForecast::new(url.clone(), p.latitude, p.longitude, p.forecast_days)),
        None => Box::new(NoForecast),
    }
}

/// Full daemon runtime state
pub struct Daemon {
    paths: Paths,
    params: Params,
    watcher: ParamWatcher,
    home: Box<dyn Home>,
    clock: Box<dyn Clock>,
    forecast: Box<dyn ForecastProvider>,
    forecast_fetched: Option<i64>,
    controller: ShutterController,
    arbitrator: Arbitrator,
    ventilation: VentilationSchedule,
    twilight: TwilightGate,
    state: PersistedState,
    brightness_sensors: Vec<String>,
    temperature_sensor: Option<String>,
    low_battery: BTreeSet<String>,
}

impl Daemon {
    /// Resolve devices (with retries) and restore persisted state.
    pub fn new(
        paths: Paths,
        params: Params,
        watcher: ParamWatcher,
        home: Box<dyn Home>,
        clock: Box<dyn Clock>,
    ) -> Self {
        let controller = ShutterController::build(&params, home.as_ref(), clock.as_ref());
        let state = config::load_state(&paths).unwrap_or_else(|| PersistedState {
            temperature: params.temperature_stats(),
            ..PersistedState::default()
        });
        let mut daemon = Self {
            forecast: forecast_provider(&params),
            forecast_fetched: None,
            arbitrator: Arbitrator::new(params.activities.clone()),
            ventilation: params.ventilation.clone(),
            twilight: TwilightGate::new(),
            state,
            brightness_sensors: Vec::new(),
            temperature_sensor: None,
            low_battery: BTreeSet::new(),
            controller,
            paths,
            params,
            watcher,
            home,
            clock,
        };
        let retries = daemon.params.lookup_retries;
        daemon.resolve_sensors(retries);
        info!(
            target: "daemon",
            "{} windows, {} brightness sensors, backend {}",
            daemon.controller.windows().len(),
            daemon.brightness_sensors.len(),
            daemon.home.backend_name()
        );
        daemon
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn state(&self) -> &PersistedState {
        &self.state
    }

    pub fn controller(&self) -> &ShutterController {
        &self.controller
    }

    pub fn set_forecast_provider(&mut self, provider: Box<dyn ForecastProvider>) {
        self.forecast = provider;
        self.forecast_fetched = None;
    }

    fn resolve_sensors(&mut self, retries: u32) {
        let p = &self.params;
        let home = self.home.as_ref();
        let type_name = p.brightness_sensor_type.clone();
        self.brightness_sensors = device::lookup_with_retry(
            &type_name,
            retries,
            p.lookup_backoff,
            self.clock.as_ref(),
            || {
                home.sensors_of_type(&type_name).map(|found| {
                    if found.is_empty() {
                        Lookup::NotFound
                    } else {
                        Lookup::Found(found)
                    }
                })
            },
        )
        .unwrap_or_default();
        self.temperature_sensor = device::lookup_with_retry(
            &p.temperature_sensor,
            retries,
            p.lookup_backoff,
            self.clock.as_ref(),
            || home.sensor(&p.temperature_sensor),
        );
    }

    fn apply_params(&mut self, params: Params) {
        info!(target: "config", "parameters have changed");
        logging::set_level(params.output_level);
        let sensors_changed = params.brightness_sensor_type != self.params.brightness_sensor_type
            || params.temperature_sensor != self.params.temperature_sensor;
        let forecast_changed = params.forecast_url != self.params.forecast_url
            || params.forecast_days != self.params.forecast_days
            || params.latitude != self.params.latitude
            || params.longitude != self.params.longitude;

        self.controller
            .redefine(&params, self.home.as_ref(), self.clock.as_ref());
        self.arbitrator.redefine(params.activities.clone());
        self.ventilation = params.ventilation.clone();
        self.twilight.reset();
        if forecast_changed {
            self.forecast = forecast_provider(&params);
            self.forecast_fetched = None;
            self.state.temperature.clear_forecast();
        }
        self.params = params;
        if sensors_changed {
            self.resolve_sensors(0);
        }
    }

    fn update_temperature(&mut self, now: i64) {
        if !self.state.temperature.is_due(now, &self.params.temperature) {
            return;
        }
        let Some(sensor) = self.temperature_sensor.as_deref() else {
            return;
        };
        match self.home.read_sensor(SensorKind::Temperature, sensor) {
            Ok(t) => {
                debug!(target: "daemon", "outside temperature {:.1}", t);
                self.state.temperature.update(now, t, &self.params.temperature);
            }
            Err(e) => warn!(target: "daemon", "{}", e),
        }
    }

    fn update_forecast(&mut self, now: i64) {
        let until = local_midnight(now) + self.params.forecast_days as i64 * 86400;
        let due = self.forecast_fetched.map_or(true, |t| {
            (now - t) as f64 > self.params.forecast_refresh_interval
        });
        if due {
            self.forecast_fetched = Some(now);
            let series = self.forecast.fetch();
            self.state.temperature.set_forecast(&series, now, until);
        } else {
            self.state.temperature.refresh_forecast(now, until);
        }
    }

    fn update_brightness(&mut self, now: i64) {
        let mut readings = Vec::new();
        for sensor in &self.brightness_sensors {
            match self.home.battery_low(sensor) {
                Ok(true) => {
                    if self.low_battery.insert(sensor.clone()) {
                        warn!(target: "daemon", "{} reports low battery, ignored", sensor);
                    }
                    continue;
                }
                Ok(false) => {
                    self.low_battery.remove(sensor);
                }
                Err(e) => debug!(target: "daemon", "{}", e),
            }
            match self.home.read_sensor(SensorKind::Brightness, sensor) {
                Ok(v) if v.is_finite() && v >= 0.0 => readings.push(v),
                Ok(v) => warn!(
                    target: "daemon",
                    "{}",
                    DeviceError::Read {
                        name: sensor.clone(),
                        reason: format!("invalid brightness {}", v),
                    }
                ),
                Err(e) => warn!(target: "daemon", "{}", e),
            }
        }
        self.state
            .brightness
            .update(now, &readings, &self.params.brightness);
    }

    /// One control cycle.
    pub fn cycle(&mut self) -> Vec<ShutterCommand> {
        if let Some(p) = self.watcher.poll(&self.paths.params_file) {
            self.apply_params(p);
        }
        let now = self.clock.now();
        let p = &self.params;
        let step = p.main_loop_sleep_time.round().max(1.0) as i64;
        let sun = SunState::compute(
            now,
            Observer {
                lat: p.latitude,
                lon: p.longitude,
            },
            step,
            solar::lookahead_count(p.lookahead_seconds, p.main_loop_sleep_time),
        );

        self.update_temperature(now);
        self.update_forecast(now);
        self.update_brightness(now);

        self.arbitrator.refresh(self.home.as_ref());
        self.ventilation.refresh(self.home.as_ref());

        let sun_is_up = self.twilight.update(
            now,
            sun.current.elevation,
            self.state.brightness.current,
            &self.params,
        );
        self.ventilation
            .reset_in_the_morning(sun_is_up, &mut self.arbitrator, self.home.as_ref());

        let lt = local_time(now);
        let temperature = self.state.temperature.condition(&self.params.temperature);
        let brightness = self.state.brightness.condition(now, &self.params.brightness);
        if brightness == BrightnessCondition::NoMeasurement {
            info!(target: "daemon", "no brightness measurement available, using normal");
        }

        let input = CycleInput {
            now,
            sun: &sun,
            sun_is_up,
            night: self.params.night.is_night(lt.weekday, lt.hour_f64()),
            temperature,
            brightness: brightness.or_normal(),
        };
        debug!(
            target: "daemon",
            "sun azimuth {:.1} elevation {:.1}",
            sun.current.azimuth,
            sun.current.elevation
        );
        self.controller.run_cycle(
            &self.params,
            &input,
            &self.arbitrator,
            self.clock.as_ref(),
        )
    }

    pub fn save(&self) {
        if let Err(e) = config::save_state(&self.paths, &self.state) {
            error!(target: "daemon", "saving state: {}", e);
        }
    }
}

/// Block SIGTERM/SIGINT and deliver them through a non-blocking signalfd.
fn setup_signalfd() -> Result<SignalFd> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGINT);
    mask.thread_block().map_err(io::Error::from)?;
    let fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
        .map_err(io::Error::from)?;
    Ok(fd)
}

fn signalled(fd: &mut SignalFd) -> bool {
    match fd.read_signal() {
        Ok(Some(info)) => {
            info!(target: "daemon", "received signal {}", info.ssi_signo);
            true
        }
        Ok(None) => false,
        Err(e) => {
            warn!(target: "daemon", "signalfd: {}", e);
            false
        }
    }
}

/// Connect to the backend, retrying with backoff.
fn connect(params: &Params, clock: &dyn Clock, dry_run: bool) -> Result<Box<dyn Home>> {
    if dry_run {
        info!(target: "daemon", "dry run: using a simulated home");
        return Ok(Box::new(SimulatedHome::from_params(params)));
    }
    let mut delay = params.lookup_backoff;
    let mut attempt = 0;
    loop {
        match device::connect(params) {
            Ok(home) => return Ok(home),
            Err(e) if attempt < params.lookup_retries => {
                warn!(target: "daemon", "connecting: {} (retry in {:.0} s)", e, delay);
                clock.sleep(delay);
                delay *= 2.0;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

pub fn run(paths: &Paths, dry_run: bool) -> Result<()> {
    // Blocked before the first device lookup
    let mut signal_fd = setup_signalfd()?;

    let mut watcher = ParamWatcher::new();
    let params = watcher.poll(&paths.params_file).unwrap_or_default();
    logging::set_level(params.output_level);

    let clock = crate::SystemClock;
    let home = connect(&params, &clock, dry_run)?;

    if let Err(e) = config::write_pid(paths) {
        warn!(target: "daemon", "failed to write PID file: {}", e);
    }

    let mut daemon = Daemon::new(paths.clone(), params, watcher, home, Box::new(clock));
    info!(target: "daemon", "started");

    'outer: loop {
        let commands = daemon.cycle();
        for c in commands.iter().filter(|c| !c.success) {
            debug!(target: "daemon", "write to {} failed this cycle", c.window);
        }
        daemon.save();

        let mut remaining = daemon.params().main_loop_sleep_time.round() as u64;
        while remaining > 0 {
            if signalled(&mut signal_fd) {
                break 'outer;
            }
            let slice = remaining.min(SLEEP_SLICE_SEC);
            std::thread::sleep(std::time::Duration::from_secs(slice));
            remaining -= slice;
        }
        if signalled(&mut signal_fd) {
            break;
        }
    }

    info!(target: "daemon", "shutting down");
    daemon.save();
    config::remove_pid(paths);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Params {
        Params {
            sun_twilight_threshold: -1.0,
            sunrise_decision_width: 3.0,
            sunrise_decision_interval: 900.0,
            day_brightness_threshold: 500.0,
            night_brightness_threshold: 300.0,
            utc_shift: 0.0,
            ..Params::default()
        }
    }

    const MORNING: i64 = 86400 * 20000 + 6 * 3600;
    const EVENING: i64 = 86400 * 20000 + 19 * 3600;

    #[test]
    fn elevation_decides_outside_the_band() {
        let p = params();
        let mut g = TwilightGate::new();
        assert!(g.update(MORNING, 10.0, None, &p));
        assert!(!g.update(MORNING, -10.0, Some(50000.0), &p));
    }

    #[test]
    fn brightness_decides_in_the_morning_band() {
        let p = params();
        let mut g = TwilightGate::new();
        assert!(!g.update(MORNING, -5.0, Some(1000.0), &p));
        assert!(!g.update(MORNING, 0.0, Some(100.0), &p));
        assert!(g.update(MORNING + 60, 0.5, Some(800.0), &p));
        // Held for the decision interval even if a cloud passes
        assert!(g.update(MORNING + 120, 0.6, Some(100.0), &p));
    }

    #[test]
    fn brightness_decides_in_the_evening_band() {
        let p = params();
        let mut g = TwilightGate::new();
        assert!(g.update(EVENING, 5.0, Some(1000.0), &p));
        assert!(g.update(EVENING + 60, 0.0, Some(400.0), &p));
        assert!(!g.update(EVENING + 120, -0.5, Some(200.0), &p));
    }

    #[test]
    fn reset_drops_the_hold() {
        let p = params();
        let mut g = TwilightGate::new();
        assert!(g.update(MORNING, 0.0, Some(800.0), &p));
        assert!(g.update(MORNING + 60, 0.0, Some(100.0), &p));
        g.reset();
        assert!(!g.update(MORNING + 120, 0.0, Some(100.0), &p));
    }
}
