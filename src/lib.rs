//! shutterd - window shutter control daemon
//!
//! Once per polling cycle the controller decides a position for every
//! motorized shutter from sun geometry, outside temperature and brightness,
//! per-window actuator calibration, remote activity flags, and detected
//! manual operation.

pub mod brightness;
pub mod calibration;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod device;
pub mod error;
pub mod forecast;
pub mod horizon;
pub mod logging;
pub mod manual;
pub mod overrides;
pub mod solar;
pub mod temperature;

use std::cell::Cell;
use std::time::Duration;

/// Longest single sleep of the main loop; signals are checked in between.
pub const SLEEP_SLICE_SEC: u64 = 1;

/// Refuse to read state files larger than this
pub const MAX_STATE_FILE_BYTES: u64 = 4 * 1024 * 1024;

// Time helpers

pub fn now_epoch() -> i64 {
    unsafe { libc::time(std::ptr::null_mut()) as i64 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalTime {
    pub year: i32,
    pub month: i32,
    pub day: i32,
    pub hour: i32,
    pub min: i32,
    pub sec: i32,
    /// Monday = 0 .. Sunday = 6
    pub weekday: u8,
}

impl LocalTime {
    /// Civil hour with fraction, e.g. 6.5 for 06:30
    pub fn hour_f64(&self) -> f64 {
        self.hour as f64 + self.min as f64 / 60.0 + self.sec as f64 / 3600.0
    }
}

pub fn local_time(epoch: i64) -> LocalTime {
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    let t = epoch as libc::time_t;
    unsafe { libc::localtime_r(&t, &mut tm) };
    LocalTime {
        year: tm.tm_year + 1900,
        month: tm.tm_mon + 1,
        day: tm.tm_mday,
        hour: tm.tm_hour,
        min: tm.tm_min,
        sec: tm.tm_sec,
        weekday: ((tm.tm_wday + 6) % 7) as u8,
    }
}

/// Epoch of the most recent local midnight at or before `epoch`.
pub fn local_midnight(epoch: i64) -> i64 {
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    let t = epoch as libc::time_t;
    unsafe { libc::localtime_r(&t, &mut tm) };
    tm.tm_hour = 0;
    tm.tm_min = 0;
    tm.tm_sec = 0;
    tm.tm_isdst = -1;
    let midnight = unsafe { libc::mktime(&mut tm) } as i64;
    if midnight < 0 {
        epoch - epoch.rem_euclid(86400)
    } else {
        midnight
    }
}

/// Hours since local mean-solar midnight, `utc_shift` = longitude / 15.
pub fn local_solar_hour(epoch: i64, utc_shift: f64) -> f64 {
    (epoch as f64 / 3600.0 + utc_shift).rem_euclid(24.0)
}

/// Source of time for the control loop.
pub trait Clock {
    fn now(&self) -> i64;
    fn sleep(&self, seconds: f64);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        now_epoch()
    }

    fn sleep(&self, seconds: f64) {
        if seconds > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(seconds));
        }
    }
}

/// Clock that only moves when slept on or advanced, for driving cycles
/// in tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<i64>,
    slept: Cell<f64>,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: Cell::new(start),
            slept: Cell::new(0.0),
        }
    }

    pub fn advance(&self, seconds: i64) {
        self.now.set(self.now.get() + seconds);
    }

    /// Total time spent in `sleep`
    pub fn slept(&self) -> f64 {
        self.slept.get()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.get()
    }

    fn sleep(&self, seconds: f64) {
        if seconds > 0.0 {
            self.slept.set(self.slept.get() + seconds);
            self.now.set(self.now.get() + seconds.round() as i64);
        }
    }
}

impl<C: Clock + ?Sized> Clock for std::rc::Rc<C> {
    fn now(&self) -> i64 {
        (**self).now()
    }

    fn sleep(&self, seconds: f64) {
        (**self).sleep(seconds)
    }
}
