//! NOAA sun position.
//!
//! Julian day -> Julian century -> geometric mean longitude/anomaly ->
//! equation of center -> apparent longitude -> declination -> hour angle
//! -> zenith and azimuth. Works on UTC epoch seconds throughout, so the
//! result does not depend on the host time zone.

use std::f64::consts::PI;

const SECONDS_PER_DAY: f64 = 86400.0;
const UNIX_EPOCH_JD: f64 = 2440587.5;
const J2000_JD: f64 = 2451545.0;

fn deg2rad(d: f64) -> f64 {
    d * PI / 180.0
}

fn rad2deg(r: f64) -> f64 {
    r * 180.0 / PI
}

/// Apparent sun position in degrees. Azimuth is measured clockwise from
/// north, elevation above the geometric horizon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SunPosition {
    pub azimuth: f64,
    pub elevation: f64,
}

/// Where the observer stands
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observer {
    pub lat: f64,
    pub lon: f64,
}

fn julian_day(epoch: i64) -> f64 {
    epoch as f64 / SECONDS_PER_DAY + UNIX_EPOCH_JD
}

/// Shared NOAA solar parameters from Julian century
struct SolarParams {
    sun_declin: f64, // solar declination (deg)
    eq_time: f64,    // equation of time (minutes)
}

fn compute_solar_params(jc: f64) -> SolarParams {
    let l0 = (280.46646 + jc * (36000.76983 + 0.0003032 * jc)) % 360.0;
    let m = 357.52911 + jc * (35999.05029 - 0.0001537 * jc);
    let m_rad = deg2rad(m);
    let e = 0.016708634 - jc * (0.000042037 + 0.0000001267 * jc);

    // Sun's equation of center
    let c = m_rad.sin() * (1.914602 - jc * (0.004817 + 0.000014 * jc))
        + (2.0 * m_rad).sin() * (0.019993 - 0.000101 * jc)
        + (3.0 * m_rad).sin() * 0.000289;

    // Sun's true and apparent longitude
    let sun_lon = l0 + c;
    let omega = 125.04 - 1934.136 * jc;
    let sun_apparent_lon = sun_lon - 0.00569 - 0.00478 * deg2rad(omega).sin();

    // Mean obliquity and correction
    let obliq_mean = 23.0
        + (26.0 + (21.448 - jc * (46.815 + jc * (0.00059 - jc * 0.001813))) / 60.0) / 60.0;
    let obliq_corr = obliq_mean + 0.00256 * deg2rad(omega).cos();
    let obliq_corr_rad = deg2rad(obliq_corr);

    let sun_declin =
        rad2deg((obliq_corr_rad.sin() * deg2rad(sun_apparent_lon).sin()).asin());

    let var_y = (obliq_corr_rad / 2.0).tan().powi(2);
    let eq_time = 4.0
        * rad2deg(
            var_y * (2.0 * deg2rad(l0)).sin()
                - 2.0 * e * m_rad.sin()
                + 4.0 * e * var_y * m_rad.sin() * (2.0 * deg2rad(l0)).cos()
                - 0.5 * var_y * var_y * (4.0 * deg2rad(l0)).sin()
                - 1.25 * e * e * (2.0 * m_rad).sin(),
        );

    SolarParams { sun_declin, eq_time }
}

/// Sun position at a given UTC epoch and location
pub fn position(when: i64, obs: Observer) -> SunPosition {
    let jd = julian_day(when);
    let jc = (jd - J2000_JD) / 36525.0;
    let sp = compute_solar_params(jc);

    // True solar time from UTC minutes of the day
    let utc_minutes = when.rem_euclid(86400) as f64 / 60.0;
    let tst = (utc_minutes + sp.eq_time + 4.0 * obs.lon).rem_euclid(1440.0);

    let mut hour_angle = tst / 4.0 - 180.0;
    if hour_angle < -180.0 {
        hour_angle += 360.0;
    }

    let lat_rad = deg2rad(obs.lat);
    let declin_rad = deg2rad(sp.sun_declin);
    let ha_rad = deg2rad(hour_angle);

    let cos_zenith =
        (lat_rad.sin() * declin_rad.sin() + lat_rad.cos() * declin_rad.cos() * ha_rad.cos())
            .clamp(-1.0, 1.0);
    let zenith_rad = cos_zenith.acos();
    let zenith = rad2deg(zenith_rad);

    let denom = lat_rad.cos() * zenith_rad.sin();
    let azimuth = if denom.abs() < 1e-12 {
        // Sun at the zenith or observer at a pole: azimuth is undefined.
        180.0
    } else {
        let cos_az = ((lat_rad.sin() * cos_zenith - declin_rad.sin()) / denom).clamp(-1.0, 1.0);
        let a = rad2deg(cos_az.acos());
        if hour_angle > 0.0 {
            (a + 180.0) % 360.0
        } else {
            (540.0 - a) % 360.0
        }
    };

    SunPosition {
        azimuth,
        elevation: 90.0 - zenith,
    }
}

/// Number of lookahead samples covering `lookahead_seconds` at one sample
/// per polling interval, plus one.
pub fn lookahead_count(lookahead_seconds: f64, polling_interval: f64) -> usize {
    if polling_interval <= 0.0 || lookahead_seconds <= 0.0 {
        return 1;
    }
    (lookahead_seconds / polling_interval).ceil() as usize + 1
}

#[derive(Debug, Clone)]
enum Lookahead {
    Ephemeris {
        observer: Observer,
        start: i64,
        step: i64,
        count: usize,
    },
    Fixed(Vec<SunPosition>),
}

/// Sun now plus its predicted track, regenerated every cycle.
#[derive(Debug, Clone)]
pub struct SunState {
    pub current: SunPosition,
    lookahead: Lookahead,
}

impl SunState {
    /// Compute the current position; lookahead samples are computed on demand
    /// at `now + k * step` for `k = 1..=count`.
    pub fn compute(now: i64, observer: Observer, step: i64, count: usize) -> Self {
        Self {
            current: position(now, observer),
            lookahead: Lookahead::Ephemeris {
                observer,
                start: now,
                step: step.max(1),
                count,
            },
        }
    }

    /// Fixed positions, for replaying recorded or synthetic tracks.
    pub fn fixed(current: SunPosition, lookahead: Vec<SunPosition>) -> Self {
        Self {
            current,
            lookahead: Lookahead::Fixed(lookahead),
        }
    }

    pub fn lookahead(&self) -> Box<dyn Iterator<Item = SunPosition> + '_> {
        match &self.lookahead {
            Lookahead::Ephemeris {
                observer,
                start,
                step,
                count,
            } => {
                let (observer, start, step) = (*observer, *start, *step);
                Box::new((1..=*count as i64).map(move |k| position(start + k * step, observer)))
            }
            Lookahead::Fixed(v) => Box::new(v.iter().copied()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BERLIN: Observer = Observer {
        lat: 52.52,
        lon: 13.40,
    };

    #[test]
    fn summer_noon_is_high_and_south() {
        // 2024-06-21 11:10 UTC, close to local solar noon in Berlin
        let sp = position(1718968200, BERLIN);
        assert!(sp.elevation > 58.0 && sp.elevation < 62.0, "{:?}", sp);
        assert!(sp.azimuth > 170.0 && sp.azimuth < 190.0, "{:?}", sp);
    }

    #[test]
    fn midnight_sun_is_below_horizon() {
        // 2024-12-21 23:00 UTC
        let sp = position(1734822000, BERLIN);
        assert!(sp.elevation < -50.0, "{:?}", sp);
    }

    #[test]
    fn morning_sun_is_east() {
        // 2024-03-20 07:00 UTC
        let sp = position(1710918000, BERLIN);
        assert!(sp.azimuth > 90.0 && sp.azimuth < 140.0, "{:?}", sp);
        assert!(sp.elevation > 0.0);
    }

    #[test]
    fn lookahead_count_rounds_up() {
        assert_eq!(lookahead_count(300.0, 120.0), 4);
        assert_eq!(lookahead_count(240.0, 120.0), 3);
        assert_eq!(lookahead_count(0.0, 120.0), 1);
    }

    #[test]
    fn ephemeris_lookahead_is_lazy_and_spaced() {
        let st = SunState::compute(1718968200, BERLIN, 120, 3);
        let track: Vec<_> = st.lookahead().collect();
        assert_eq!(track.len(), 3);
        assert_eq!(track[1], position(1718968200 + 240, BERLIN));
    }
}
