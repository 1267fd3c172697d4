//! Hourly temperature forecast.
//!
//! One GET against an Open-Meteo style endpoint:
//!   {url}?latitude=..&longitude=..&hourly=temperature_2m&timeformat=unixtime&forecast_days=N
//!   -> hourly.time[i], hourly.temperature_2m[i]
//!
//! Failures never reach the caller: they are logged and yield an empty
//! series. When compiled without the "forecast" feature, fetching is a no-op.

use log::warn;
use serde::Deserialize;

pub trait ForecastProvider {
    /// `(unix timestamp, temperature)` pairs, empty on any failure.
    fn fetch(&self) -> Vec<(i64, f64)>;
}

/// Provider for installations without a forecast source
pub struct NoForecast;

impl ForecastProvider for NoForecast {
    fn fetch(&self) -> Vec<(i64, f64)> {
        Vec::new()
    }
}

#[derive(Debug, Deserialize)]
struct Hourly {
    time: Vec<i64>,
    temperature_2m: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct Reply {
    hourly: Hourly,
}

/// Pair up timestamps and temperatures, skipping gaps.
pub fn parse_hourly(body: &str) -> Result<Vec<(i64, f64)>, serde_json::Error> {
    let reply: Reply = serde_json::from_str(body)?;
    Ok(reply
        .hourly
        .time
        .into_iter()
        .zip(reply.hourly.temperature_2m)
        .filter_map(|(t, v)| Some((t, v?)))
        .collect())
}

pub struct HttpForecast {
    pub url: String,
    pub lat: f64,
    pub lon: f64,
    pub days: u32,
}

impl HttpForecast {
    pub fn new(url: impl Into<String>, lat: f64, lon: f64, days: u32) -> Self {
        Self {
            url: url.into(),
            lat,
            lon,
            days,
        }
    }

    fn request_url(&self) -> String {
        format!(
            "{}?latitude={:.4}&longitude={:.4}&hourly=temperature_2m&timeformat=unixtime&forecast_days={}",
            self.url,
            self.lat,
            self.lon,
            // Today plus the requested whole days
            self.days + 1
        )
    }
}

#[cfg(feature = "forecast")]
impl HttpForecast {
    fn fetch_inner(&self) -> Result<Vec<(i64, f64)>, Box<dyn std::error::Error>> {
        let body = ureq::get(&self.request_url())
            .timeout(std::time::Duration::from_secs(10))
            .set("User-Agent", concat!("shutterd/", env!("CARGO_PKG_VERSION")))
            .call()?
            .into_string()?;
        Ok(parse_hourly(&body)?)
    }
}

#[cfg(feature = "forecast")]
impl ForecastProvider for HttpForecast {
    fn fetch(&self) -> Vec<(i64, f64)> {
        match self.fetch_inner() {
            Ok(series) => series,
            Err(e) => {
                warn!(target: "forecast", "fetch failed: {}", e);
                Vec::new()
            }
        }
    }
}

// Non-forecast stub
#[cfg(not(feature = "forecast"))]
impl ForecastProvider for HttpForecast {
    fn fetch(&self) -> Vec<(i64, f64)> {
        warn!(target: "forecast", "built without forecast support, {} ignored", self.request_url());
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hourly_series_and_skips_gaps() {
        let body = r#"{
            "latitude": 50.7,
            "hourly": {
                "time": [1718960400, 1718964000, 1718967600],
                "temperature_2m": [18.5, null, 21.0]
            }
        }"#;
        let series = parse_hourly(body).unwrap();
        assert_eq!(series, vec![(1718960400, 18.5), (1718967600, 21.0)]);
    }

    #[test]
    fn malformed_reply_is_an_error() {
        assert!(parse_hourly(r#"{"daily": {}}"#).is_err());
    }

    #[test]
    fn request_asks_for_unixtime() {
        let f = HttpForecast::new("https://api.open-meteo.com/v1/forecast", 50.7, 7.9, 1);
        let url = f.request_url();
        assert!(url.contains("timeformat=unixtime"));
        assert!(url.contains("forecast_days=2"));
    }

    #[test]
    fn no_forecast_is_empty() {
        assert!(NoForecast.fetch().is_empty());
    }
}
