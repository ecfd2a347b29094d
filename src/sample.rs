// src/sample.rs
//
// Normalized telemetry sample - the wire contract shared by the edge agent
// and the ingest service. One Sample is one engineering-unit snapshot of
// inverter state at an instant, keyed by (device_id, ts).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single normalized telemetry sample from a Sungrow hybrid inverter.
///
/// All values are in engineering units after scaling and type conversion.
/// `device_id` and `ts` are injected by the caller, not derived from
/// register data. Optional fields use `None` (wire `null`) when the
/// device did not report the underlying register; `None` is distinct
/// from a reported zero.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub device_id: String,
    /// Sample timestamp, always carried with an explicit UTC offset.
    pub ts: DateTime<Utc>,
    /// Current total DC power from PV panels, watts.
    pub pv_power_w: f64,
    /// PV energy generated today, kWh. None when the register was absent.
    #[serde(default)]
    pub pv_daily_kwh: Option<f64>,
    /// Battery power, watts. Positive = charging, negative = discharging.
    pub battery_power_w: f64,
    /// Battery state of charge, percent (0-100).
    pub battery_soc_pct: f64,
    /// Battery temperature, degrees Celsius. None when the register was absent.
    #[serde(default)]
    pub battery_temp_c: Option<f64>,
    /// Total house load consumption, watts.
    pub load_power_w: f64,
    /// Grid export power, watts. Positive = exporting, negative = importing.
    pub export_power_w: f64,
    /// Number of raw samples this row represents (>= 1, used by rollups).
    #[serde(default = "default_sample_count")]
    pub sample_count: i32,
}

fn default_sample_count() -> i32 {
    1
}
