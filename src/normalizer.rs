// src/normalizer.rs
//
// Pure conversion from raw Modbus register words to a validated Sample.
//
// Takes the raw map produced by the poller, applies type conversion
// (U16/S16/U32/S32), scaling, and range validation per the register
// catalog, and returns a Sample or None. No I/O, no clock, no mutable
// state: device_id and ts are injected by the caller, so the same inputs
// always produce the same output.

use chrono::{DateTime, Utc};

use crate::poller::RawMap;
use crate::registers::{self, RegType, RegisterDef};
use crate::sample::Sample;

// Sample field -> register name. Fixed and exhaustive; optional fields are
// the ones the device may simply not report (wire `null`).
const PV_POWER_REG: &str = "total_dc_power";
const PV_DAILY_REG: &str = "daily_pv_generation";
const BATTERY_POWER_REG: &str = "battery_power";
const BATTERY_SOC_REG: &str = "battery_soc";
const BATTERY_TEMP_REG: &str = "battery_temperature";
const LOAD_POWER_REG: &str = "load_power";
const EXPORT_POWER_REG: &str = "export_power";
const GRID_POWER_REG: &str = "grid_power";

/// Convert raw register words into a validated Sample.
///
/// Returns None when any required register is missing, any present value
/// fails range validation, or no export estimate can be derived. Optional
/// registers map absence to `None` on the sample.
pub fn normalize(raw: &RawMap, device_id: &str, ts: DateTime<Utc>) -> Option<Sample> {
    let pv_power_w = required_value(raw, PV_POWER_REG)?;
    let pv_daily_kwh = optional_value(raw, PV_DAILY_REG)?;
    let battery_power_w = required_value(raw, BATTERY_POWER_REG)?;
    let battery_soc_pct = required_value(raw, BATTERY_SOC_REG)?;
    let battery_temp_c = optional_value(raw, BATTERY_TEMP_REG)?;
    let load_power_w = required_value(raw, LOAD_POWER_REG)?;
    let export_power_w = export_value(raw)?;

    Some(Sample {
        device_id: device_id.to_string(),
        ts,
        pv_power_w,
        pv_daily_kwh,
        battery_power_w,
        battery_soc_pct,
        battery_temp_c,
        load_power_w,
        export_power_w,
        sample_count: 1,
    })
}

fn required_value(raw: &RawMap, name: &str) -> Option<f64> {
    let reg = match registers::lookup(name) {
        Some(reg) => reg,
        None => {
            tlog!("[normalizer] Register '{}' not found in catalog", name);
            return None;
        }
    };
    extract_value(reg, raw)
}

/// Optional register: absent -> Some(None); present but invalid -> None
/// (rejects the whole sample, "absent" is not a license for bad data).
fn optional_value(raw: &RawMap, name: &str) -> Option<Option<f64>> {
    let reg = match registers::lookup(name) {
        Some(reg) => reg,
        None => {
            tlog!("[normalizer] Register '{}' not found in catalog", name);
            return None;
        }
    };
    if !raw.contains_key(name) {
        return Some(None);
    }
    extract_value(reg, raw).map(Some)
}

/// Export power, with the grid-estimate fallback: when the optional export
/// group was skipped, derive export from grid_power with the sign flipped
/// (grid: positive = importing; export: positive = exporting).
fn export_value(raw: &RawMap) -> Option<f64> {
    if raw.contains_key(EXPORT_POWER_REG) {
        return required_value(raw, EXPORT_POWER_REG);
    }
    if raw.contains_key(GRID_POWER_REG) {
        let grid = required_value(raw, GRID_POWER_REG)?;
        tlog!("[normalizer] export_power absent, derived from -grid_power ({} W)", -grid);
        return Some(-grid);
    }
    tlog!("[normalizer] export_power and grid_power both absent, rejecting sample");
    None
}

// ============================================================================
// Register Extraction
// ============================================================================

/// Extract, type-convert, scale, and range-check a single register value.
fn extract_value(reg: &RegisterDef, raw: &RawMap) -> Option<f64> {
    let words = match raw.get(reg.name) {
        Some(words) => words,
        None => {
            tlog!("[normalizer] Register '{}': missing from raw map", reg.name);
            return None;
        }
    };
    if words.len() != reg.word_count as usize {
        tlog!(
            "[normalizer] Register '{}': expected {} word(s), got {}",
            reg.name,
            reg.word_count,
            words.len()
        );
        return None;
    }

    let raw_int: i64 = match reg.reg_type {
        RegType::U16 => words[0] as i64,
        RegType::S16 => words[0] as i16 as i64,
        RegType::U32 => (((words[0] as u32) << 16) | words[1] as u32) as i64,
        RegType::S32 => (((words[0] as u32) << 16) | words[1] as u32) as i32 as i64,
        RegType::Utf8 => {
            tlog!("[normalizer] Register '{}': UTF8 has no numeric value", reg.name);
            return None;
        }
    };

    let scaled = raw_int as f64 * reg.scale;

    if let Some((min, max)) = reg.valid_range {
        if !(min <= scaled && scaled <= max) {
            if let Some(retried) = low_word_fallback(reg, words, min, max) {
                return Some(retried);
            }
            tlog!(
                "[normalizer] Register '{}': scaled value {} (raw={}) outside valid range ({}, {})",
                reg.name,
                scaled,
                raw_int,
                min,
                max
            );
            return None;
        }
    }

    Some(scaled)
}

/// Firmware variant fallback for 32-bit registers. Some SH-series
/// firmwares populate only the low word with a signed 16-bit value and
/// leave the high word at 0x0000 or 0xFFFF, which pushes the assembled
/// 32-bit value out of range. Reinterpret the low word as S16 and accept
/// it when the result is in range.
fn low_word_fallback(reg: &RegisterDef, words: &[u16], min: f64, max: f64) -> Option<f64> {
    if !matches!(reg.reg_type, RegType::U32 | RegType::S32) {
        return None;
    }
    let (hi, lo) = (words[0], words[1]);
    if hi != 0x0000 && hi != 0xFFFF {
        return None;
    }
    let retried = (lo as i16 as i64) as f64 * reg.scale;
    if min <= retried && retried <= max {
        tlog!(
            "[normalizer] Register '{}': accepted low-word S16 fallback {} (hi=0x{:04X}, lo=0x{:04X})",
            reg.name,
            retried,
            hi,
            lo
        );
        return Some(retried);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 14, 12, 0, 0).unwrap()
    }

    /// A fully populated, in-range raw map.
    fn valid_raw() -> RawMap {
        let mut raw = RawMap::new();
        raw.insert("total_dc_power".to_string(), vec![0x0000, 3500]);
        raw.insert("daily_pv_generation".to_string(), vec![125]); // 12.5 kWh
        raw.insert("battery_power".to_string(), vec![(-1500i16) as u16]);
        raw.insert("battery_soc".to_string(), vec![750]); // 75.0 %
        raw.insert("battery_temperature".to_string(), vec![250]); // 25.0 C
        raw.insert("load_power".to_string(), vec![0x0000, 2000]);
        raw.insert("grid_power".to_string(), vec![0]);
        raw.insert("export_power".to_string(), vec![0x0000, 0x0000]);
        raw
    }

    #[test]
    fn test_normalize_happy_path() {
        let sample = normalize(&valid_raw(), "dev-1", ts()).expect("valid raw must normalize");
        assert_eq!(sample.device_id, "dev-1");
        assert_eq!(sample.ts, ts());
        assert_eq!(sample.pv_power_w, 3500.0);
        assert_eq!(sample.pv_daily_kwh, Some(12.5));
        assert_eq!(sample.battery_power_w, -1500.0);
        assert_eq!(sample.battery_soc_pct, 75.0);
        assert_eq!(sample.battery_temp_c, Some(25.0));
        assert_eq!(sample.load_power_w, 2000.0);
        assert_eq!(sample.export_power_w, 0.0);
        assert_eq!(sample.sample_count, 1);
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let raw = valid_raw();
        assert_eq!(normalize(&raw, "dev-1", ts()), normalize(&raw, "dev-1", ts()));
    }

    #[test]
    fn test_missing_required_register_rejects() {
        let mut raw = valid_raw();
        raw.remove("battery_power");
        assert!(normalize(&raw, "dev-1", ts()).is_none());
    }

    #[test]
    fn test_soc_out_of_range_rejects() {
        let mut raw = valid_raw();
        // 1100 * 0.1 = 110 % > 100
        raw.insert("battery_soc".to_string(), vec![1100]);
        assert!(normalize(&raw, "dev-1", ts()).is_none());
    }

    #[test]
    fn test_wrong_word_count_rejects() {
        let mut raw = valid_raw();
        raw.insert("total_dc_power".to_string(), vec![3500]); // U32 needs 2 words
        assert!(normalize(&raw, "dev-1", ts()).is_none());
    }

    #[test]
    fn test_optional_registers_absent_become_none() {
        let mut raw = valid_raw();
        raw.remove("daily_pv_generation");
        raw.remove("battery_temperature");
        let sample = normalize(&raw, "dev-1", ts()).expect("optional absence is fine");
        assert_eq!(sample.pv_daily_kwh, None);
        assert_eq!(sample.battery_temp_c, None);
    }

    #[test]
    fn test_optional_register_out_of_range_rejects() {
        let mut raw = valid_raw();
        // 2000 * 0.1 = 200 kWh > daily limit of 100
        raw.insert("daily_pv_generation".to_string(), vec![2000]);
        assert!(normalize(&raw, "dev-1", ts()).is_none());
    }

    #[test]
    fn test_export_fallback_from_grid_power() {
        let mut raw = valid_raw();
        raw.remove("export_power");
        // grid_power +400 W importing -> export -400 W
        raw.insert("grid_power".to_string(), vec![400]);
        let sample = normalize(&raw, "dev-1", ts()).unwrap();
        assert_eq!(sample.export_power_w, -400.0);
    }

    #[test]
    fn test_export_and_grid_both_absent_rejects() {
        let mut raw = valid_raw();
        raw.remove("export_power");
        raw.remove("grid_power");
        assert!(normalize(&raw, "dev-1", ts()).is_none());
    }

    #[test]
    fn test_signed_s16_conversion() {
        let mut raw = valid_raw();
        raw.insert("battery_power".to_string(), vec![0x8000]);
        // 0x8000 as S16 = -32768, outside -10000..10000
        assert!(normalize(&raw, "dev-1", ts()).is_none());
    }

    #[test]
    fn test_s32_assembly_high_low() {
        let mut raw = valid_raw();
        // (1 << 16) | 0x86A0 = 100000 > 50000 -> out of range, hi word not
        // 0x0000/0xFFFF so no fallback applies
        raw.insert("load_power".to_string(), vec![0x0001, 0x86A0]);
        assert!(normalize(&raw, "dev-1", ts()).is_none());
    }

    // ========================================================================
    // Firmware Low-Word Fallback Tests
    // ========================================================================

    #[test]
    fn test_low_word_fallback_accepted_for_export() {
        let mut raw = valid_raw();
        // Assembled S32 = 64302 W, out of range. hi == 0x0000 and the low
        // word as S16 is -1234 W, in range: fallback accepts it.
        raw.insert("export_power".to_string(), vec![0x0000, 0xFB2E]);
        let sample = normalize(&raw, "dev-1", ts()).unwrap();
        assert_eq!(sample.export_power_w, -1234.0);
    }

    #[test]
    fn test_low_word_fallback_accepted_with_ffff_high_word() {
        let mut raw = valid_raw();
        // Assembled S32 = -54512 W, out of range. hi == 0xFFFF and the low
        // word as S16 is +10000 W, in range: fallback accepts it.
        raw.insert("export_power".to_string(), vec![0xFFFF, 0x2710]);
        let sample = normalize(&raw, "dev-1", ts()).unwrap();
        assert_eq!(sample.export_power_w, 10000.0);
    }

    #[test]
    fn test_low_word_fallback_rejected_when_high_word_meaningful() {
        let mut raw = valid_raw();
        // hi = 0x0002 is neither 0x0000 nor 0xFFFF: no fallback
        raw.insert("export_power".to_string(), vec![0x0002, 0xFB2E]);
        assert!(normalize(&raw, "dev-1", ts()).is_none());
    }

    #[test]
    fn test_low_word_fallback_rejected_when_still_out_of_range() {
        let mut raw = valid_raw();
        // Assembled S32 = -30000 W, below the -20000 floor. The low word
        // as S16 is the same -30000: the fallback cannot save it either.
        raw.insert("load_power".to_string(), vec![0xFFFF, 0x8AD0]);
        assert!(normalize(&raw, "dev-1", ts()).is_none());
    }

    #[test]
    fn test_in_range_s32_does_not_trigger_fallback() {
        let mut raw = valid_raw();
        // hi=0xFFFF lo=0xFB2E -> S32 = -1234, in range: taken as-is
        raw.insert("load_power".to_string(), vec![0xFFFF, 0xFB2E]);
        let sample = normalize(&raw, "dev-1", ts()).unwrap();
        assert_eq!(sample.load_power_w, -1234.0);
    }
}
