// src/registers.rs
//
// Sungrow SH4.0RS Modbus TCP register map - single source of truth.
//
// Defines register addresses, data types, scaling factors, units, and valid
// value ranges for the Sungrow SH4.0RS hybrid inverter accessed via the
// WiNet-S Modbus TCP dongle (port 502, slave ID 1, function code 0x04
// input registers).
//
// Registers are organised into contiguous groups so the poller can issue
// one read_input_registers call per group. Addresses 13119+ (GoSungrow
// p-codes) are cloud API parameter IDs, not Modbus registers - the WiNet-S
// returns a Modbus error for them. Do not "fix" the 13008-13027 range.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Register data type. Determines word count and sign interpretation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegType {
    U16,
    S16,
    U32,
    S32,
    Utf8,
}

impl RegType {
    /// Words occupied by this type, None for Utf8 (explicit per register).
    pub fn default_word_count(self) -> Option<u16> {
        match self {
            RegType::U16 | RegType::S16 => Some(1),
            RegType::U32 | RegType::S32 => Some(2),
            RegType::Utf8 => None,
        }
    }
}

/// Definition of a single Modbus input register.
#[derive(Clone, Copy, Debug)]
pub struct RegisterDef {
    /// Modbus input register start address.
    pub address: u16,
    /// Unique identifier, used as the raw map key.
    pub name: &'static str,
    pub reg_type: RegType,
    /// Engineering unit string (e.g. "W", "kWh", "%").
    pub unit: &'static str,
    /// Multiplicative scaling factor raw -> engineering value.
    pub scale: f64,
    /// Inclusive (min, max) for the *scaled* value, None when not checked.
    pub valid_range: Option<(f64, f64)>,
    /// Number of 16-bit Modbus words this register occupies.
    pub word_count: u16,
}

/// A contiguous range of registers read in one Modbus call.
#[derive(Clone, Debug)]
pub struct RegisterGroup {
    pub name: &'static str,
    pub start_address: u16,
    /// Total number of 16-bit words to read.
    pub count: u16,
    pub registers: Vec<RegisterDef>,
}

/// Name of the optional export group. Some WiNet-S firmwares answer
/// "illegal data address" for it; the poller skips it and continues.
pub const EXPORT_GROUP: &str = "export";

/// Build a register definition, deriving word_count from the type.
fn reg(
    address: u16,
    name: &'static str,
    reg_type: RegType,
    unit: &'static str,
    scale: f64,
    valid_range: Option<(f64, f64)>,
) -> RegisterDef {
    let word_count = reg_type
        .default_word_count()
        .unwrap_or_else(|| panic!("Register '{}': word_count must be explicit for UTF8", name));
    RegisterDef {
        address,
        name,
        reg_type,
        unit,
        scale,
        valid_range,
        word_count,
    }
}

/// Build a UTF8 register definition with an explicit word count.
fn utf8_reg(address: u16, name: &'static str, word_count: u16) -> RegisterDef {
    RegisterDef {
        address,
        name,
        reg_type: RegType::Utf8,
        unit: "",
        scale: 1.0,
        valid_range: None,
        word_count,
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// All register groups in recommended read order.
pub static ALL_GROUPS: Lazy<Vec<RegisterGroup>> = Lazy::new(|| {
    vec![
        // Device info (4990-5000). Identifies the inverter; also a cheap
        // per-cycle liveness probe for the dongle.
        RegisterGroup {
            name: "device",
            start_address: 4990,
            count: 11, // 4990..5000 inclusive
            registers: vec![
                // Serial number: 10 ASCII chars in 10 words
                utf8_reg(4990, "serial_number", 10),
                reg(5000, "device_type_code", RegType::U16, "", 1.0, Some((0.0, 65535.0))),
            ],
        },
        // PV production (5004-5018)
        RegisterGroup {
            name: "pv",
            start_address: 5004,
            count: 15, // 5004..5018 inclusive
            registers: vec![
                reg(5004, "total_dc_power", RegType::U32, "W", 1.0, Some((0.0, 20000.0))),
                reg(5011, "daily_pv_generation", RegType::U16, "kWh", 0.1, Some((0.0, 100.0))),
                reg(5012, "mppt1_voltage", RegType::U16, "V", 0.1, Some((0.0, 600.0))),
                reg(5013, "mppt1_current", RegType::U16, "A", 0.1, Some((0.0, 20.0))),
                reg(5014, "mppt2_voltage", RegType::U16, "V", 0.1, Some((0.0, 600.0))),
                reg(5015, "mppt2_current", RegType::U16, "A", 0.1, Some((0.0, 20.0))),
                reg(5017, "total_pv_generation", RegType::U32, "kWh", 0.1, Some((0.0, 1_000_000.0))),
            ],
        },
        // Export / grid estimate (5083-5084). Optional - see EXPORT_GROUP.
        RegisterGroup {
            name: EXPORT_GROUP,
            start_address: 5083,
            count: 2, // one S32
            registers: vec![
                // Positive = exporting to grid, negative = importing
                reg(5083, "export_power", RegType::S32, "W", 1.0, Some((-20000.0, 20000.0))),
            ],
        },
        // Load / consumption (13008-13017)
        RegisterGroup {
            name: "load",
            start_address: 13008,
            count: 10, // 13008..13017 inclusive
            registers: vec![
                reg(13008, "load_power", RegType::S32, "W", 1.0, Some((-20000.0, 50000.0))),
                // Positive = importing, negative = exporting
                reg(13010, "grid_power", RegType::S16, "W", 1.0, Some((-20000.0, 20000.0))),
                reg(13017, "daily_direct_consumption", RegType::U16, "kWh", 0.1, Some((0.0, 200.0))),
            ],
        },
        // Battery (13022-13027)
        RegisterGroup {
            name: "battery",
            start_address: 13022,
            count: 6, // 13022..13027 inclusive
            registers: vec![
                // Positive = charging, negative = discharging
                reg(13022, "battery_power", RegType::S16, "W", 1.0, Some((-10000.0, 10000.0))),
                reg(13023, "battery_soc", RegType::U16, "%", 0.1, Some((0.0, 100.0))),
                reg(13024, "battery_temperature", RegType::U16, "C", 0.1, Some((-20.0, 60.0))),
                reg(13026, "daily_battery_discharge", RegType::U16, "kWh", 0.1, Some((0.0, 100.0))),
                reg(13027, "daily_battery_charge", RegType::U16, "kWh", 0.1, Some((0.0, 100.0))),
            ],
        },
    ]
});

/// Flat lookup of every register by name.
pub static REGISTERS_BY_NAME: Lazy<HashMap<&'static str, RegisterDef>> = Lazy::new(|| {
    ALL_GROUPS
        .iter()
        .flat_map(|g| g.registers.iter().copied())
        .map(|r| (r.name, r))
        .collect()
});

/// Look up a register definition by name.
pub fn lookup(name: &str) -> Option<&'static RegisterDef> {
    REGISTERS_BY_NAME.get(name)
}

/// All groups in read order.
pub fn groups() -> &'static [RegisterGroup] {
    &ALL_GROUPS
}

// ============================================================================
// Startup Validation
// ============================================================================

/// Validate the static catalog. A failure here is a deployment-stopping
/// defect: the process must refuse to start.
pub fn validate() -> Result<(), String> {
    validate_groups(&ALL_GROUPS)
}

fn validate_groups(groups: &[RegisterGroup]) -> Result<(), String> {
    let mut seen_addresses: HashMap<u16, &str> = HashMap::new();
    let mut seen_names: HashMap<&str, &str> = HashMap::new();

    for group in groups {
        for r in &group.registers {
            if let Some(other) = seen_addresses.insert(r.address, r.name) {
                return Err(format!(
                    "Duplicate register address {} ('{}' and '{}')",
                    r.address, other, r.name
                ));
            }
            if let Some(other_group) = seen_names.insert(r.name, group.name) {
                return Err(format!(
                    "Duplicate register name '{}' (groups '{}' and '{}')",
                    r.name, other_group, group.name
                ));
            }
            if r.scale == 0.0 {
                return Err(format!("Register '{}': scale must be non-zero", r.name));
            }
            if let Some((min, max)) = r.valid_range {
                if min >= max {
                    return Err(format!(
                        "Register '{}': valid_range min {} must be < max {}",
                        r.name, min, max
                    ));
                }
            }
            if let Some(expected) = r.reg_type.default_word_count() {
                if r.word_count != expected {
                    return Err(format!(
                        "Register '{}': word_count {} does not match type (expected {})",
                        r.name, r.word_count, expected
                    ));
                }
            } else if r.word_count == 0 {
                return Err(format!("Register '{}': UTF8 word_count must be > 0", r.name));
            }
            if r.address < group.start_address
                || r.address + r.word_count > group.start_address + group.count
            {
                return Err(format!(
                    "Register '{}' (address={}, words={}) outside group '{}' range {}..{}",
                    r.name,
                    r.address,
                    r.word_count,
                    group.name,
                    group.start_address,
                    group.start_address + group.count
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_validates() {
        validate().expect("static catalog must be valid");
    }

    #[test]
    fn test_addresses_and_names_unique() {
        let mut addresses = std::collections::HashSet::new();
        let mut names = std::collections::HashSet::new();
        for group in groups() {
            for r in &group.registers {
                assert!(addresses.insert(r.address), "duplicate address {}", r.address);
                assert!(names.insert(r.name), "duplicate name {}", r.name);
            }
        }
    }

    #[test]
    fn test_word_count_matches_type() {
        for group in groups() {
            for r in &group.registers {
                match r.reg_type {
                    RegType::U16 | RegType::S16 => assert_eq!(r.word_count, 1, "{}", r.name),
                    RegType::U32 | RegType::S32 => assert_eq!(r.word_count, 2, "{}", r.name),
                    RegType::Utf8 => assert!(r.word_count > 0, "{}", r.name),
                }
            }
        }
    }

    #[test]
    fn test_members_contained_in_group_bounds() {
        for group in groups() {
            for r in &group.registers {
                assert!(group.start_address <= r.address, "{}", r.name);
                assert!(
                    r.address + r.word_count <= group.start_address + group.count,
                    "{}",
                    r.name
                );
            }
        }
    }

    #[test]
    fn test_lookup() {
        let soc = lookup("battery_soc").expect("battery_soc present");
        assert_eq!(soc.address, 13023);
        assert_eq!(soc.scale, 0.1);
        assert!(lookup("nonexistent").is_none());
    }

    #[test]
    fn test_validate_rejects_out_of_bounds_member() {
        let bad = vec![RegisterGroup {
            name: "bad",
            start_address: 100,
            count: 2,
            registers: vec![reg(101, "straddles_end", RegType::U32, "W", 1.0, None)],
        }];
        assert!(validate_groups(&bad).is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let bad = vec![RegisterGroup {
            name: "bad",
            start_address: 0,
            count: 1,
            registers: vec![reg(0, "inverted", RegType::U16, "W", 1.0, Some((10.0, 5.0)))],
        }];
        assert!(validate_groups(&bad).is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_name() {
        let bad = vec![
            RegisterGroup {
                name: "a",
                start_address: 0,
                count: 1,
                registers: vec![reg(0, "dup", RegType::U16, "W", 1.0, None)],
            },
            RegisterGroup {
                name: "b",
                start_address: 10,
                count: 1,
                registers: vec![reg(10, "dup", RegType::U16, "W", 1.0, None)],
            },
        ];
        assert!(validate_groups(&bad).is_err());
    }
}
