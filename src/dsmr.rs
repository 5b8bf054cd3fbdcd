//! DSMR 5.0 fields published by the bridge, with Home Assistant metadata.

use crate::telegram::{RawReading, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Number,
    Text,
}

/// A recognized telegram field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// OBIS code, e.g. `1-0:1.8.1`.
    pub code: &'static str,
    /// Topic leaf and discovery object id.
    pub tag: &'static str,
    pub name: &'static str,
    pub unit: &'static str,
    pub kind: ValueKind,
}

const fn number(
    code: &'static str,
    tag: &'static str,
    name: &'static str,
    unit: &'static str,
) -> Field {
    Field {
        code,
        tag,
        name,
        unit,
        kind: ValueKind::Number,
    }
}

const fn text(code: &'static str, tag: &'static str, name: &'static str) -> Field {
    Field {
        code,
        tag,
        name,
        unit: "",
        kind: ValueKind::Text,
    }
}

pub const FIELDS: &[Field] = &[
    text("0-0:1.0.0", "timestamp", "Telegram timestamp"),
    number("1-0:1.8.1", "energy_consumed_t1", "Energy consumed tariff 1", "kWh"),
    number("1-0:1.8.2", "energy_consumed_t2", "Energy consumed tariff 2", "kWh"),
    number("1-0:1.8.3", "energy_consumed", "Energy consumed", "kWh"),
    number("1-0:2.8.1", "energy_returned_t1", "Energy returned tariff 1", "kWh"),
    number("1-0:2.8.2", "energy_returned_t2", "Energy returned tariff 2", "kWh"),
    number("1-0:2.8.3", "energy_returned", "Energy returned", "kWh"),
    number("0-0:96.14.0", "tariff", "Active tariff", ""),
    number("1-0:1.7.0", "power_consumed", "Power consumed", "kW"),
    number("1-0:2.7.0", "power_returned", "Power returned", "kW"),
    number("0-0:96.7.21", "power_failures", "Power failures", ""),
    number("0-0:96.7.9", "long_power_failures", "Long power failures", ""),
    number("1-0:32.32.0", "voltage_sags_l1", "Voltage sags L1", ""),
    number("1-0:52.32.0", "voltage_sags_l2", "Voltage sags L2", ""),
    number("1-0:72.32.0", "voltage_sags_l3", "Voltage sags L3", ""),
    number("1-0:32.36.0", "voltage_swells_l1", "Voltage swells L1", ""),
    number("1-0:52.36.0", "voltage_swells_l2", "Voltage swells L2", ""),
    number("1-0:72.36.0", "voltage_swells_l3", "Voltage swells L3", ""),
    number("1-0:32.7.0", "voltage_l1", "Voltage L1", "V"),
    number("1-0:52.7.0", "voltage_l2", "Voltage L2", "V"),
    number("1-0:72.7.0", "voltage_l3", "Voltage L3", "V"),
    number("1-0:31.7.0", "current_l1", "Current L1", "A"),
    number("1-0:51.7.0", "current_l2", "Current L2", "A"),
    number("1-0:71.7.0", "current_l3", "Current L3", "A"),
    number("1-0:21.7.0", "power_consumed_l1", "Power consumed L1", "kW"),
    number("1-0:41.7.0", "power_consumed_l2", "Power consumed L2", "kW"),
    number("1-0:61.7.0", "power_consumed_l3", "Power consumed L3", "kW"),
    number("1-0:22.7.0", "power_returned_l1", "Power returned L1", "kW"),
    number("1-0:42.7.0", "power_returned_l2", "Power returned L2", "kW"),
    number("1-0:62.7.0", "power_returned_l3", "Power returned L3", "kW"),
    number("0-1:24.2.1", "gas_consumed", "Gas consumed", "m3"),
];

pub fn lookup(code: &str) -> Option<&'static Field> {
    FIELDS.iter().find(|field| field.code == code)
}

impl Field {
    /// Decodes the reading's value; `None` for a malformed number.
    pub fn decode(&self, reading: &RawReading<'_>) -> Option<Value> {
        match self.kind {
            ValueKind::Number => Value::number(reading.value),
            ValueKind::Text => Some(Value::text(reading.value)),
        }
    }

    pub fn classification(&self) -> Option<Classification> {
        Classification::from_unit(self.unit)
    }
}

/// Home Assistant sensor metadata derived from a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub device_class: &'static str,
    pub state_class: &'static str,
    pub unit: &'static str,
}

impl Classification {
    pub fn from_unit(unit: &str) -> Option<Self> {
        let (device_class, state_class, unit) = match unit {
            "Wh" => ("energy", "total", "Wh"),
            "kWh" => ("energy", "total", "kWh"),
            "MWh" => ("energy", "total", "MWh"),
            "W" => ("power", "measurement", "W"),
            "kW" => ("power", "measurement", "kW"),
            "V" => ("voltage", "measurement", "V"),
            "A" => ("current", "measurement", "A"),
            "m3" | "m³" => ("gas", "total", "m³"),
            _ => return None,
        };
        Some(Self {
            device_class,
            state_class,
            unit,
        })
    }
}
