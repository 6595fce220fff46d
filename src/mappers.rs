//! Wiren Board control type <-> Home Assistant entity kind mapping (C1).
//!
//! Pure, stateless translation table. Grounded on
//! `examples/original_source/wb_to_ha/mappers.py`.

use serde::{Deserialize, Serialize};

/// Wiren Board control types, per
/// <https://github.com/wirenboard/homeui/blob/master/conventions.md>.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WirenControlType {
    Switch,
    Alarm,
    Pushbutton,
    Range,
    Rgb,
    Text,
    Value,

    Temperature,
    RelHumidity,
    AtmosphericPressure,
    Rainfall,
    WindSpeed,
    Power,
    PowerConsumption,
    Voltage,
    WaterFlow,
    WaterConsumption,
    Resistance,
    Concentration,
    HeatPower,
    HeatEnergy,
    Current,
}

impl WirenControlType {
    /// Parses a Wiren `.../meta/type` payload. Returns `None` for anything
    /// outside the closed set (§6); callers log this once per distinct
    /// unseen literal.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "switch" => Self::Switch,
            "alarm" => Self::Alarm,
            "pushbutton" => Self::Pushbutton,
            "range" => Self::Range,
            "rgb" => Self::Rgb,
            "text" => Self::Text,
            "value" => Self::Value,
            "temperature" => Self::Temperature,
            "rel_humidity" => Self::RelHumidity,
            "atmospheric_pressure" => Self::AtmosphericPressure,
            "rainfall" => Self::Rainfall,
            "wind_speed" => Self::WindSpeed,
            "power" => Self::Power,
            "power_consumption" => Self::PowerConsumption,
            "voltage" => Self::Voltage,
            "water_flow" => Self::WaterFlow,
            "water_consumption" => Self::WaterConsumption,
            "resistance" => Self::Resistance,
            "concentration" => Self::Concentration,
            "heat_power" => Self::HeatPower,
            "heat_energy" => Self::HeatEnergy,
            "current" => Self::Current,
            _ => return None,
        })
    }

    /// Default unit of measurement for "special measurement" types. `None`
    /// for generic types (switch, alarm, pushbutton, range, rgb, text, value).
    pub fn default_unit(self) -> Option<&'static str> {
        Some(match self {
            Self::Temperature => "°C",
            Self::RelHumidity => "%",
            Self::AtmosphericPressure => "millibar",
            Self::Rainfall => "mm per hour",
            Self::WindSpeed => "m/s",
            Self::Power => "watt",
            Self::PowerConsumption => "kWh",
            Self::Voltage => "V",
            Self::WaterFlow => "m³/hour",
            Self::WaterConsumption => "m³",
            Self::Resistance => "Ohm",
            Self::Concentration => "ppm",
            Self::HeatPower => "Gcal/hour",
            Self::HeatEnergy => "Gcal",
            Self::Current => "A",
            _ => return None,
        })
    }
}

/// Home Assistant entity component kinds this bridge can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HassComponent {
    BinarySensor,
    Sensor,
    Switch,
    Button,
}

impl HassComponent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BinarySensor => "binary_sensor",
            Self::Sensor => "sensor",
            Self::Switch => "switch",
            Self::Button => "button",
        }
    }
}

/// Tri-state boolean: unknown until observed at least once, matching the
/// original's `bool | None`, but modeled as an explicit enum rather than an
/// optional bool per the design notes (spec.md §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriState {
    #[default]
    Unknown,
    True,
    False,
}

impl TriState {
    pub fn is_true(self) -> bool {
        matches!(self, Self::True)
    }

    pub fn is_unknown(self) -> bool {
        matches!(self, Self::Unknown)
    }

    /// Sets the value if changed, returning whether it changed.
    pub fn apply(&mut self, value: bool) -> bool {
        let new = if value { Self::True } else { Self::False };
        if *self == new {
            false
        } else {
            *self = new;
            true
        }
    }
}

/// Maps `(wiren_type, read_only)` to a Home Assistant component, per
/// spec.md §4.1. Returns `None` when the control is not yet typed, or when
/// the combination has no HA representation (`range` + writable).
pub fn wiren_to_hass_type(control_type: Option<WirenControlType>, read_only: TriState) -> Option<HassComponent> {
    let control_type = control_type?;
    match control_type {
        WirenControlType::Switch => Some(if read_only.is_true() {
            HassComponent::BinarySensor
        } else {
            HassComponent::Switch
        }),
        WirenControlType::Range => {
            if read_only.is_true() {
                Some(HassComponent::Sensor)
            } else {
                None
            }
        }
        WirenControlType::Alarm => Some(HassComponent::BinarySensor),
        WirenControlType::Pushbutton => Some(HassComponent::Button),
        WirenControlType::Rgb => None,
        WirenControlType::Text | WirenControlType::Value => Some(HassComponent::Sensor),
        WirenControlType::Temperature
        | WirenControlType::RelHumidity
        | WirenControlType::AtmosphericPressure
        | WirenControlType::Rainfall
        | WirenControlType::WindSpeed
        | WirenControlType::Power
        | WirenControlType::PowerConsumption
        | WirenControlType::Voltage
        | WirenControlType::WaterFlow
        | WirenControlType::WaterConsumption
        | WirenControlType::Resistance
        | WirenControlType::Concentration
        | WirenControlType::HeatPower
        | WirenControlType::HeatEnergy
        | WirenControlType::Current => Some(HassComponent::Sensor),
    }
}
