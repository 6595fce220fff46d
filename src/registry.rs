//! Device registry (C2): incrementally materialised model of Wiren Board
//! devices and controls, mutated only from the Wiren ingress task.
//!
//! Grounded on `examples/original_source/ha_wb_discovery/wirenboard_registry.py`.

use std::collections::HashMap;

use crate::mappers::{TriState, WirenControlType};

/// One reading or actuator on one device.
#[derive(Debug, Clone)]
pub struct Control {
    pub control_id: String,
    pub device_id: String,
    pub control_type: Option<WirenControlType>,
    pub read_only: TriState,
    pub error: TriState,
    pub units: Option<String>,
    pub max: Option<i64>,
    pub last_state: Option<String>,
}

impl Control {
    fn new(device_id: &str, control_id: &str) -> Self {
        Self {
            control_id: control_id.to_string(),
            device_id: device_id.to_string(),
            control_type: None,
            read_only: TriState::Unknown,
            error: TriState::Unknown,
            units: None,
            max: None,
            last_state: None,
        }
    }

    /// Set-if-changed. Returns `true` if the type actually changed.
    pub fn apply_type(&mut self, value: Option<WirenControlType>) -> bool {
        if self.control_type == value {
            false
        } else {
            self.control_type = value;
            true
        }
    }

    pub fn apply_read_only(&mut self, value: bool) -> bool {
        self.read_only.apply(value)
    }

    /// Open Question (b): any non-empty string is truthy, including `"0"`.
    /// Preserved verbatim for bit-for-bit compatibility with the original.
    pub fn apply_error_raw(&mut self, raw: &str) -> bool {
        self.error.apply(!raw.is_empty())
    }

    pub fn apply_units(&mut self, value: Option<String>) -> bool {
        if self.units == value {
            false
        } else {
            self.units = value;
            true
        }
    }

    pub fn apply_max(&mut self, value: Option<i64>) -> bool {
        if self.max == value {
            false
        } else {
            self.max = value;
            true
        }
    }

    pub fn apply_last_state(&mut self, value: &str) -> bool {
        if self.last_state.as_deref() == Some(value) {
            false
        } else {
            self.last_state = Some(value.to_string());
            true
        }
    }

    /// Sets `error` to false if it has never been observed, per the
    /// initial-assumption invariant (spec.md §4.3). Returns whether this
    /// changed anything.
    pub fn assume_no_error_if_unknown(&mut self) -> bool {
        if self.error.is_unknown() {
            self.error.apply(false)
        } else {
            false
        }
    }

    pub fn availability_payload(&self) -> &'static str {
        if self.error.is_true() { "0" } else { "1" }
    }
}

/// One Wiren Board device and its controls.
#[derive(Debug, Clone)]
pub struct Device {
    pub device_id: String,
    pub display_name: String,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub hw_version: Option<String>,
    pub sw_version: Option<String>,
    pub serial_number: Option<String>,
    controls: HashMap<String, Control>,
}

impl Device {
    fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            // Defaults to the raw device id until the Wiren `name` meta
            // arrives (the original reads an unset attribute here, which
            // would raise; this falls back instead of panicking).
            display_name: device_id.to_string(),
            manufacturer: Some("Wiren Board".to_string()),
            model: None,
            hw_version: None,
            sw_version: None,
            serial_number: None,
            controls: HashMap::new(),
        }
    }

    /// Set-if-changed for the device meta `name` attribute.
    pub fn apply_name(&mut self, value: &str) -> bool {
        let new_name = format!("Wiren Board {value}");
        if self.display_name == new_name {
            false
        } else {
            self.display_name = new_name;
            true
        }
    }

    pub fn apply_hw_version(&mut self, value: &str) -> bool {
        let changed = self.hw_version.as_deref() != Some(value);
        self.hw_version = Some(value.to_string());
        self.model = Some(value.to_string());
        changed
    }

    pub fn apply_serial_number(&mut self, value: &str) -> bool {
        if self.serial_number.as_deref() == Some(value) {
            false
        } else {
            self.serial_number = Some(value.to_string());
            true
        }
    }

    pub fn apply_sw_version(&mut self, value: &str) -> bool {
        if self.sw_version.as_deref() == Some(value) {
            false
        } else {
            self.sw_version = Some(value.to_string());
            true
        }
    }

    pub fn get_or_create_control(&mut self, control_id: &str) -> &mut Control {
        let device_id = self.device_id.clone();
        self.controls
            .entry(control_id.to_string())
            .or_insert_with(|| Control::new(&device_id, control_id))
    }

    pub fn control(&self, control_id: &str) -> Option<&Control> {
        self.controls.get(control_id)
    }

    pub fn controls(&self) -> impl Iterator<Item = &Control> {
        self.controls.values()
    }
}

/// Process-scoped map `device_id -> Device`. Mutated only from the single
/// Wiren ingress task (spec.md §5); see `main.rs` for the `Arc<Mutex<_>>`
/// wrapper used to share read access with the snapshot HTTP surface.
#[derive(Debug, Default)]
pub struct Registry {
    devices: HashMap<String, Device>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create_device(&mut self, device_id: &str) -> &mut Device {
        self.devices
            .entry(device_id.to_string())
            .or_insert_with(|| Device::new(device_id))
    }

    pub fn device(&self, device_id: &str) -> Option<&Device> {
        self.devices.get(device_id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }
}

/// Lowercase, replace spaces and `-` with `_`. Grounded on
/// `wb_to_ha/mappers.py`'s `normalize_id`-equivalent helper used throughout
/// the original's `homeassistant.py`.
pub fn normalise(value: &str) -> String {
    value
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}
