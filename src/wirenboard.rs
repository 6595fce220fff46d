//! Wiren Board ingress (C4) and reverse command path (C6).
//!
//! Grounded on `examples/original_source/wb_to_ha/wirenboard.py`. The
//! original hosts `on_control_set_state` (the reverse command path, C6)
//! directly on the `Wirenboard` class since both share the same outbound
//! Wiren MQTT connection; this keeps that shape, implementing
//! `CommandSink` here rather than as a separate component.

use std::collections::HashSet;
use std::sync::Mutex;

use rumqttc::QoS;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::{qos_from_u8, WirenboardConfig};
use crate::homeassistant::{CommandSink, HaPublisher};
use crate::mappers::WirenControlType;
use crate::registry::{normalise, Registry};
use crate::router::Router;

const KNOWN_SYSTEM_CONTROLS: [&str; 3] = ["hw_revision", "short_sn", "release_name"];

fn is_known_system_control(control_id: &str) -> bool {
    KNOWN_SYSTEM_CONTROLS.contains(&normalise(control_id).as_str())
}

/// Wiren Board ingress (C4): parses the three Wiren topic conventions and
/// mutates the registry. `hass` is injected at construction time rather than
/// set post-construction (spec.md §9's `HAPublisher` capability split),
/// breaking the original's construction-time cycle.
pub struct Wirenboard {
    router: AsyncMutex<Router>,
    registry: std::sync::Arc<std::sync::Mutex<Registry>>,
    hass: std::sync::Arc<dyn HaPublisher>,
    unknown_types: Mutex<HashSet<String>>,
    subscribe_qos: QoS,
    publish_qos: QoS,
    publish_retain: bool,
}

impl Wirenboard {
    pub fn new(
        router: Router,
        registry: std::sync::Arc<std::sync::Mutex<Registry>>,
        hass: std::sync::Arc<dyn HaPublisher>,
        cfg: &WirenboardConfig,
    ) -> Self {
        Self {
            router: AsyncMutex::new(router),
            registry,
            hass,
            unknown_types: Mutex::new(HashSet::new()),
            subscribe_qos: qos_from_u8(cfg.subscribe_qos),
            publish_qos: qos_from_u8(cfg.publish_qos),
            publish_retain: cfg.publish_retain,
        }
    }

    /// Installs the three Wiren subscriptions (spec.md §4.3). Handlers must
    /// not block (spec.md §5): they only touch the registry and hand off
    /// publication work to `hass`, which defers it into a task slot.
    pub async fn on_connect(self: &std::sync::Arc<Self>) -> anyhow::Result<()> {
        log::warn!("connected to MQTT (wirenboard)");
        let mut router = self.router.lock().await;

        let this = std::sync::Arc::clone(self);
        router
            .subscribe(
                "/devices/+/meta/+",
                self.subscribe_qos,
                std::sync::Arc::new(move |topic: &str, payload: &[u8]| this.handle_device_meta(topic, payload)),
            )
            .await?;

        let this = std::sync::Arc::clone(self);
        router
            .subscribe(
                "/devices/+/controls/+/meta/+",
                self.subscribe_qos,
                std::sync::Arc::new(move |topic: &str, payload: &[u8]| this.handle_control_meta(topic, payload)),
            )
            .await?;

        let this = std::sync::Arc::clone(self);
        router
            .subscribe(
                "/devices/+/controls/+",
                self.subscribe_qos,
                std::sync::Arc::new(move |topic: &str, payload: &[u8]| this.handle_control_state(topic, payload)),
            )
            .await?;

        Ok(())
    }

    /// Re-issues broker subscribes after a reconnect without re-registering
    /// handlers (spec.md §4.7).
    pub async fn on_reconnect(&self) -> anyhow::Result<()> {
        self.router.lock().await.resubscribe_all(self.subscribe_qos).await
    }

    /// Dispatches one inbound message from the Wiren broker connection.
    pub async fn dispatch(&self, topic: &str, payload: &[u8]) {
        self.router.lock().await.dispatch(topic, payload);
    }

    fn handle_device_meta(&self, topic: &str, payload: &[u8]) {
        let Some((device_id, meta_name)) = parse_device_meta_topic(topic) else {
            log::warn!("not matched topic={topic} for device meta pattern");
            return;
        };
        let value = String::from_utf8_lossy(payload).to_string();
        log::debug!("DEVICE META: {device_id} / {meta_name} ==> {value}");
        if meta_name != "name" {
            return;
        }
        let changed = {
            let mut registry = self.registry.lock().expect("registry mutex poisoned");
            registry.get_or_create_device(&device_id).apply_name(&value)
        };
        if changed {
            self.hass.publish_device_config(&device_id);
        }
    }

    fn handle_control_meta(&self, topic: &str, payload: &[u8]) {
        let Some((device_id, control_id, meta_name)) = parse_control_meta_topic(topic) else {
            log::warn!("not matched topic={topic} for control meta pattern");
            return;
        };
        let value = String::from_utf8_lossy(payload).to_string();
        log::debug!("CONTROL META: {device_id} / {control_id} / {meta_name} ==> {value}");

        // Wiren registers system information under the pseudo-device
        // `system`. State events (not meta) enrich the parent Device for
        // these controls instead of registering them as controls in their
        // own right (spec.md §4.3).
        if device_id == "system" && is_known_system_control(&control_id) {
            return;
        }

        if meta_name == "error" {
            let changed = {
                let mut registry = self.registry.lock().expect("registry mutex poisoned");
                registry
                    .get_or_create_device(&device_id)
                    .get_or_create_control(&control_id)
                    .apply_error_raw(&value)
            };
            if changed {
                self.hass.publish_availability(&device_id, &control_id);
            }
            return;
        }

        let mut has_changes = false;
        let mut default_unit = None;
        let mut unknown_type: Option<String> = None;
        {
            let mut registry = self.registry.lock().expect("registry mutex poisoned");
            let control = registry
                .get_or_create_device(&device_id)
                .get_or_create_control(&control_id);

            // Initial-assumption invariant: a control's error defaults to
            // false the first time any meta is observed for it.
            has_changes |= control.assume_no_error_if_unknown();

            match meta_name.as_str() {
                "order" => return,
                "type" => match WirenControlType::parse(&value) {
                    Some(parsed) => {
                        has_changes |= control.apply_type(Some(parsed));
                        if let Some(unit) = parsed.default_unit() {
                            default_unit = Some(unit);
                        }
                    }
                    None => unknown_type = Some(value.clone()),
                },
                "readonly" => has_changes |= control.apply_read_only(value == "1"),
                "units" => has_changes |= control.apply_units(Some(value.clone())),
                "max" => {
                    let max = if value.is_empty() { None } else { value.parse::<i64>().ok() };
                    has_changes |= control.apply_max(max);
                }
                _ => {}
            }
            if let Some(unit) = default_unit {
                has_changes |= control.apply_units(Some(unit.to_string()));
            }
        }

        if let Some(unseen) = unknown_type {
            let mut seen = self.unknown_types.lock().expect("poisoned");
            if seen.insert(unseen.clone()) {
                log::warn!("unknown type for wirenboard control={control_id}: \"{unseen}\"");
            }
            return;
        }

        if has_changes {
            self.hass.publish_control_config(&device_id, &control_id);
        }
    }

    fn handle_control_state(&self, topic: &str, payload: &[u8]) {
        let Some((device_id, control_id)) = parse_control_state_topic(topic) else {
            log::warn!("not matched topic={topic} for control state pattern");
            return;
        };
        let value = String::from_utf8_lossy(payload).to_string();

        if device_id == "system" && self.enrich_system_device(&device_id, &control_id, &value) {
            return;
        }

        if normalise(&control_id) == "serial" {
            {
                let mut registry = self.registry.lock().expect("registry mutex poisoned");
                registry.get_or_create_device(&device_id).apply_serial_number(&value);
            }
            self.hass.publish_device_config(&device_id);
            return;
        }

        {
            let mut registry = self.registry.lock().expect("registry mutex poisoned");
            registry
                .get_or_create_device(&device_id)
                .get_or_create_control(&control_id)
                .apply_last_state(&value);
        }
        self.hass.publish_control_state(&device_id, &control_id);
    }

    /// Enriches the `system` pseudo-device's parent `Device` fields from its
    /// well-known state controls (spec.md §4.3). Returns whether the control
    /// was one of the known system controls (and was therefore handled here
    /// rather than as an ordinary control).
    fn enrich_system_device(&self, device_id: &str, control_id: &str, value: &str) -> bool {
        if !is_known_system_control(control_id) {
            return false;
        }
        {
            let mut registry = self.registry.lock().expect("registry mutex poisoned");
            let device = registry.get_or_create_device(device_id);
            match normalise(control_id).as_str() {
                "hw_revision" => {
                    device.apply_hw_version(value);
                }
                "short_sn" => {
                    device.apply_serial_number(value);
                }
                "release_name" => {
                    device.apply_sw_version(value);
                }
                _ => return false,
            }
        }
        self.hass.publish_device_config(device_id);
        true
    }
}

impl CommandSink for std::sync::Arc<Wirenboard> {
    /// Publishes the decoded Home Assistant command payload verbatim to the
    /// Wiren `.../on` topic (spec.md §4.6). Published eagerly, without going
    /// through a task slot, so commands pass through with minimal latency
    /// (spec.md §5).
    fn on_control_set_state(&self, device_id: &str, control_id: &str, payload: &str) {
        let this = std::sync::Arc::clone(self);
        let topic = format!("/devices/{device_id}/controls/{control_id}/on");
        let payload = payload.to_string();
        tokio::spawn(async move {
            let router = this.router.lock().await;
            if let Err(err) = router.publish(&topic, this.publish_qos, this.publish_retain, payload).await {
                log::warn!("failed to forward command to {topic}: {err:#}");
            }
        });
    }
}

fn parse_device_meta_topic(topic: &str) -> Option<(String, String)> {
    let rest = topic.strip_prefix("/devices/")?;
    let (device_id, rest) = rest.split_once("/meta/")?;
    if device_id.is_empty() || rest.is_empty() {
        return None;
    }
    Some((device_id.to_string(), rest.to_string()))
}

fn parse_control_meta_topic(topic: &str) -> Option<(String, String, String)> {
    let rest = topic.strip_prefix("/devices/")?;
    let (device_id, rest) = rest.split_once("/controls/")?;
    let (control_id, meta_name) = rest.split_once("/meta/")?;
    if device_id.is_empty() || control_id.is_empty() || meta_name.is_empty() {
        return None;
    }
    Some((device_id.to_string(), control_id.to_string(), meta_name.to_string()))
}

fn parse_control_state_topic(topic: &str) -> Option<(String, String)> {
    let rest = topic.strip_prefix("/devices/")?;
    let (device_id, control_id) = rest.split_once("/controls/")?;
    if device_id.is_empty() || control_id.is_empty() || control_id.contains('/') {
        return None;
    }
    Some((device_id.to_string(), control_id.to_string()))
}
