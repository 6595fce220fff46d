//! Home Assistant egress (C5): discovery payloads, availability/state
//! publishing, customisation policy, and task coordination.
//!
//! Grounded on
//! `examples/original_source/ha_wb_discovery/homeassistant.py`.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rumqttc::QoS;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::{qos_from_u8, HomeAssistantConfig};
use crate::mappers::{HassComponent, WirenControlType};
use crate::registry::{normalise, Registry};
use crate::router::Router;
use crate::taskslots::TaskSlots;

/// Capability consumed by the Wiren ingress (C4) to request deferred
/// publishes, decoupling it from HA egress's concrete type (spec.md §9).
pub trait HaPublisher: Send + Sync {
    fn publish_device_config(&self, device_id: &str);
    fn publish_control_config(&self, device_id: &str, control_id: &str);
    fn publish_availability(&self, device_id: &str, control_id: &str);
    fn publish_control_state(&self, device_id: &str, control_id: &str);
}

/// Capability consumed by HA egress's command handler to forward a decoded
/// command back to the Wiren broker (C6), again decoupling concrete types.
pub trait CommandSink: Send + Sync {
    fn on_control_set_state(&self, device_id: &str, control_id: &str, payload: &str);
}

#[derive(Debug, Clone)]
pub struct CombinedDevice {
    pub new_device_id: String,
    pub new_name: String,
}

fn default_combined_devices() -> Vec<(&'static str, &'static str)> {
    vec![
        ("wb_adc", "Wiren Board"),
        ("wbrules", "Wiren Board"),
        ("wb_gpio", "Wiren Board"),
        ("power_status", "Wiren Board"),
        ("network", "Wiren Board"),
        ("system", "Wiren Board"),
        ("hwmon", "Wiren Board"),
        ("buzzer", "Wiren Board"),
        ("alarms", "Wiren Board"),
        ("metrics", "Wiren Board"),
    ]
}

/// Customisation policy: ignore > split > combine (spec.md §9), immutable
/// after construction.
pub struct Customizer {
    ignored_device_ids: HashSet<String>,
    ignored_device_control_ids: HashSet<String>,
    splitted_device_ids: HashSet<String>,
    combined_devices: HashMap<String, CombinedDevice>,
}

impl Customizer {
    pub fn new(cfg: &HomeAssistantConfig) -> Self {
        let mut combined_devices = HashMap::new();
        for c in &cfg.combined_devices {
            combined_devices.insert(
                normalise(&c.device_id),
                CombinedDevice {
                    new_device_id: normalise(&c.new_device_id),
                    new_name: c.new_name.clone(),
                },
            );
        }
        if cfg.enable_default_combined_devices {
            for (device_id, new_name) in default_combined_devices() {
                combined_devices.insert(
                    device_id.to_string(),
                    CombinedDevice {
                        new_device_id: "wirenboard".to_string(),
                        new_name: new_name.to_string(),
                    },
                );
            }
        }
        Self {
            ignored_device_ids: cfg.ignored_device_ids.iter().map(|s| normalise(s)).collect(),
            ignored_device_control_ids: cfg
                .ignored_device_control_ids
                .iter()
                .map(|s| normalise(s))
                .collect(),
            splitted_device_ids: cfg.splitted_device_ids.iter().map(|s| normalise(s)).collect(),
            combined_devices,
        }
    }

    pub fn is_ignored_device(&self, device_unique_id: &str) -> bool {
        self.ignored_device_ids.contains(device_unique_id)
    }

    pub fn is_ignored_control(&self, entity_unique_id: &str) -> bool {
        self.ignored_device_control_ids.contains(entity_unique_id)
    }

    pub fn is_splitted_device(&self, device_unique_id: &str) -> bool {
        self.splitted_device_ids.contains(device_unique_id)
    }

    pub fn combined_device(&self, device_unique_id: &str) -> Option<&CombinedDevice> {
        self.combined_devices.get(device_unique_id)
    }
}

/// Capitalizes the first letter of each maximal alphabetic run, mirroring
/// Python's `str.title()`: a digit or space resets the "new word" state, so
/// `"mr6c"` titlecases to `"Mr6C"`.
pub fn title_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut prev_cased = false;
    for c in input.chars() {
        if c.is_alphabetic() {
            if prev_cased {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_cased = true;
        } else {
            out.push(c);
            prev_cased = false;
        }
    }
    out
}

#[derive(Debug, Clone, Serialize)]
pub struct HaDevice {
    pub name: String,
    pub identifiers: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hw_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryPayload {
    pub device: HaDevice,
    pub name: String,
    pub unique_id: String,
    pub availability_topic: String,
    pub payload_available: &'static str,
    pub payload_not_available: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_on: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_off: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_on: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_off: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
}

struct QosRetain {
    subscribe_qos: QoS,
    availability_qos: QoS,
    availability_retain: bool,
    config_qos: QoS,
    config_retain: bool,
    state_qos: QoS,
    state_retain: bool,
}

/// Home Assistant egress component (C5).
pub struct HomeAssistant {
    router: AsyncMutex<Router>,
    registry: std::sync::Arc<std::sync::Mutex<Registry>>,
    customizer: Customizer,
    task_slots: TaskSlots,
    command_sink: std::sync::Arc<dyn CommandSink>,

    ratelimiter: Mutex<HashMap<String, Instant>>,
    ratelimit_intervals: Mutex<HashMap<String, Duration>>,
    first_published_configs: Mutex<HashSet<String>>,

    config_first_publish_delay: Duration,
    config_publish_delay: Duration,
    qr: QosRetain,

    /// Self-reference so `&self` methods (required for `HaPublisher` to be
    /// object-safe as `Arc<dyn HaPublisher>`) can still spawn tasks that
    /// outlive the call and need their own `Arc` handle.
    self_weak: std::sync::Weak<HomeAssistant>,
}

fn control_topic(device_id: &str, control_id: &str) -> String {
    format!("/devices/{device_id}/controls/{control_id}")
}

impl HomeAssistant {
    pub fn new(
        router: Router,
        registry: std::sync::Arc<std::sync::Mutex<Registry>>,
        customizer: Customizer,
        command_sink: std::sync::Arc<dyn CommandSink>,
        cfg: &HomeAssistantConfig,
    ) -> std::sync::Arc<Self> {
        std::sync::Arc::new_cyclic(|weak| Self {
            router: AsyncMutex::new(router),
            registry,
            customizer,
            task_slots: TaskSlots::new(),
            command_sink,
            ratelimiter: Mutex::new(HashMap::new()),
            ratelimit_intervals: Mutex::new(HashMap::new()),
            first_published_configs: Mutex::new(HashSet::new()),
            config_first_publish_delay: Duration::from_secs(cfg.config_first_publish_delay),
            config_publish_delay: Duration::from_secs(cfg.config_publish_delay),
            qr: QosRetain {
                subscribe_qos: qos_from_u8(cfg.subscribe_qos),
                availability_qos: qos_from_u8(cfg.availability_qos),
                availability_retain: cfg.availability_retain,
                config_qos: qos_from_u8(cfg.config_qos),
                config_retain: cfg.config_retain,
                state_qos: qos_from_u8(cfg.state_qos),
                state_retain: cfg.state_retain,
            },
            self_weak: weak.clone(),
        })
    }

    fn arc_self(&self) -> std::sync::Arc<Self> {
        self.self_weak.upgrade().expect("HomeAssistant dropped while in use")
    }

    /// Installs the on-connect subscriptions and kicks an initial
    /// `publish_all_devices`.
    pub async fn on_connect(&self) -> anyhow::Result<()> {
        log::warn!("connected to MQTT (home assistant)");
        {
            let mut router = self.router.lock().await;
            let status_handler = {
                let this = self.arc_self();
                std::sync::Arc::new(move |_topic: &str, payload: &[u8]| {
                    this.handle_status(payload);
                })
            };
            router.subscribe("hass/status", self.qr.subscribe_qos, status_handler).await?;

            let command_handler = {
                let this = self.arc_self();
                std::sync::Arc::new(move |topic: &str, payload: &[u8]| {
                    this.handle_command(topic, payload);
                })
            };
            router
                .subscribe("/devices/+/controls/+/on", self.qr.subscribe_qos, command_handler)
                .await?;
        }
        self.publish_all_devices();
        Ok(())
    }

    /// Re-issues broker subscribes after a reconnect without re-registering
    /// handlers (spec.md §4.7), and re-triggers `publish_all_devices` since
    /// retained state may have been lost by the broker across the outage.
    pub async fn on_reconnect(&self) -> anyhow::Result<()> {
        self.router.lock().await.resubscribe_all(self.qr.subscribe_qos).await?;
        self.publish_all_devices();
        Ok(())
    }

    /// Dispatches one inbound message from the HA broker connection.
    pub async fn dispatch(&self, topic: &str, payload: &[u8]) {
        self.router.lock().await.dispatch(topic, payload);
    }

    /// Aborts every in-flight scheduled publish. Used by the supervisor
    /// (C7) on graceful stop; cancellations are expected, not errors.
    pub fn abort_all_tasks(&self) {
        self.task_slots.abort_all();
    }

    fn handle_status(&self, payload: &[u8]) {
        match payload {
            b"online" => {
                log::info!("home assistant changed status to online, pushing all devices");
                self.publish_all_devices();
            }
            b"offline" => log::info!("home assistant changed status to offline"),
            _ => {}
        }
    }

    fn handle_command(&self, topic: &str, payload: &[u8]) {
        let Some((device_id, control_id)) = parse_command_topic(topic) else {
            log::warn!("not matched topic={topic} for command pattern");
            return;
        };
        let payload = String::from_utf8_lossy(payload).to_string();
        self.command_sink.on_control_set_state(&device_id, &control_id, &payload);
    }

    fn publish_all_devices(&self) {
        let this = self.arc_self();
        self.task_slots.spawn("publish_all_devices", async move {
            let device_ids: Vec<String> = {
                let registry = this.registry.lock().expect("registry mutex poisoned");
                registry.devices().map(|d| d.device_id.clone()).collect()
            };
            for device_id in device_ids {
                this.publish_device_config(&device_id);
            }
        });
    }

    fn publish_device_config_inner(&self, device_id: &str) {
        let this = self.arc_self();
        let device_id = device_id.to_string();
        let delay = this.config_publish_delay;
        this.task_slots
            .spawn(format!("{device_id}_device_config"), async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let control_ids: Vec<String> = {
                    let registry = this.registry.lock().expect("registry mutex poisoned");
                    match registry.device(&device_id) {
                        Some(device) => device.controls().map(|c| c.control_id.clone()).collect(),
                        None => return,
                    }
                };
                for control_id in control_ids {
                    this.publish_control_config(&device_id, &control_id);
                }
            });
    }

    fn publish_control_config_inner(&self, device_id: &str, control_id: &str) {
        let device_unique_id = normalise(device_id);
        let entity_unique_id = normalise(&format!("{device_id}_{control_id}"));
        if self.customizer.is_ignored_device(&device_unique_id) {
            return;
        }
        if self.customizer.is_ignored_control(&entity_unique_id) {
            return;
        }

        let this = self.arc_self();
        let device_id = device_id.to_string();
        let control_id = control_id.to_string();
        let first_delay = this.config_first_publish_delay;
        this.task_slots
            .spawn(format!("{device_id}_{control_id}_config"), async move {
                let key = format!("{device_id}/{control_id}");
                let is_first = !this.first_published_configs.lock().expect("poisoned").contains(&key);
                if is_first {
                    if !first_delay.is_zero() {
                        tokio::time::sleep(first_delay).await;
                    }
                    this.first_published_configs.lock().expect("poisoned").insert(key);
                }
                this.publish_control_config_now(&device_id, &control_id).await;
                this.publish_availability_now(&device_id, &control_id).await;
                this.publish_control_state_now(&device_id, &control_id, false).await;
            });
    }

    async fn publish_control_config_now(&self, device_id: &str, control_id: &str) {
        let (device_name, manufacturer, model, hw_version, sw_version, serial_number, control_type, units) = {
            let registry = self.registry.lock().expect("registry mutex poisoned");
            let Some(device) = registry.device(device_id) else { return };
            let Some(control) = device.control(control_id) else { return };
            (
                device.display_name.clone(),
                device.manufacturer.clone(),
                device.model.clone(),
                device.hw_version.clone(),
                device.sw_version.clone(),
                device.serial_number.clone(),
                control.control_type,
                control.units.clone(),
            )
        };

        let Some(component) = crate::mappers::wiren_to_hass_type(
            control_type,
            self.read_only_of(device_id, control_id).await,
        ) else {
            return;
        };

        let mut device_unique_id = normalise(device_id);
        let mut device_name = device_name;
        let entity_unique_id = normalise(&format!("{device_id}_{control_id}"));
        let entity_name = title_case(&format!("{device_id} {control_id}").replace('_', " "));
        let object_id = normalise(control_id);

        if self.customizer.is_ignored_device(&device_unique_id) {
            return;
        }
        if self.customizer.is_ignored_control(&entity_unique_id) {
            return;
        }
        if self.customizer.is_splitted_device(&device_unique_id) {
            device_unique_id = entity_unique_id.clone();
            device_name = format!("{device_name} {}", title_case(&control_id.replace('_', " ")));
        }
        if let Some(combined) = self.customizer.combined_device(&device_unique_id) {
            device_unique_id = combined.new_device_id.clone();
            device_name = combined.new_name.clone();
        }

        let topic = control_topic(device_id, control_id);
        let availability_topic = format!("{topic}/availability");

        let mut payload = DiscoveryPayload {
            device: HaDevice {
                name: device_name,
                identifiers: device_unique_id.clone(),
                manufacturer,
                model,
                hw_version,
                sw_version,
                serial_number,
            },
            name: entity_name,
            unique_id: entity_unique_id,
            availability_topic,
            payload_available: "1",
            payload_not_available: "0",
            state_topic: None,
            command_topic: None,
            payload_on: None,
            payload_off: None,
            state_on: None,
            state_off: None,
            device_class: None,
            unit_of_measurement: None,
        };

        match component {
            HassComponent::Switch => {
                payload.state_topic = Some(topic.clone());
                payload.command_topic = Some(format!("{topic}/on"));
                payload.payload_on = Some("1");
                payload.payload_off = Some("0");
                payload.state_on = Some("1");
                payload.state_off = Some("0");
            }
            HassComponent::BinarySensor => {
                payload.state_topic = Some(topic.clone());
                payload.payload_on = Some("1");
                payload.payload_off = Some("0");
            }
            HassComponent::Sensor => {
                payload.state_topic = Some(topic.clone());
                if control_type == Some(WirenControlType::Temperature) {
                    payload.device_class = Some("temperature");
                }
                if let Some(units) = units {
                    payload.unit_of_measurement = Some(units);
                }
            }
            HassComponent::Button => {
                payload.command_topic = Some(format!("{topic}/on"));
            }
        }

        let discovery_topic = format!(
            "homeassistant/{}/{}/{}/config",
            component.as_str(),
            device_unique_id,
            object_id
        );
        log::info!("publish config of {device_id}/{control_id} to '{discovery_topic}'");

        let Ok(body) = serde_json::to_vec(&payload) else {
            log::warn!("failed to serialize discovery payload for {discovery_topic}");
            return;
        };
        let router = self.router.lock().await;
        if let Err(err) = router
            .publish(&discovery_topic, self.qr.config_qos, self.qr.config_retain, body)
            .await
        {
            log::warn!("failed to publish discovery config to {discovery_topic}: {err:#}");
        }
    }

    async fn read_only_of(&self, device_id: &str, control_id: &str) -> crate::mappers::TriState {
        let registry = self.registry.lock().expect("registry mutex poisoned");
        registry
            .device(device_id)
            .and_then(|d| d.control(control_id))
            .map(|c| c.read_only)
            .unwrap_or_default()
    }

    async fn publish_availability_now(&self, device_id: &str, control_id: &str) {
        let device_unique_id = normalise(device_id);
        let entity_unique_id = normalise(&format!("{device_id}_{control_id}"));
        if self.customizer.is_ignored_device(&device_unique_id) || self.customizer.is_ignored_control(&entity_unique_id) {
            return;
        }
        let payload = {
            let registry = self.registry.lock().expect("registry mutex poisoned");
            let Some(control) = registry.device(device_id).and_then(|d| d.control(control_id)) else {
                return;
            };
            control.availability_payload()
        };
        let topic = format!("{}/availability", control_topic(device_id, control_id));
        let router = self.router.lock().await;
        if let Err(err) = router
            .publish(&topic, self.qr.availability_qos, self.qr.availability_retain, payload)
            .await
        {
            log::warn!("failed to publish availability to {topic}: {err:#}");
        }
    }

    async fn publish_control_state_now(&self, device_id: &str, control_id: &str, rate_limited: bool) {
        let device_unique_id = normalise(device_id);
        let entity_unique_id = normalise(&format!("{device_id}_{control_id}"));
        if self.customizer.is_ignored_device(&device_unique_id) || self.customizer.is_ignored_control(&entity_unique_id) {
            return;
        }
        let ratelimit_key = format!("{device_id}/{control_id}");
        if rate_limited {
            let now = Instant::now();
            let last = self.ratelimiter.lock().expect("poisoned").get(&ratelimit_key).copied();
            let interval = self
                .ratelimit_intervals
                .lock()
                .expect("poisoned")
                .get(&ratelimit_key)
                .copied()
                .unwrap_or_default();
            if let Some(last) = last {
                if now < last + interval {
                    return;
                }
            }
        }
        let state = {
            let registry = self.registry.lock().expect("registry mutex poisoned");
            let Some(control) = registry.device(device_id).and_then(|d| d.control(control_id)) else {
                return;
            };
            match &control.last_state {
                Some(state) => state.clone(),
                None => return,
            }
        };
        let topic = control_topic(device_id, control_id);
        let router = self.router.lock().await;
        if let Err(err) = router
            .publish(&topic, self.qr.state_qos, self.qr.state_retain, state)
            .await
        {
            log::warn!("failed to publish state to {topic}: {err:#}");
            return;
        }
        drop(router);
        self.ratelimiter.lock().expect("poisoned").insert(ratelimit_key, Instant::now());
    }
}

impl HaPublisher for std::sync::Arc<HomeAssistant> {
    fn publish_device_config(&self, device_id: &str) {
        self.publish_device_config_inner(device_id);
    }

    fn publish_control_config(&self, device_id: &str, control_id: &str) {
        self.publish_control_config_inner(device_id, control_id);
    }

    fn publish_availability(&self, device_id: &str, control_id: &str) {
        let this = std::sync::Arc::clone(self);
        let device_id = device_id.to_string();
        let control_id = control_id.to_string();
        tokio::spawn(async move {
            this.publish_availability_now(&device_id, &control_id).await;
        });
    }

    fn publish_control_state(&self, device_id: &str, control_id: &str) {
        let this = std::sync::Arc::clone(self);
        let device_id = device_id.to_string();
        let control_id = control_id.to_string();
        self.task_slots
            .spawn(format!("publish_state_{device_id}_{control_id}"), async move {
                this.publish_control_state_now(&device_id, &control_id, true).await;
            });
    }
}

fn parse_command_topic(topic: &str) -> Option<(String, String)> {
    let rest = topic.strip_prefix("/devices/")?;
    let rest = rest.strip_suffix("/on")?;
    let (device_id, rest) = rest.split_once("/controls/")?;
    if device_id.is_empty() || rest.is_empty() {
        return None;
    }
    Some((device_id.to_string(), rest.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_case_matches_python_digit_boundary_quirk() {
        assert_eq!(title_case("wb mr6c 42 k1"), "Wb Mr6C 42 K1");
        assert_eq!(title_case("wiren board"), "Wiren Board");
    }

    #[test]
    fn parses_command_topic() {
        assert_eq!(
            parse_command_topic("/devices/wb-mr6c_42/controls/K1/on"),
            Some(("wb-mr6c_42".to_string(), "K1".to_string()))
        );
        assert_eq!(parse_command_topic("/devices/d1/meta/foo"), None);
    }

    #[test]
    fn customizer_precedence_split_then_combine() {
        let cfg = HomeAssistantConfig {
            broker_host: "h".into(),
            broker_port: 1,
            username: None,
            password: None,
            mqtt_client_id: "c".into(),
            subscribe_qos: 1,
            availability_qos: 1,
            config_qos: 1,
            state_qos: 1,
            availability_retain: true,
            config_retain: true,
            state_retain: true,
            config_first_publish_delay: 1,
            config_publish_delay: 0,
            ignored_device_ids: vec![],
            ignored_device_control_ids: vec![],
            splitted_device_ids: vec!["wb_mr6c_42".to_string()],
            combined_devices: vec![],
            enable_default_combined_devices: true,
        };
        let customizer = Customizer::new(&cfg);
        assert!(customizer.is_splitted_device("wb_mr6c_42"));
        assert!(customizer.combined_device("wb_adc").is_some());
        assert_eq!(customizer.combined_device("wb_adc").unwrap().new_device_id, "wirenboard");
    }
}
