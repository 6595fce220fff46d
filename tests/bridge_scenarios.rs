//! End-to-end Wiren Board -> Home Assistant translation scenarios (spec.md §8,
//! S1-S7), driven entirely through in-memory MQTT transports
//! (`Router::new_in_memory`) so no real broker is required.
//!
//! Mirrors the construction dance in `supervisor.rs::wire`, but scoped down
//! to a single forwarding target since these tests never need the snapshot
//! shadow.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use wb_bridge::config::{CombinedDeviceConfig, HomeAssistantConfig, WirenboardConfig};
use wb_bridge::homeassistant::{CommandSink, Customizer, HaPublisher, HomeAssistant};
use wb_bridge::registry::Registry;
use wb_bridge::router::{CapturedMessages, Router};
use wb_bridge::wirenboard::Wirenboard;

fn wb_config() -> WirenboardConfig {
    WirenboardConfig {
        broker_host: "wirenboard.local".to_string(),
        broker_port: 1883,
        username: None,
        password: None,
        mqtt_client_id: "wb-bridge-wb".to_string(),
        subscribe_qos: 1,
        publish_qos: 1,
        publish_retain: false,
    }
}

fn ha_config(mutate: impl FnOnce(&mut HomeAssistantConfig)) -> HomeAssistantConfig {
    let mut cfg = HomeAssistantConfig {
        broker_host: "homeassistant.local".to_string(),
        broker_port: 1883,
        username: None,
        password: None,
        mqtt_client_id: "wb-bridge-ha".to_string(),
        subscribe_qos: 1,
        availability_qos: 1,
        config_qos: 1,
        state_qos: 1,
        availability_retain: true,
        config_retain: true,
        state_retain: true,
        // Zeroed so tests don't need to fast-forward a tokio clock: the
        // aggregation delay only trades latency for batching, not
        // correctness, so skipping it is observationally transparent here.
        config_first_publish_delay: 0,
        config_publish_delay: 0,
        ignored_device_ids: vec![],
        ignored_device_control_ids: vec![],
        splitted_device_ids: vec![],
        combined_devices: vec![],
        enable_default_combined_devices: true,
    };
    mutate(&mut cfg);
    cfg
}

/// Forwards to whichever `HaPublisher` is installed once the cycle
/// `Wirenboard <-> HomeAssistant` resolves, the same way
/// `supervisor.rs::ForwardingPublisher` breaks the construction-time cycle.
struct ForwardingPublisher {
    target: OnceLock<Arc<dyn HaPublisher>>,
}

impl HaPublisher for ForwardingPublisher {
    fn publish_device_config(&self, device_id: &str) {
        if let Some(t) = self.target.get() {
            t.publish_device_config(device_id);
        }
    }
    fn publish_control_config(&self, device_id: &str, control_id: &str) {
        if let Some(t) = self.target.get() {
            t.publish_control_config(device_id, control_id);
        }
    }
    fn publish_availability(&self, device_id: &str, control_id: &str) {
        if let Some(t) = self.target.get() {
            t.publish_availability(device_id, control_id);
        }
    }
    fn publish_control_state(&self, device_id: &str, control_id: &str) {
        if let Some(t) = self.target.get() {
            t.publish_control_state(device_id, control_id);
        }
    }
}

struct Harness {
    wb: Arc<Wirenboard>,
    hass: Arc<HomeAssistant>,
    wb_captured: CapturedMessages,
    ha_captured: CapturedMessages,
}

async fn build(ha_cfg: HomeAssistantConfig) -> Harness {
    let registry = Arc::new(Mutex::new(Registry::new()));
    let wb_captured: CapturedMessages = Arc::new(Mutex::new(HashMap::new()));
    let ha_captured: CapturedMessages = Arc::new(Mutex::new(HashMap::new()));

    let wb_router = Router::new_in_memory("wirenboard-test", Arc::clone(&wb_captured));
    let ha_router = Router::new_in_memory("homeassistant-test", Arc::clone(&ha_captured));

    let forwarding = Arc::new(ForwardingPublisher { target: OnceLock::new() });
    let wb = Arc::new(Wirenboard::new(
        wb_router,
        Arc::clone(&registry),
        forwarding.clone() as Arc<dyn HaPublisher>,
        &wb_config(),
    ));
    let command_sink: Arc<dyn CommandSink> = Arc::new(Arc::clone(&wb));

    let customizer = Customizer::new(&ha_cfg);
    let hass = HomeAssistant::new(ha_router, registry, customizer, command_sink, &ha_cfg);
    forwarding.target.set(Arc::new(Arc::clone(&hass)) as Arc<dyn HaPublisher>).ok();

    wb.on_connect().await.unwrap();
    hass.on_connect().await.unwrap();
    // `on_connect` kicks an initial `publish_all_devices` over an empty
    // registry; let it run to completion before the scenario starts so its
    // task slot doesn't race with the first real publish.
    settle().await;
    ha_captured.lock().unwrap().clear();

    Harness { wb, hass, wb_captured, ha_captured }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

async fn wb_feed(h: &Harness, topic: &str, payload: &str) {
    h.wb.dispatch(topic, payload.as_bytes()).await;
}

fn ha_get(h: &Harness, topic: &str) -> Option<String> {
    h.ha_captured.lock().unwrap().get(topic).cloned()
}

/// S1: switch discovery end to end.
#[tokio::test]
async fn s1_switch_discovery() {
    let h = build(ha_config(|_| {})).await;

    wb_feed(&h, "/devices/wb-mr6c_42/meta/name", "WB-MR6C_42").await;
    wb_feed(&h, "/devices/wb-mr6c_42/controls/K1/meta/type", "switch").await;
    wb_feed(&h, "/devices/wb-mr6c_42/controls/K1/meta/readonly", "0").await;
    wb_feed(&h, "/devices/wb-mr6c_42/controls/K1", "1").await;
    settle().await;

    let config = ha_get(&h, "homeassistant/switch/wb_mr6c_42/k1/config").expect("discovery config published");
    let parsed: serde_json::Value = serde_json::from_str(&config).unwrap();
    assert_eq!(parsed["unique_id"], "wb_mr6c_42_k1");
    assert_eq!(parsed["state_topic"], "/devices/wb-mr6c_42/controls/K1");
    assert_eq!(parsed["command_topic"], "/devices/wb-mr6c_42/controls/K1/on");
    assert_eq!(parsed["payload_on"], "1");
    assert_eq!(parsed["payload_off"], "0");
    assert_eq!(parsed["device"]["identifiers"], "wb_mr6c_42");

    assert_eq!(ha_get(&h, "/devices/wb-mr6c_42/controls/K1/availability").as_deref(), Some("1"));
    assert_eq!(ha_get(&h, "/devices/wb-mr6c_42/controls/K1").as_deref(), Some("1"));
}

/// S2: temperature sensor picks up the default unit and device class.
#[tokio::test]
async fn s2_temperature_sensor_default_unit() {
    let h = build(ha_config(|_| {})).await;

    wb_feed(&h, "/devices/wb-mr6c_42/controls/Temperature/meta/type", "temperature").await;
    settle().await;

    let config = ha_get(&h, "homeassistant/sensor/wb_mr6c_42/temperature/config").expect("sensor config published");
    let parsed: serde_json::Value = serde_json::from_str(&config).unwrap();
    assert_eq!(parsed["device_class"], "temperature");
    assert_eq!(parsed["unit_of_measurement"], "\u{b0}C");
}

/// S3: system state events enrich the parent device (not a control in their
/// own right), surfaced on the device block of an ordinary system control's
/// discovery payload — `system` combines into `wirenboard` by default.
#[tokio::test]
async fn s3_system_enrichment() {
    let h = build(ha_config(|_| {})).await;

    wb_feed(&h, "/devices/system/controls/Short SN", "1234").await;
    wb_feed(&h, "/devices/system/controls/HW Revision", "WB7").await;
    wb_feed(&h, "/devices/system/controls/Release name", "2.1.0").await;
    wb_feed(&h, "/devices/system/controls/Uptime/meta/type", "value").await;
    settle().await;

    let config = ha_get(&h, "homeassistant/sensor/wirenboard/uptime/config").expect("system control config published");
    let parsed: serde_json::Value = serde_json::from_str(&config).unwrap();
    assert_eq!(parsed["device"]["identifiers"], "wirenboard");
    assert_eq!(parsed["device"]["serial_number"], "1234");
    assert_eq!(parsed["device"]["hw_version"], "WB7");
    assert_eq!(parsed["device"]["model"], "WB7");
    assert_eq!(parsed["device"]["sw_version"], "2.1.0");
}

/// S4: a splitted device registers each control as its own HA device.
#[tokio::test]
async fn s4_splitted_device() {
    let h = build(ha_config(|c| c.splitted_device_ids = vec!["wb_mr6c_42".to_string()])).await;

    wb_feed(&h, "/devices/wb-mr6c_42/meta/name", "WB-MR6C_42").await;
    wb_feed(&h, "/devices/wb-mr6c_42/controls/K1/meta/type", "switch").await;
    settle().await;

    let config = ha_get(&h, "homeassistant/switch/wb_mr6c_42_k1/k1/config").expect("split device config published");
    let parsed: serde_json::Value = serde_json::from_str(&config).unwrap();
    assert_eq!(parsed["device"]["identifiers"], "wb_mr6c_42_k1");
    assert_eq!(parsed["device"]["name"], "Wiren Board WB-MR6C_42 K1");
}

/// S5: `wb_adc` collapses into the default `wirenboard` combined device.
#[tokio::test]
async fn s5_combined_default_device() {
    let h = build(ha_config(|_| {})).await;

    wb_feed(&h, "/devices/wb_adc/controls/A1/meta/type", "value").await;
    settle().await;

    let config = ha_get(&h, "homeassistant/sensor/wirenboard/a1/config").expect("combined device config published");
    let parsed: serde_json::Value = serde_json::from_str(&config).unwrap();
    assert_eq!(parsed["device"]["identifiers"], "wirenboard");
    assert_eq!(parsed["device"]["name"], "Wiren Board");
}

/// S5 variant: explicit user-supplied combined devices take the same path.
#[tokio::test]
async fn s5_combined_custom_device() {
    let h = build(ha_config(|c| {
        c.enable_default_combined_devices = false;
        c.combined_devices = vec![CombinedDeviceConfig {
            device_id: "boiler_room".to_string(),
            new_device_id: "heating".to_string(),
            new_name: "Heating".to_string(),
        }];
    }))
    .await;

    wb_feed(&h, "/devices/boiler_room/controls/Pump/meta/type", "switch").await;
    settle().await;

    let config = ha_get(&h, "homeassistant/switch/heating/pump/config").expect("custom combined device config");
    let parsed: serde_json::Value = serde_json::from_str(&config).unwrap();
    assert_eq!(parsed["device"]["identifiers"], "heating");
    assert_eq!(parsed["device"]["name"], "Heating");
}

/// S6: a command published on the HA broker round-trips to the Wiren `.../on`
/// topic with an identical payload.
#[tokio::test]
async fn s6_command_round_trip() {
    let h = build(ha_config(|_| {})).await;

    h.hass.dispatch("/devices/wb-mr6c_42/controls/K1/on", b"1").await;
    settle().await;

    assert_eq!(
        h.wb_captured.lock().unwrap().get("/devices/wb-mr6c_42/controls/K1/on").map(String::as_str),
        Some("1")
    );
}

/// S7: an unknown control type produces no discovery publish.
#[tokio::test]
async fn s7_unknown_type_yields_no_discovery() {
    let h = build(ha_config(|_| {})).await;

    wb_feed(&h, "/devices/d1/controls/K1/meta/type", "foo").await;
    settle().await;

    assert!(h.ha_captured.lock().unwrap().keys().all(|t| !t.starts_with("homeassistant/")));
}

/// Invariant 3: an ignored device id never appears on any HA topic.
#[tokio::test]
async fn ignored_device_never_appears_on_ha_broker() {
    let h = build(ha_config(|c| c.ignored_device_ids = vec!["wb_mr6c_42".to_string()])).await;

    wb_feed(&h, "/devices/wb-mr6c_42/controls/K1/meta/type", "switch").await;
    wb_feed(&h, "/devices/wb-mr6c_42/controls/K1", "1").await;
    settle().await;

    let captured = h.ha_captured.lock().unwrap();
    assert!(captured.keys().all(|t| !t.contains("wb_mr6c_42") && !t.contains("wb-mr6c_42")));
}

/// Invariant 6: two state events for one control within the rate-limit
/// window collapse to a single HA state publish; the newer value wins
/// because it is the one still queued when the slot's task runs.
#[tokio::test]
async fn rate_limit_collapses_rapid_state_updates() {
    let h = build(ha_config(|_| {})).await;

    wb_feed(&h, "/devices/d1/controls/K1/meta/type", "switch").await;
    settle().await;
    h.ha_captured.lock().unwrap().clear();

    wb_feed(&h, "/devices/d1/controls/K1", "1").await;
    wb_feed(&h, "/devices/d1/controls/K1", "0").await;
    settle().await;

    assert_eq!(ha_get(&h, "/devices/d1/controls/K1").as_deref(), Some("0"));
}
