//! Supervisor (C7): owns both MQTT client connections, drives reconnection
//! with backoff, and wires the Wiren ingress (C4) and HA egress (C5)
//! together through the `HaPublisher`/`CommandSink` capability split
//! (spec.md §9). Grounded on `examples/original_source/ha_wb_discovery/app.py`
//! (`App.run`/`App._connect_mqtt`/`App.stop`), mapped onto tokio the way
//! `examples/dank0i-pc-bridge/src/main.rs` uses a `broadcast` shutdown
//! channel for its own run loop.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, Packet};
use tokio::sync::broadcast;

use crate::config::Config;
use crate::homeassistant::{CommandSink, Customizer, HaPublisher, HomeAssistant};
use crate::mqtt;
use crate::registry::Registry;
use crate::router::{CapturedMessages, Router};
use crate::wirenboard::Wirenboard;

pub struct Supervisor {
    wb: Arc<Wirenboard>,
    hass: Arc<HomeAssistant>,
    registry: Arc<StdMutex<Registry>>,

    wb_client: AsyncClient,
    ha_client: AsyncClient,
    wb_eventloop: StdMutex<Option<EventLoop>>,
    ha_eventloop: StdMutex<Option<EventLoop>>,

    /// Mirrors every discovery/availability/state publish the live HA
    /// egress makes into an in-memory map, the way
    /// `examples/original_source/wb-to-ha-yaml.py` runs a second
    /// `HomeAssistant`-equivalent against an `InmemMQTTClient` purely to
    /// feed the config snapshot HTTP route (§4.9). Populated regardless of
    /// whether the `api` feature is compiled in, since it costs one extra
    /// in-memory publish per discovery message.
    ha_snapshot: CapturedMessages,

    stop_tx: broadcast::Sender<()>,
}

impl Supervisor {
    /// Assembles both broker connections and wires C4/C5/C6 together. The
    /// `HomeAssistant -> CommandSink` and `Wirenboard -> HaPublisher` edges
    /// replace the original's post-construction `hass`/`on_control_set_state`
    /// setters with constructor injection.
    pub fn build(cfg: &Config) -> Result<Arc<Self>> {
        let registry = Arc::new(StdMutex::new(Registry::new()));

        let (wb_client, wb_eventloop) = mqtt::build_client(
            &cfg.wirenboard.mqtt_client_id,
            &cfg.wirenboard.broker_host,
            cfg.wirenboard.broker_port,
            cfg.wirenboard.username.as_deref(),
            cfg.wirenboard.password.as_deref(),
        );
        let (ha_client, ha_eventloop) = mqtt::build_client(
            &cfg.homeassistant.mqtt_client_id,
            &cfg.homeassistant.broker_host,
            cfg.homeassistant.broker_port,
            cfg.homeassistant.username.as_deref(),
            cfg.homeassistant.password.as_deref(),
        );

        let wb_router = Router::new(wb_client.clone(), "wirenboard");
        let ha_router = Router::new(ha_client.clone(), "homeassistant");

        let customizer = Customizer::new(&cfg.homeassistant);

        let ha_snapshot: CapturedMessages = Arc::new(StdMutex::new(std::collections::HashMap::new()));

        // `HomeAssistant` needs a `CommandSink` at construction, `Wirenboard`
        // needs a `HaPublisher`; since each depends on the other, `wire()`
        // builds `Wirenboard` first against a forwarding `HaPublisher` and
        // resolves it to the real one once `HomeAssistant` exists.
        let (wb, hass) = Self::wire(
            wb_router,
            ha_router,
            Arc::clone(&registry),
            customizer,
            cfg,
            Arc::clone(&ha_snapshot),
        );

        let (stop_tx, _) = broadcast::channel(1);

        Ok(Arc::new(Self {
            wb,
            hass,
            registry,
            wb_client,
            ha_client,
            wb_eventloop: StdMutex::new(Some(wb_eventloop)),
            ha_eventloop: StdMutex::new(Some(ha_eventloop)),
            ha_snapshot,
            stop_tx,
        }))
    }

    /// Wires `Wirenboard` and `HomeAssistant` to each other. `Wirenboard`
    /// is `CommandSink` consumed by `HomeAssistant`; `HomeAssistant` is
    /// `HaPublisher` consumed by `Wirenboard`. Since each needs the other at
    /// construction, `Wirenboard` is built first against a forwarding
    /// `HaPublisher` backed by an `OnceLock`, resolved once `HomeAssistant`
    /// (and the in-memory snapshot shadow alongside it) exist.
    fn wire(
        wb_router: Router,
        ha_router: Router,
        registry: Arc<StdMutex<Registry>>,
        customizer: Customizer,
        cfg: &Config,
        ha_snapshot: CapturedMessages,
    ) -> (Arc<Wirenboard>, Arc<HomeAssistant>) {
        let publisher_slot: Arc<std::sync::OnceLock<Vec<Arc<dyn HaPublisher>>>> =
            Arc::new(std::sync::OnceLock::new());
        let forwarding_publisher = ForwardingPublisher {
            slot: Arc::clone(&publisher_slot),
        };
        let wb = Arc::new(Wirenboard::new(
            wb_router,
            Arc::clone(&registry),
            Arc::new(forwarding_publisher),
            &cfg.wirenboard,
        ));
        // `CommandSink` is implemented for `Arc<Wirenboard>` itself (it needs
        // a cloneable handle to spawn with), so the trait object is built
        // over that smart pointer rather than over `Wirenboard` directly.
        let command_sink: Arc<dyn CommandSink> = Arc::new(Arc::clone(&wb));
        let hass = HomeAssistant::new(
            ha_router,
            Arc::clone(&registry),
            customizer,
            Arc::clone(&command_sink),
            &cfg.homeassistant,
        );

        // The snapshot shadow never receives a live connection, so its
        // command sink is unreachable in practice; it still needs one
        // since `HomeAssistant::new` requires a `CommandSink`.
        let snapshot_customizer = Customizer::new(&cfg.homeassistant);
        let snapshot_router = Router::new_in_memory("homeassistant-snapshot", ha_snapshot);
        let snapshot_hass = HomeAssistant::new(
            snapshot_router,
            registry,
            snapshot_customizer,
            command_sink,
            &cfg.homeassistant,
        );

        let live: Arc<dyn HaPublisher> = Arc::new(Arc::clone(&hass));
        let shadow: Arc<dyn HaPublisher> = Arc::new(snapshot_hass);
        let _ = publisher_slot.set(vec![live, shadow]);
        (wb, hass)
    }

    /// Runs both broker connections until `stop()` is called or a fatal
    /// transport error occurs on either side.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let wb_eventloop = self
            .wb_eventloop
            .lock()
            .expect("poisoned")
            .take()
            .context("supervisor already running")?;
        let ha_eventloop = self
            .ha_eventloop
            .lock()
            .expect("poisoned")
            .take()
            .context("supervisor already running")?;

        let this_wb = Arc::clone(self);
        let wb_task = tokio::spawn(async move {
            let wb = Arc::clone(&this_wb.wb);
            let wb_connect = Arc::clone(&wb);
            let wb_reconnect = Arc::clone(&wb);
            let wb_dispatch = Arc::clone(&wb);
            run_connection(
                "wirenboard",
                wb_eventloop,
                this_wb.stop_tx.subscribe(),
                move || {
                    let wb = Arc::clone(&wb_connect);
                    async move { wb.on_connect().await }
                },
                move || {
                    let wb = Arc::clone(&wb_reconnect);
                    async move { wb.on_reconnect().await }
                },
                move |topic, payload| {
                    let wb = Arc::clone(&wb_dispatch);
                    async move { wb.dispatch(&topic, &payload).await }
                },
            )
            .await
        });

        let this_ha = Arc::clone(self);
        let ha_task = tokio::spawn(async move {
            let hass = Arc::clone(&this_ha.hass);
            let hass_connect = Arc::clone(&hass);
            let hass_reconnect = Arc::clone(&hass);
            let hass_dispatch = Arc::clone(&hass);
            run_connection(
                "homeassistant",
                ha_eventloop,
                this_ha.stop_tx.subscribe(),
                move || {
                    let hass = Arc::clone(&hass_connect);
                    async move { hass.on_connect().await }
                },
                move || {
                    let hass = Arc::clone(&hass_reconnect);
                    async move { hass.on_reconnect().await }
                },
                move |topic, payload| {
                    let hass = Arc::clone(&hass_dispatch);
                    async move { hass.dispatch(&topic, &payload).await }
                },
            )
            .await
        });

        let (wb_result, ha_result) = tokio::join!(wb_task, ha_task);
        wb_result.context("wirenboard connection task panicked")??;
        ha_result.context("homeassistant connection task panicked")??;
        Ok(())
    }

    /// Signals both connection loops to stop, disconnects both clients, and
    /// drains in-flight scheduled tasks. Cancellations raised during drain
    /// are expected, not errors (spec.md §4.7, §5).
    pub async fn stop(&self) {
        log::info!("stopping supervisor");
        let _ = self.stop_tx.send(());
        let _ = self.wb_client.disconnect().await;
        let _ = self.ha_client.disconnect().await;
        self.hass.abort_all_tasks();
    }

    /// Exposes the registry for read-only diagnostic use (e.g. a future
    /// `/health` route); not read by the config snapshot renderer, which
    /// operates on captured MQTT messages instead (spec.md §4.8).
    pub fn registry(&self) -> Arc<StdMutex<Registry>> {
        Arc::clone(&self.registry)
    }

    /// The in-memory mirror of every message the live HA egress has
    /// published so far, consumed by the `api` feature's snapshot route.
    pub fn ha_captured_messages(&self) -> CapturedMessages {
        Arc::clone(&self.ha_snapshot)
    }
}

/// Forwards to every `HaPublisher` installed into the slot once
/// constructed (the live egress plus the in-memory snapshot shadow).
/// Exists only for the single construction-time tick between building
/// `Wirenboard` and those publishers; every call after `wire()` returns
/// sees the slot populated.
struct ForwardingPublisher {
    slot: Arc<std::sync::OnceLock<Vec<Arc<dyn HaPublisher>>>>,
}

impl HaPublisher for ForwardingPublisher {
    fn publish_device_config(&self, device_id: &str) {
        if let Some(targets) = self.slot.get() {
            for target in targets {
                target.publish_device_config(device_id);
            }
        }
    }

    fn publish_control_config(&self, device_id: &str, control_id: &str) {
        if let Some(targets) = self.slot.get() {
            for target in targets {
                target.publish_control_config(device_id, control_id);
            }
        }
    }

    fn publish_availability(&self, device_id: &str, control_id: &str) {
        if let Some(targets) = self.slot.get() {
            for target in targets {
                target.publish_availability(device_id, control_id);
            }
        }
    }

    fn publish_control_state(&self, device_id: &str, control_id: &str) {
        if let Some(targets) = self.slot.get() {
            for target in targets {
                target.publish_control_state(device_id, control_id);
            }
        }
    }
}

/// Drives one broker's event loop: `ConnAck` triggers the first-connect or
/// reconnect hook, `Publish` dispatches to the router, and transport errors
/// either back off (connection refused, bounded at 30s per spec.md §4.7) or
/// are treated as fatal.
async fn run_connection<FConnect, FutConnect, FReconnect, FutReconnect, FDispatch, FutDispatch>(
    name: &str,
    mut eventloop: EventLoop,
    mut stop_rx: broadcast::Receiver<()>,
    mut on_first_connect: FConnect,
    mut on_reconnect: FReconnect,
    mut dispatch: FDispatch,
) -> Result<()>
where
    FConnect: FnMut() -> FutConnect,
    FutConnect: Future<Output = Result<()>>,
    FReconnect: FnMut() -> FutReconnect,
    FutReconnect: Future<Output = Result<()>>,
    FDispatch: FnMut(String, Vec<u8>) -> FutDispatch,
    FutDispatch: Future<Output = ()>,
{
    let mut connected_once = false;
    let mut backoff_secs = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = stop_rx.recv() => {
                log::info!("[{name}] stop requested");
                return Ok(());
            }
            polled = eventloop.poll() => {
                match polled {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        backoff_secs = 0;
                        log::info!("[{name}] connected to MQTT");
                        let result = if connected_once {
                            on_reconnect().await
                        } else {
                            connected_once = true;
                            on_first_connect().await
                        };
                        result.with_context(|| format!("[{name}] failed to install subscriptions"))?;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        dispatch(publish.topic, publish.payload.to_vec()).await;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        if is_retryable(&err) {
                            backoff_secs = (backoff_secs + 6).min(30);
                            log::error!("[{name}] error connecting to MQTT: {err}; next try in {backoff_secs}s");
                            tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                        } else {
                            anyhow::bail!("[{name}] fatal MQTT transport error: {err}");
                        }
                    }
                }
            }
        }
    }
}

/// Connection-refused style errors back off and retry forever (spec.md
/// §4.7); anything else (protocol violations, TLS failures, ...) is fatal.
fn is_retryable(err: &rumqttc::ConnectionError) -> bool {
    use std::io::ErrorKind;
    match err {
        rumqttc::ConnectionError::ConnectionRefused(_) => true,
        rumqttc::ConnectionError::Io(io_err) => matches!(
            io_err.kind(),
            ErrorKind::ConnectionRefused | ErrorKind::TimedOut | ErrorKind::NotConnected | ErrorKind::ConnectionReset
        ),
        _ => false,
    }
}
