//! MQTT transport construction: builds the two broker connections the
//! supervisor (C7) owns. Connection/reconnection behavior and dispatch live
//! in `supervisor.rs`; this module is just the `rumqttc` options builder,
//! generalized from `examples/dank0i-pc-bridge/src/mqtt.rs`'s
//! `MqttOptions` setup to the two independent brokers this bridge talks to.

use std::time::Duration;

use rumqttc::{AsyncClient, EventLoop, MqttOptions};

/// Builds an unconnected client/event-loop pair for one broker. The actual
/// TCP connect happens lazily on the first `EventLoop::poll()` call, which
/// the supervisor's reconnection loop drives (spec.md §4.7).
pub fn build_client(
    client_id: &str,
    host: &str,
    port: u16,
    username: Option<&str>,
    password: Option<&str>,
) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(client_id, host, port);
    opts.set_keep_alive(Duration::from_secs(30));
    opts.set_clean_session(false);
    if let (Some(username), Some(password)) = (username, password) {
        if !username.is_empty() {
            opts.set_credentials(username, password);
        }
    }
    // Event channel capacity: bounded to the same headroom the teacher
    // codebase uses for its single-broker client.
    AsyncClient::new(opts, 100)
}
