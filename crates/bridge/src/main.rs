mod msg;
#[cfg(feature = "sim")]
mod sim;
mod valve;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, time::Duration};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use msg::{now_unix, parse_command, topic_for, ValveCommand, ValveConfirmation};
use valve::Relay;

/// What the bridge does with one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Wait `delay`, switch the relay, then confirm unless `confirm` is false.
    Actuate { delay: Duration, confirm: bool },
    /// Drop the command entirely.
    Ignore,
}

#[cfg(feature = "sim")]
type Faults = sim::FaultModel;

/// Without the simulator every command is applied and confirmed at once.
#[cfg(not(feature = "sim"))]
struct Faults;

#[cfg(not(feature = "sim"))]
impl Faults {
    fn plan(&self) -> Plan {
        Plan::Actuate {
            delay: Duration::ZERO,
            confirm: true,
        }
    }
}

enum Action {
    Apply(ValveCommand),
    /// Connection lost: close the valve.
    FailSafe,
}

// ---------------------------------------------------------------------------
// Actuator
// ---------------------------------------------------------------------------

struct Actuator {
    relay: Relay,
    last_issued: Option<i64>,
}

impl Actuator {
    fn new(relay: Relay) -> Self {
        Self {
            relay,
            last_issued: None,
        }
    }

    /// Commands older than the last one applied are dropped. Commands with
    /// no issue time always pass.
    fn accept(&mut self, cmd: &ValveCommand) -> bool {
        if cmd.issued_at == 0 {
            return true;
        }
        if self.last_issued.is_some_and(|last| cmd.issued_at < last) {
            return false;
        }
        self.last_issued = Some(cmd.issued_at);
        true
    }

    fn apply(&mut self, open: bool) -> ValveConfirmation {
        self.relay.set(open);
        ValveConfirmation {
            open: self.relay.is_open(),
            reported_at: now_unix(),
        }
    }

    /// Close the relay and forget ordering, so the retained command is
    /// applied again after reconnect. Returns a report if the relay moved.
    fn fail_safe(&mut self) -> Option<ValveConfirmation> {
        self.last_issued = None;
        if !self.relay.is_open() {
            return None;
        }
        Some(self.apply(false))
    }
}

async fn actuate(
    mut actuator: Actuator,
    mut actions: mpsc::Receiver<Action>,
    client: AsyncClient,
    confirm_topic: String,
    faults: Faults,
) {
    while let Some(action) = actions.recv().await {
        let cmd = match action {
            Action::FailSafe => {
                if let Some(conf) = actuator.fail_safe() {
                    warn!("comms lost, valve closed");
                    report(&client, &confirm_topic, conf).await;
                }
                continue;
            }
            Action::Apply(cmd) => cmd,
        };

        if !actuator.accept(&cmd) {
            debug!(issued_at = cmd.issued_at, "ignoring out-of-order valve command");
            continue;
        }

        let (delay, confirm) = match faults.plan() {
            Plan::Actuate { delay, confirm } => (delay, confirm),
            Plan::Ignore => {
                debug!(open = cmd.open, "command ignored (simulated)");
                continue;
            }
        };
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let conf = actuator.apply(cmd.open);
        if confirm {
            report(&client, &confirm_topic, conf).await;
        } else {
            info!(open = conf.open, "confirmation dropped (simulated)");
        }
    }
}

async fn report(client: &AsyncClient, topic: &str, conf: ValveConfirmation) {
    let payload = match serde_json::to_vec(&conf) {
        Ok(p) => p,
        Err(e) => {
            warn!("failed to encode confirmation: {e}");
            return;
        }
    };
    match client.publish(topic, QoS::AtLeastOnce, true, payload).await {
        Ok(()) => debug!(open = conf.open, "confirmation published"),
        Err(e) => warn!("confirmation publish error: {e}"),
    }
}

fn queue(tx: &mpsc::Sender<Action>, action: Action) {
    match tx.try_send(action) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => warn!("actuator busy, dropping action"),
        Err(TrySendError::Closed(_)) => warn!("actuator stopped"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let bridge_id = env::var("BRIDGE_ID").unwrap_or_else(|_| "bridge-a".to_string());
    let prefix = env::var("TOPIC_PREFIX").unwrap_or_else(|_| "farm".to_string());
    let gpio_pin: u8 = env::var("RELAY_GPIO")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(17);
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    #[cfg(feature = "sim")]
    let faults = {
        let faults = sim::FaultModel::new(sim::Scenario::from_str_lossy(
            &env::var("SIM_SCENARIO").unwrap_or_default(),
        ));
        info!(scenario = %faults.scenario(), "fault simulator enabled");
        faults
    };
    #[cfg(not(feature = "sim"))]
    let faults = Faults;

    let relay = Relay::new(gpio_pin, active_low)?;

    let client_id = format!("irrigation-bridge-{bridge_id}");
    let mut mqttoptions = MqttOptions::new(client_id, broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    let command_topic = topic_for(&prefix, msg::VALVE_COMMAND);
    let confirm_topic = topic_for(&prefix, msg::VALVE_CONFIRMATION);
    info!(%command_topic, %confirm_topic, "bridge starting");

    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(actuate(
        Actuator::new(relay),
        rx,
        client.clone(),
        confirm_topic,
        faults,
    ));

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("bridge connected to mqtt");
                if let Err(e) = client.try_subscribe(command_topic.as_str(), QoS::AtLeastOnce) {
                    warn!("subscribe failed: {e}");
                }
            }
            Ok(Event::Incoming(Packet::Publish(p))) if p.topic == command_topic => {
                match parse_command(&p.payload) {
                    Ok(cmd) => queue(&tx, Action::Apply(cmd)),
                    Err(e) => warn!("{e}"),
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                // Best-effort fail-safe: valve off on comms error
                queue(&tx, Action::FailSafe);
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
