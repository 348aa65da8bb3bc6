//! Confirmation reconciler: compares the commanded valve state with what the
//! hardware bridge last reported.
//!
//! Divergence older than the timeout is flagged as stale. By default the
//! flag is informational only; nothing is re-sent. With `resend_on_stale`
//! the last command is re-issued each time it goes stale.

use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::model::{now_unix, ValveCommand, ValveConfirmation};
use crate::state::SharedState;
use crate::store::{keys, Store};
use crate::valve::ValveChannel;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValveStatus {
    pub commanded: Option<ValveCommand>,
    pub confirmed: Option<ValveConfirmation>,
    pub diverged: bool,
    pub stale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    BecameStale,
    Recovered,
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    timeout_secs: i64,
    commanded: Option<ValveCommand>,
    confirmed: Option<ValveConfirmation>,
    was_stale: bool,
}

impl Reconciler {
    pub fn new(timeout_secs: i64) -> Self {
        Self {
            timeout_secs,
            commanded: None,
            confirmed: None,
            was_stale: false,
        }
    }

    pub fn observe_command(&mut self, cmd: ValveCommand) {
        self.commanded = Some(cmd);
    }

    /// Out-of-order reports older than the one we hold are ignored.
    pub fn observe_confirmation(&mut self, c: ValveConfirmation) {
        if self
            .confirmed
            .is_some_and(|held| held.reported_at > c.reported_at)
        {
            return;
        }
        self.confirmed = Some(c);
    }

    /// No command means nothing to reconcile. A command with no report at
    /// all counts as diverged.
    pub fn diverged(&self) -> bool {
        match (self.commanded, self.confirmed) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(cmd), Some(conf)) => cmd.open != conf.open,
        }
    }

    /// Divergence is timed from whichever happened last, the command or the
    /// report, so a fresh command always gets the full timeout.
    fn diverged_since(&self) -> Option<i64> {
        if !self.diverged() {
            return None;
        }
        let issued = self.commanded.map_or(0, |c| c.issued_at);
        let reported = self.confirmed.map_or(i64::MIN, |c| c.reported_at);
        Some(issued.max(reported))
    }

    pub fn is_stale(&self, now: i64) -> bool {
        self.diverged_since()
            .is_some_and(|since| now - since > self.timeout_secs)
    }

    pub fn status(&self, now: i64) -> ValveStatus {
        ValveStatus {
            commanded: self.commanded,
            confirmed: self.confirmed,
            diverged: self.diverged(),
            stale: self.is_stale(now),
        }
    }

    /// Current status plus whether staleness flipped since the last check.
    pub fn check(&mut self, now: i64) -> (ValveStatus, Transition) {
        let status = self.status(now);
        let transition = match (self.was_stale, status.stale) {
            (false, true) => Transition::BecameStale,
            (true, false) => Transition::Recovered,
            _ => Transition::Unchanged,
        };
        self.was_stale = status.stale;
        (status, transition)
    }
}

/// Follow `valveCommand` / `valveConfirmation` and publish the status into
/// shared state until the store goes away.
pub async fn run<S: Store>(
    store: S,
    shared: SharedState,
    mut reconciler: Reconciler,
    resend_on_stale: bool,
    check_every: Duration,
) {
    let mut commands = store.subscribe(keys::VALVE_COMMAND);
    let mut confirmations = store.subscribe(keys::VALVE_CONFIRMATION);
    let channel = ValveChannel::new(store.clone());

    if let Ok(Some(cmd)) = crate::store::read(&store, keys::VALVE_COMMAND).await {
        reconciler.observe_command(cmd);
    }
    if let Ok(Some(conf)) = crate::store::read(&store, keys::VALVE_CONFIRMATION).await {
        reconciler.observe_confirmation(conf);
    }

    let mut ticker = tokio::time::interval(check_every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            Some(v) = commands.next() => match serde_json::from_value(v) {
                Ok(cmd) => reconciler.observe_command(cmd),
                Err(e) => warn!("reconciler: bad valve command: {e}"),
            },
            Some(v) = confirmations.next() => match serde_json::from_value(v) {
                Ok(conf) => reconciler.observe_confirmation(conf),
                Err(e) => warn!("reconciler: bad valve confirmation: {e}"),
            },
            _ = ticker.tick() => {}
        }

        let now = now_unix();
        let (status, transition) = reconciler.check(now);

        match transition {
            Transition::BecameStale => {
                let commanded = status.commanded.map(|c| c.open);
                let confirmed = status.confirmed.map(|c| c.open);
                warn!(?commanded, ?confirmed, "valve confirmation stale");
                let mut st = shared.write().await;
                st.record_warning(
                    now,
                    format!("valve confirmation stale (commanded {commanded:?}, confirmed {confirmed:?})"),
                );
            }
            Transition::Recovered => {
                info!("valve confirmation caught up");
                shared
                    .write()
                    .await
                    .record_system(now, "valve confirmation caught up".into());
            }
            Transition::Unchanged => {}
        }

        if resend_on_stale && transition == Transition::BecameStale {
            if let Some(cmd) = status.commanded {
                match channel.issue(cmd.open, now).await {
                    Ok(resent) => reconciler.observe_command(resent),
                    Err(e) => warn!("reconciler: resend failed: {e}"),
                }
            }
        }

        shared.write().await.valve = reconciler.status(now);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
