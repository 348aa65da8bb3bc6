//! Cycle timer: owns the single active watering cycle.
//!
//! Counts the cycle down once per tick, drains the tank at the nominal flow
//! rate, and closes the valve when the cycle elapses, the tank runs dry, or
//! the caller cancels. A command the store refused is kept and re-sent on
//! the next tick.

use std::fmt;
use tracing::{info, warn};

use crate::evaluator::Skip;
use crate::model::{CycleSession, Mode, TankLevel, ValveCommand};
use crate::store::{Store, StoreError};
use crate::valve::ValveChannel;

const SECS_PER_MINUTE: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Elapsed,
    TankEmpty,
    SwitchedOff,
    Deactivated,
    ModeChanged,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Elapsed => write!(f, "elapsed"),
            Self::TankEmpty => write!(f, "tank empty"),
            Self::SwitchedOff => write!(f, "switched off"),
            Self::Deactivated => write!(f, "deactivated"),
            Self::ModeChanged => write!(f, "mode changed"),
        }
    }
}

/// A cycle that has just ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Finished {
    pub session: CycleSession,
    pub reason: EndReason,
    pub ended_at: i64,
    pub liters_used: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    Idle,
    Running { remaining_seconds: u32 },
    Finished(Finished),
}

pub struct CycleTimer<S: Store> {
    channel: ValveChannel<S>,
    flow_lpm: f64,
    session: Option<CycleSession>,
    liters_used: f64,
    desired_open: bool,
    unsent: bool,
}

impl<S: Store> CycleTimer<S> {
    pub fn new(channel: ValveChannel<S>, flow_lpm: f64) -> Self {
        Self {
            channel,
            flow_lpm,
            session: None,
            liters_used: 0.0,
            desired_open: false,
            unsent: false,
        }
    }

    pub fn session(&self) -> Option<&CycleSession> {
        self.session.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    #[cfg(test)]
    pub fn desired_open(&self) -> bool {
        self.desired_open
    }

    #[cfg(test)]
    pub fn has_unsent_command(&self) -> bool {
        self.unsent
    }

    /// The valve command currently in the store, whoever wrote it.
    pub async fn stored_command(&self) -> Result<Option<ValveCommand>, StoreError> {
        self.channel.current().await
    }

    /// Begin a cycle and open the valve. Refused while another cycle runs.
    pub async fn start(
        &mut self,
        now: i64,
        duration_minutes: u32,
        trigger: Mode,
        tank: &TankLevel,
    ) -> Result<CycleSession, Skip> {
        if self.session.is_some() {
            return Err(Skip::AlreadyWatering);
        }
        if duration_minutes == 0 {
            return Err(Skip::ZeroDuration);
        }
        if tank.is_empty() {
            return Err(Skip::TankEmpty);
        }

        let duration_seconds = duration_minutes.saturating_mul(SECS_PER_MINUTE);
        let session = CycleSession {
            started_at: now,
            duration_seconds,
            remaining_seconds: duration_seconds,
            trigger,
        };
        self.session = Some(session);
        self.liters_used = 0.0;

        info!(%trigger, duration_seconds, "cycle started");
        self.command(true, now).await;
        Ok(session)
    }

    /// Advance the running cycle by `elapsed_secs`.
    pub async fn tick(&mut self, now: i64, elapsed_secs: u32, tank: &mut TankLevel) -> TickOutcome {
        if self.unsent {
            self.send(now).await;
        }

        let Some(session) = self.session.as_mut() else {
            return TickOutcome::Idle;
        };

        let step = elapsed_secs.min(session.remaining_seconds);
        session.remaining_seconds -= step;
        let remaining_seconds = session.remaining_seconds;
        self.liters_used += tank.drain(self.flow_lpm * f64::from(step) / 60.0);

        let reason = if remaining_seconds == 0 {
            EndReason::Elapsed
        } else if tank.is_empty() {
            EndReason::TankEmpty
        } else {
            return TickOutcome::Running { remaining_seconds };
        };

        match self.terminate(now, reason).await {
            Some(finished) => TickOutcome::Finished(finished),
            None => TickOutcome::Idle,
        }
    }

    /// End the running cycle and close the valve. A no-op when idle.
    pub async fn terminate(&mut self, now: i64, reason: EndReason) -> Option<Finished> {
        let session = self.session.take()?;
        info!(
            %reason,
            elapsed_seconds = session.elapsed_seconds(),
            liters_used = format!("{:.2}", self.liters_used),
            "cycle ended"
        );
        self.command(false, now).await;
        Some(Finished {
            session,
            reason,
            ended_at: now,
            liters_used: self.liters_used,
        })
    }

    /// Close the valve without a session, e.g. one left open by a previous run.
    pub async fn force_close(&mut self, now: i64) {
        self.command(false, now).await;
    }

    async fn command(&mut self, open: bool, now: i64) {
        self.desired_open = open;
        self.send(now).await;
    }

    async fn send(&mut self, now: i64) {
        match self.channel.issue(self.desired_open, now).await {
            Ok(_) => self.unsent = false,
            Err(e) => {
                self.unsent = true;
                warn!(
                    open = self.desired_open,
                    "valve command write failed, retrying next tick: {e}"
                );
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
