use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::evaluator::{Decision, Skip};
use crate::model::{CycleSession, IrrigationConfig, Mode, TankLevel};
use crate::reconciler::ValveStatus;

/// Maximum number of entries retained in each ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<EngineState>>;

pub fn shared() -> SharedState {
    Arc::new(RwLock::new(EngineState::new()))
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// What the engine exposes to the dashboard: the running cycle, the tank,
/// commanded vs confirmed valve state, and the decision log.
pub struct EngineState {
    pub started_at: Instant,
    pub store_available: bool,
    pub config: Option<IrrigationConfig>,
    pub cycle: Option<CycleSession>,
    pub tank: Option<TankLevel>,
    pub valve: ValveStatus,
    pub decisions: VecDeque<DecisionEntry>,
    pub events: VecDeque<SystemEvent>,
}

/// One evaluator or operator decision.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionEntry {
    pub ts: i64,
    pub mode: Option<Mode>,
    pub started: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    pub ts: i64,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Cycle,
    Warning,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub store_available: bool,
    pub mode: Option<Mode>,
    pub active: Option<bool>,
    pub cycle: Option<CycleSession>,
    pub tank: Option<TankLevel>,
    pub tank_low: bool,
    pub valve: ValveStatus,
    pub decisions: Vec<DecisionEntry>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            store_available: false,
            config: None,
            cycle: None,
            tank: None,
            valve: ValveStatus::default(),
            decisions: VecDeque::with_capacity(MAX_EVENTS),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Append to the decision log.
    pub fn record_decision(&mut self, ts: i64, mode: Option<Mode>, decision: Decision, reason: &str) {
        let (started, reason) = match decision {
            Decision::StartCycle => (true, reason.to_string()),
            Decision::NoAction(skip) if reason.is_empty() => (false, skip.to_string()),
            Decision::NoAction(skip) => (false, format!("{reason}: {skip}")),
        };
        push_bounded(
            &mut self.decisions,
            DecisionEntry {
                ts,
                mode,
                started,
                reason,
            },
        );
    }

    /// Last logged decision, if it was a skip for the same reason.
    pub fn last_skip_was(&self, skip: Skip) -> bool {
        self.decisions
            .back()
            .is_some_and(|d| !d.started && d.reason.ends_with(&skip.to_string()))
    }

    pub fn record_cycle(&mut self, ts: i64, detail: String) {
        self.push_event(ts, EventKind::Cycle, detail);
    }

    pub fn record_warning(&mut self, ts: i64, detail: String) {
        self.push_event(ts, EventKind::Warning, detail);
    }

    pub fn record_error(&mut self, ts: i64, detail: String) {
        self.push_event(ts, EventKind::Error, detail);
    }

    pub fn record_system(&mut self, ts: i64, detail: String) {
        self.push_event(ts, EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot. Newest entries first.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            store_available: self.store_available,
            mode: self.config.as_ref().map(|c| c.mode),
            active: self.config.as_ref().map(|c| c.active),
            cycle: self.cycle,
            tank: self.tank,
            tank_low: self.tank.is_some_and(|t| t.is_low()),
            valve: self.valve,
            decisions: self.decisions.iter().rev().cloned().collect(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, ts: i64, kind: EventKind, detail: String) {
        push_bounded(&mut self.events, SystemEvent { ts, kind, detail });
    }
}

fn push_bounded<T>(buf: &mut VecDeque<T>, item: T) {
    if buf.len() >= MAX_EVENTS {
        buf.pop_front();
    }
    buf.push_back(item);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_log_is_bounded() {
        let mut st = EngineState::new();
        for i in 0..(MAX_EVENTS as i64 + 10) {
            st.record_decision(i, Some(Mode::Automatic), Decision::NoAction(Skip::Inactive), "");
        }
        assert_eq!(st.decisions.len(), MAX_EVENTS);
        assert_eq!(st.decisions.front().unwrap().ts, 10);
    }

    #[test]
    fn skip_reason_is_logged() {
        let mut st = EngineState::new();
        st.record_decision(
            1,
            Some(Mode::Automatic),
            Decision::NoAction(Skip::NotDue { remaining_secs: 60 }),
            "",
        );
        st.record_decision(2, Some(Mode::Manual), Decision::StartCycle, "operator switch on");

        let status = st.to_status();
        assert_eq!(status.decisions[0].reason, "operator switch on");
        assert!(status.decisions[0].started);
        assert_eq!(status.decisions[1].reason, "not due for 60s");
        assert!(!status.decisions[1].started);
    }

    #[test]
    fn last_skip_was_matches_reason() {
        let mut st = EngineState::new();
        assert!(!st.last_skip_was(Skip::StoreUnavailable));
        st.record_decision(1, None, Decision::NoAction(Skip::StoreUnavailable), "poll");
        assert!(st.last_skip_was(Skip::StoreUnavailable));
        assert!(!st.last_skip_was(Skip::Inactive));
    }

    #[test]
    fn status_reports_tank_low() {
        let mut st = EngineState::new();
        let mut tank = TankLevel::full(100.0, 20.0);
        tank.drain(90.0);
        st.tank = Some(tank);
        assert!(st.to_status().tank_low);
    }

    #[test]
    fn events_newest_first() {
        let mut st = EngineState::new();
        st.record_system(1, "engine started".into());
        st.record_warning(2, "valve confirmation stale".into());
        let status = st.to_status();
        assert_eq!(status.events[0].kind, EventKind::Warning);
        assert_eq!(status.events[1].kind, EventKind::System);
    }
}
