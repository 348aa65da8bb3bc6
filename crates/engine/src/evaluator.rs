//! Trigger evaluators: decide whether a watering cycle should start now.
//!
//! Evaluation is a pure function of `(now, snapshot)`. Nothing here writes
//! to the store; the caller performs the writes that follow a
//! [`Decision::StartCycle`].

use std::fmt;
use time::{OffsetDateTime, UtcOffset};

use crate::model::{IrrigationConfig, LastAutoTriggerMark, Mode};

const SECS_PER_HOUR: i64 = 3600;
const SECS_PER_MINUTE: i64 = 60;

/// Durable state as seen by one evaluation.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub config: IrrigationConfig,
    pub last_auto_trigger: Option<LastAutoTriggerMark>,
    pub watering: bool,
    pub tank_empty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    StartCycle,
    NoAction(Skip),
}

/// Why an evaluation (or a start attempt) did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    Inactive,
    AlreadyWatering,
    TankEmpty,
    ZeroDuration,
    NotDue { remaining_secs: i64 },
    NotScheduledMinute,
    AlreadyFiredThisMinute,
    ManualMode,
    StoreUnavailable,
    ClockOutOfRange,
}

impl fmt::Display for Skip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => write!(f, "irrigation inactive"),
            Self::AlreadyWatering => write!(f, "already watering"),
            Self::TankEmpty => write!(f, "tank empty"),
            Self::ZeroDuration => write!(f, "cycle duration is zero"),
            Self::NotDue { remaining_secs } => write!(f, "not due for {remaining_secs}s"),
            Self::NotScheduledMinute => write!(f, "not the scheduled minute"),
            Self::AlreadyFiredThisMinute => write!(f, "already fired this minute"),
            Self::ManualMode => write!(f, "manual mode has no evaluator"),
            Self::StoreUnavailable => write!(f, "store unavailable"),
            Self::ClockOutOfRange => write!(f, "clock out of range"),
        }
    }
}

/// Checks shared by the timed modes.
fn common_guards(snap: &Snapshot) -> Option<Skip> {
    if !snap.config.active {
        Some(Skip::Inactive)
    } else if snap.watering {
        Some(Skip::AlreadyWatering)
    } else if snap.tank_empty {
        Some(Skip::TankEmpty)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Automatic
// ---------------------------------------------------------------------------

/// Due once `auto_frequency_hours` have passed since the last trigger mark.
/// A missing mark means automatic mode has never fired.
pub fn evaluate_automatic(now: i64, snap: &Snapshot) -> Decision {
    if let Some(skip) = common_guards(snap) {
        return Decision::NoAction(skip);
    }

    let Some(mark) = snap.last_auto_trigger else {
        return Decision::StartCycle;
    };

    let due_after = i64::from(snap.config.auto_frequency_hours) * SECS_PER_HOUR;
    let elapsed = now - mark.timestamp;
    if elapsed >= due_after {
        Decision::StartCycle
    } else {
        Decision::NoAction(Skip::NotDue {
            remaining_secs: due_after - elapsed,
        })
    }
}

// ---------------------------------------------------------------------------
// Scheduled
// ---------------------------------------------------------------------------

/// Fires when local wall-clock time hits the configured HH:MM.
///
/// The "already fired" marker lives in this process only. It is keyed by
/// minute, so it lapses on its own once the minute is over.
#[derive(Debug, Default)]
pub struct ScheduledEvaluator {
    fired_minute: Option<i64>,
}

impl ScheduledEvaluator {
    pub fn evaluate(&self, now: i64, offset: UtcOffset, snap: &Snapshot) -> Decision {
        if let Some(skip) = common_guards(snap) {
            return Decision::NoAction(skip);
        }

        let Ok(utc) = OffsetDateTime::from_unix_timestamp(now) else {
            return Decision::NoAction(Skip::ClockOutOfRange);
        };
        let local = utc.to_offset(offset);
        let target = snap.config.scheduled_time_of_day;
        if (local.hour(), local.minute()) != (target.hour(), target.minute()) {
            return Decision::NoAction(Skip::NotScheduledMinute);
        }

        if self.fired_minute == Some(now.div_euclid(SECS_PER_MINUTE)) {
            return Decision::NoAction(Skip::AlreadyFiredThisMinute);
        }

        Decision::StartCycle
    }

    /// Record that a scheduled cycle was started at `now`.
    pub fn mark_fired(&mut self, now: i64) {
        self.fired_minute = Some(now.div_euclid(SECS_PER_MINUTE));
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Run the evaluator that governs `snap.config.mode`.
pub fn evaluate(
    now: i64,
    offset: UtcOffset,
    snap: &Snapshot,
    scheduled: &ScheduledEvaluator,
) -> Decision {
    match snap.config.mode {
        Mode::Manual => Decision::NoAction(Skip::ManualMode),
        Mode::Automatic => evaluate_automatic(now, snap),
        Mode::Scheduled => scheduled.evaluate(now, offset, snap),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// 2024-06-01T06:30:00Z
    const AT_0630: i64 = 1_717_223_400;
    const NOW: i64 = 1_750_000_000;

    fn snap(mode: Mode) -> Snapshot {
        Snapshot {
            config: IrrigationConfig {
                mode,
                active: true,
                cycle_duration_minutes: 20,
                auto_frequency_hours: 12,
                scheduled_time_of_day: "06:30".parse().unwrap(),
                updated_at: 0,
            },
            last_auto_trigger: None,
            watering: false,
            tank_empty: false,
        }
    }

    fn with_mark(mut s: Snapshot, ts: i64) -> Snapshot {
        s.last_auto_trigger = Some(LastAutoTriggerMark { timestamp: ts });
        s
    }

    // -- Automatic --------------------------------------------------------

    #[test]
    fn automatic_fires_when_overdue() {
        let s = with_mark(snap(Mode::Automatic), NOW - 13 * 3600);
        assert_eq!(evaluate_automatic(NOW, &s), Decision::StartCycle);
    }

    #[test]
    fn automatic_waits_when_recent() {
        let s = with_mark(snap(Mode::Automatic), NOW - 5 * 3600);
        assert_eq!(
            evaluate_automatic(NOW, &s),
            Decision::NoAction(Skip::NotDue {
                remaining_secs: 7 * 3600
            })
        );
    }

    #[test]
    fn automatic_fires_exactly_at_frequency() {
        let s = with_mark(snap(Mode::Automatic), NOW - 12 * 3600);
        assert_eq!(evaluate_automatic(NOW, &s), Decision::StartCycle);
    }

    #[test]
    fn automatic_without_mark_fires() {
        assert_eq!(
            evaluate_automatic(NOW, &snap(Mode::Automatic)),
            Decision::StartCycle
        );
    }

    #[test]
    fn automatic_inactive_does_nothing() {
        let mut s = snap(Mode::Automatic);
        s.config.active = false;
        assert_eq!(
            evaluate_automatic(NOW, &s),
            Decision::NoAction(Skip::Inactive)
        );
    }

    #[test]
    fn automatic_while_watering_does_nothing() {
        let mut s = snap(Mode::Automatic);
        s.watering = true;
        assert_eq!(
            evaluate_automatic(NOW, &s),
            Decision::NoAction(Skip::AlreadyWatering)
        );
    }

    #[test]
    fn automatic_with_empty_tank_does_nothing() {
        let mut s = snap(Mode::Automatic);
        s.tank_empty = true;
        assert_eq!(
            evaluate_automatic(NOW, &s),
            Decision::NoAction(Skip::TankEmpty)
        );
    }

    #[test]
    fn automatic_mark_in_future_is_not_due() {
        let s = with_mark(snap(Mode::Automatic), NOW + 60);
        assert!(matches!(
            evaluate_automatic(NOW, &s),
            Decision::NoAction(Skip::NotDue { .. })
        ));
    }

    // -- Scheduled --------------------------------------------------------

    #[test]
    fn scheduled_fires_once_per_minute() {
        let mut ev = ScheduledEvaluator::default();
        let s = snap(Mode::Scheduled);

        assert_eq!(ev.evaluate(AT_0630 + 5, UtcOffset::UTC, &s), Decision::StartCycle);
        ev.mark_fired(AT_0630 + 5);
        assert_eq!(
            ev.evaluate(AT_0630 + 45, UtcOffset::UTC, &s),
            Decision::NoAction(Skip::AlreadyFiredThisMinute)
        );
    }

    #[test]
    fn scheduled_fires_again_next_day() {
        let mut ev = ScheduledEvaluator::default();
        let s = snap(Mode::Scheduled);
        ev.mark_fired(AT_0630 + 5);
        assert_eq!(
            ev.evaluate(AT_0630 + 86_400 + 10, UtcOffset::UTC, &s),
            Decision::StartCycle
        );
    }

    #[test]
    fn scheduled_outside_minute_does_nothing() {
        let ev = ScheduledEvaluator::default();
        let s = snap(Mode::Scheduled);
        assert_eq!(
            ev.evaluate(AT_0630 - 1, UtcOffset::UTC, &s),
            Decision::NoAction(Skip::NotScheduledMinute)
        );
        assert_eq!(
            ev.evaluate(AT_0630 + 60, UtcOffset::UTC, &s),
            Decision::NoAction(Skip::NotScheduledMinute)
        );
    }

    #[test]
    fn scheduled_uses_local_offset() {
        let ev = ScheduledEvaluator::default();
        let s = snap(Mode::Scheduled);
        let plus_two = UtcOffset::from_hms(2, 0, 0).unwrap();
        // 06:30 local at UTC+2 is 04:30 UTC.
        assert_eq!(
            ev.evaluate(AT_0630 - 2 * 3600, plus_two, &s),
            Decision::StartCycle
        );
        assert_eq!(
            ev.evaluate(AT_0630, plus_two, &s),
            Decision::NoAction(Skip::NotScheduledMinute)
        );
    }

    #[test]
    fn scheduled_inactive_does_nothing() {
        let ev = ScheduledEvaluator::default();
        let mut s = snap(Mode::Scheduled);
        s.config.active = false;
        assert_eq!(
            ev.evaluate(AT_0630, UtcOffset::UTC, &s),
            Decision::NoAction(Skip::Inactive)
        );
    }

    // -- Dispatch ---------------------------------------------------------

    #[test]
    fn manual_mode_never_starts() {
        let ev = ScheduledEvaluator::default();
        assert_eq!(
            evaluate(NOW, UtcOffset::UTC, &snap(Mode::Manual), &ev),
            Decision::NoAction(Skip::ManualMode)
        );
    }

    #[test]
    fn dispatch_follows_mode() {
        let ev = ScheduledEvaluator::default();
        assert_eq!(
            evaluate(NOW, UtcOffset::UTC, &snap(Mode::Automatic), &ev),
            Decision::StartCycle
        );
        assert_eq!(
            evaluate(AT_0630, UtcOffset::UTC, &snap(Mode::Scheduled), &ev),
            Decision::StartCycle
        );
    }

    #[test]
    fn skip_reasons_are_readable() {
        assert_eq!(
            Skip::NotDue { remaining_secs: 30 }.to_string(),
            "not due for 30s"
        );
        assert_eq!(Skip::TankEmpty.to_string(), "tank empty");
    }
}
