//! Values exchanged through the durable store and owned by the engine.
//!
//! Everything that crosses the store is JSON with camelCase field names so
//! the dashboard and the hardware bridge can read it without knowing Rust.
//! Timestamps are unix seconds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Operating mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Operator switch is the only trigger.
    Manual,
    /// Fires every `auto_frequency_hours`, fenced by `LastAutoTriggerMark`.
    Automatic,
    /// Fires once at `scheduled_time_of_day`.
    Scheduled,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Automatic => write!(f, "automatic"),
            Self::Scheduled => write!(f, "scheduled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Wall-clock time of day (HH:MM)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    pub const fn new(hour: u8, minute: u8) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self { hour, minute })
        } else {
            None
        }
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }
}

impl FromStr for TimeOfDay {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (h, m) = s
            .split_once(':')
            .ok_or_else(|| format!("time of day '{s}' is not HH:MM"))?;

        let field = |part: &str, what: &str| -> Result<u8, String> {
            if part.is_empty() || part.len() > 2 || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(format!("time of day '{s}' has an invalid {what}"));
            }
            part.parse::<u8>()
                .map_err(|_| format!("time of day '{s}' has an invalid {what}"))
        };

        let hour = field(h, "hour")?;
        let minute = field(m, "minute")?;
        Self::new(hour, minute).ok_or_else(|| format!("time of day '{s}' is out of range"))
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

// ---------------------------------------------------------------------------
// Store records
// ---------------------------------------------------------------------------

/// Operator intent. Written by any authorized client, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrrigationConfig {
    pub mode: Mode,
    pub active: bool,
    pub cycle_duration_minutes: u32,
    pub auto_frequency_hours: u32,
    pub scheduled_time_of_day: TimeOfDay,
    #[serde(default)]
    pub updated_at: i64,
}

/// Idempotency fence for automatic mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastAutoTriggerMark {
    pub timestamp: i64,
}

/// Desired valve state. Only the cycle timer writes this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValveCommand {
    pub open: bool,
    #[serde(default)]
    pub issued_at: i64,
}

/// Valve state as last reported by the hardware bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValveConfirmation {
    pub open: bool,
    pub reported_at: i64,
}

// ---------------------------------------------------------------------------
// Tank
// ---------------------------------------------------------------------------

/// Per-tick draining leaves float residue; anything below this is empty.
const EMPTY_LITERS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TankLevel {
    pub current_liters: f64,
    pub capacity_liters: f64,
    pub low_threshold_pct: f64,
}

impl TankLevel {
    /// A full tank.
    pub fn full(capacity_liters: f64, low_threshold_pct: f64) -> Self {
        Self {
            current_liters: capacity_liters,
            capacity_liters,
            low_threshold_pct,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.current_liters <= EMPTY_LITERS
    }

    pub fn percent(&self) -> f64 {
        if self.capacity_liters <= 0.0 {
            return 0.0;
        }
        self.current_liters / self.capacity_liters * 100.0
    }

    pub fn is_low(&self) -> bool {
        self.percent() <= self.low_threshold_pct
    }

    /// Remove up to `liters`; returns how much was actually removed.
    pub fn drain(&mut self, liters: f64) -> f64 {
        let before = self.current_liters;
        self.current_liters = (self.current_liters - liters.max(0.0)).clamp(0.0, self.capacity_liters);
        before - self.current_liters
    }

    /// Add `liters`, or fill to capacity when `None`.
    pub fn refill(&mut self, liters: Option<f64>) {
        self.current_liters = match liters {
            Some(l) => (self.current_liters + l.max(0.0)).clamp(0.0, self.capacity_liters),
            None => self.capacity_liters,
        };
    }

    /// Force the level back into [0, capacity]; store values are untrusted.
    pub fn clamped(mut self) -> Self {
        self.capacity_liters = self.capacity_liters.max(0.0);
        self.current_liters = self.current_liters.clamp(0.0, self.capacity_liters);
        self
    }
}

// ---------------------------------------------------------------------------
// Cycle session
// ---------------------------------------------------------------------------

/// One in-progress watering cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleSession {
    pub started_at: i64,
    pub duration_seconds: u32,
    pub remaining_seconds: u32,
    pub trigger: Mode,
}

impl CycleSession {
    pub fn elapsed_seconds(&self) -> u32 {
        self.duration_seconds.saturating_sub(self.remaining_seconds)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Wall-clock unix seconds.
pub fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

// ===========================================================================
// Tests
// ===========================================================================
