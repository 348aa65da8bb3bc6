//! Fault-injecting bridge simulator for local development.
//!
//! Each scenario decides, per command, how long the bridge takes to act and
//! whether the confirmation makes it back. Pair it with the engine's
//! reconciler to watch the stale flag come and go.

use std::fmt;
use std::time::Duration;

use crate::Plan;

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured fault profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Acts within a few hundred milliseconds, always confirms.
    Healthy,
    /// Acts after several seconds. Long enough to trip a short timeout.
    Laggy,
    /// Acts quickly, but about a third of confirmations are lost.
    Flaky,
    /// Never acts, never confirms.
    Dead,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "laggy" => Self::Laggy,
            "flaky" => Self::Flaky,
            "dead" => Self::Dead,
            _ => Self::Healthy, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Laggy => write!(f, "laggy"),
            Self::Flaky => write!(f, "flaky"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

// ---------------------------------------------------------------------------
// Fault model
// ---------------------------------------------------------------------------

pub struct FaultModel {
    scenario: Scenario,
    /// Inclusive latency range in milliseconds.
    latency_ms: (u64, u64),
    drop_prob: f32,
}

impl FaultModel {
    pub fn new(scenario: Scenario) -> Self {
        let (latency_ms, drop_prob) = match scenario {
            Scenario::Healthy => ((50, 300), 0.0),
            Scenario::Laggy => ((3_000, 12_000), 0.0),
            Scenario::Flaky => ((100, 800), 0.35_f32),
            Scenario::Dead => ((0, 0), 1.0),
        };
        Self {
            scenario,
            latency_ms,
            drop_prob,
        }
    }

    pub fn scenario(&self) -> Scenario {
        self.scenario
    }

    pub fn plan(&self) -> Plan {
        if self.scenario == Scenario::Dead {
            return Plan::Ignore;
        }
        let (lo, hi) = self.latency_ms;
        Plan::Actuate {
            delay: Duration::from_millis(fastrand::u64(lo..=hi)),
            confirm: fastrand::f32() >= self.drop_prob,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
