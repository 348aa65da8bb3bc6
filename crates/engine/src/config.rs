//! TOML config file loading and validation: engine timing, tank geometry,
//! and the irrigation defaults seeded into an empty store.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use time::UtcOffset;

use crate::model::{IrrigationConfig, Mode, TankLevel, TimeOfDay};
use crate::scheduler::{MachineSettings, SchedulerSettings};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub tank: TankConfig,
    pub defaults: DefaultsConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub poll_interval_sec: u64,
    pub tick_interval_sec: u64,
    pub nominal_flow_lpm: f64,
    pub confirmation_timeout_sec: i64,
    pub resend_on_stale: bool,
    pub utc_offset_minutes: i32,
    pub topic_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_sec: 60,
            tick_interval_sec: 1,
            nominal_flow_lpm: 10.0,
            confirmation_timeout_sec: 30,
            resend_on_stale: false,
            utc_offset_minutes: 0,
            topic_prefix: "farm".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TankConfig {
    pub capacity_liters: f64,
    pub low_threshold_pct: f64,
}

impl Default for TankConfig {
    fn default() -> Self {
        Self {
            capacity_liters: 500.0,
            low_threshold_pct: 20.0,
        }
    }
}

/// Irrigation settings written to the store when it holds none yet.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub mode: Mode,
    pub active: bool,
    pub cycle_duration_minutes: u32,
    pub auto_frequency_hours: u32,
    pub scheduled_time_of_day: TimeOfDay,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Manual,
            active: false,
            cycle_duration_minutes: 20,
            auto_frequency_hours: 12,
            scheduled_time_of_day: DEFAULT_WATERING_TIME,
        }
    }
}

const DEFAULT_WATERING_TIME: TimeOfDay = match TimeOfDay::new(6, 30) {
    Some(t) => t,
    None => panic!("invalid default watering time"),
};

/// Longest cycle an operator may configure.
const MAX_CYCLE_MINUTES: u32 = 24 * 60;

/// Scheduled mode matches on HH:MM, so every wall-clock minute needs a poll.
const MAX_POLL_INTERVAL_SEC: u64 = 60;

/// UTC offsets in the wild stay within ±18h.
const MAX_UTC_OFFSET_MINUTES: i32 = 18 * 60;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_engine(&mut errors);
        self.validate_tank(&mut errors);
        errors.extend(check_irrigation(
            self.defaults.cycle_duration_minutes,
            self.defaults.auto_frequency_hours,
        ));

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_engine(&self, errors: &mut Vec<String>) {
        let e = &self.engine;

        // ── Timing ──────────────────────────────────────────
        if e.poll_interval_sec == 0 {
            errors.push("engine: poll_interval_sec must be positive".into());
        } else if e.poll_interval_sec > MAX_POLL_INTERVAL_SEC {
            errors.push(format!(
                "engine: poll_interval_sec {} exceeds {MAX_POLL_INTERVAL_SEC}; scheduled minutes would be skipped",
                e.poll_interval_sec
            ));
        }
        if e.tick_interval_sec == 0 {
            errors.push("engine: tick_interval_sec must be positive".into());
        } else if e.poll_interval_sec > 0 && e.tick_interval_sec > e.poll_interval_sec {
            errors.push(format!(
                "engine: tick_interval_sec ({}) exceeds poll_interval_sec ({})",
                e.tick_interval_sec, e.poll_interval_sec
            ));
        }
        if e.confirmation_timeout_sec <= 0 {
            errors.push(format!(
                "engine: confirmation_timeout_sec must be positive, got {}",
                e.confirmation_timeout_sec
            ));
        }

        // ── Flow ────────────────────────────────────────────
        if !e.nominal_flow_lpm.is_finite() || e.nominal_flow_lpm <= 0.0 {
            errors.push(format!(
                "engine: nominal_flow_lpm must be positive, got {}",
                e.nominal_flow_lpm
            ));
        }

        // ── Clock ───────────────────────────────────────────
        if e.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
            errors.push(format!(
                "engine: utc_offset_minutes {} out of range [-{MAX_UTC_OFFSET_MINUTES}, {MAX_UTC_OFFSET_MINUTES}]",
                e.utc_offset_minutes
            ));
        }

        // ── Store topics ────────────────────────────────────
        if e.topic_prefix.trim().is_empty() {
            errors.push("engine: topic_prefix is empty".into());
        } else if e.topic_prefix.contains(['/', '+', '#']) {
            errors.push(format!(
                "engine: topic_prefix '{}' must not contain '/', '+' or '#'",
                e.topic_prefix
            ));
        }
    }

    fn validate_tank(&self, errors: &mut Vec<String>) {
        let t = &self.tank;
        if !t.capacity_liters.is_finite() || t.capacity_liters <= 0.0 {
            errors.push(format!(
                "tank: capacity_liters must be positive, got {}",
                t.capacity_liters
            ));
        }
        if !(0.0..=100.0).contains(&t.low_threshold_pct) {
            errors.push(format!(
                "tank: low_threshold_pct {} out of range [0, 100]",
                t.low_threshold_pct
            ));
        }
    }

    // -----------------------------------------------------------------------
    // Derived settings
    // -----------------------------------------------------------------------

    pub fn utc_offset(&self) -> Result<UtcOffset> {
        UtcOffset::from_whole_seconds(self.engine.utc_offset_minutes * 60)
            .map_err(|e| anyhow!("invalid utc offset: {e}"))
    }

    pub fn default_irrigation(&self) -> IrrigationConfig {
        let d = &self.defaults;
        IrrigationConfig {
            mode: d.mode,
            active: d.active,
            cycle_duration_minutes: d.cycle_duration_minutes,
            auto_frequency_hours: d.auto_frequency_hours,
            scheduled_time_of_day: d.scheduled_time_of_day,
            updated_at: 0,
        }
    }

    pub fn default_tank(&self) -> TankLevel {
        TankLevel::full(self.tank.capacity_liters, self.tank.low_threshold_pct)
    }

    pub fn machine_settings(&self) -> Result<MachineSettings> {
        Ok(MachineSettings {
            nominal_flow_lpm: self.engine.nominal_flow_lpm,
            utc_offset: self.utc_offset()?,
            defaults: self.default_irrigation(),
            default_tank: self.default_tank(),
        })
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            poll_every: Duration::from_secs(self.engine.poll_interval_sec),
            tick_every: Duration::from_secs(self.engine.tick_interval_sec),
            confirmation_timeout_secs: self.engine.confirmation_timeout_sec,
            resend_on_stale: self.engine.resend_on_stale,
        }
    }
}

/// Checks applied both to the seeded defaults and to every operator save.
pub fn check_irrigation(cycle_duration_minutes: u32, auto_frequency_hours: u32) -> Vec<String> {
    let mut errors = Vec::new();
    if cycle_duration_minutes == 0 || cycle_duration_minutes > MAX_CYCLE_MINUTES {
        errors.push(format!(
            "cycle_duration_minutes {cycle_duration_minutes} out of range [1, {MAX_CYCLE_MINUTES}]"
        ));
    }
    if auto_frequency_hours == 0 {
        errors.push("auto_frequency_hours must be positive".into());
    }
    errors
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file means
/// built-in defaults.
pub fn load(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        tracing::warn!(%path, "config file not found, using defaults");
        let config = Config::default();
        config.validate()?;
        return Ok(config);
    }

    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        poll_interval_sec = config.engine.poll_interval_sec,
        nominal_flow_lpm = config.engine.nominal_flow_lpm,
        capacity_liters = config.tank.capacity_liters,
        "config loaded"
    );
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
