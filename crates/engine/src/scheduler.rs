//! Mode state machine and the task that drives it.
//!
//! `ModeMachine` owns the cycle timer, the scheduled-mode marker and the
//! local tank level. It is advanced by three inputs: the 1 Hz tick, the
//! evaluator poll, and changes to `irrigationConfig`. Operator actions reach
//! it through `SchedulerHandle`, which applies `can_mutate` before anything
//! is sent to the machine.
//!
//! ```text
//! Idle ──[StartCycle | operator on]──▶ Watering
//!  ▲                                      │
//!  └─[elapsed | tank empty | operator off | active=false | mode change]
//! ```

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use time::UtcOffset;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::access::{can_mutate, Role};
use crate::cycle::{CycleTimer, EndReason, Finished, TickOutcome};
use crate::db::{Db, WateringEvent};
use crate::evaluator::{self, Decision, ScheduledEvaluator, Skip, Snapshot};
use crate::model::{now_unix, IrrigationConfig, LastAutoTriggerMark, Mode, TankLevel};
use crate::reconciler::{self, Reconciler};
use crate::state::SharedState;
use crate::store::{self, keys, Store, StoreError};
use crate::valve::ValveChannel;

/// While watering, the tank level is written back at most this often.
const TANK_PERSIST_EVERY_SECS: i64 = 15;

/// Pending operator requests before `submit` waits.
const REQUEST_BUFFER: usize = 16;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MachineSettings {
    pub nominal_flow_lpm: f64,
    pub utc_offset: UtcOffset,
    /// Written to the store when it holds no `irrigationConfig`.
    pub defaults: IrrigationConfig,
    /// Written to the store when it holds no `tankLevel`.
    pub default_tank: TankLevel,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub poll_every: Duration,
    pub tick_every: Duration,
    pub confirmation_timeout_secs: i64,
    pub resend_on_stale: bool,
}

// ---------------------------------------------------------------------------
// Operator boundary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum OperatorCommand {
    Switch { on: bool },
    SaveConfig(IrrigationConfig),
    /// `None` fills the tank to capacity.
    RefillTank { liters: Option<f64> },
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("role '{0}' may not change irrigation settings")]
    Forbidden(Role),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Unavailable(#[from] StoreError),
    #[error("engine stopped")]
    EngineStopped,
}

// ---------------------------------------------------------------------------
// Mode machine
// ---------------------------------------------------------------------------

pub struct ModeMachine<S: Store> {
    store: S,
    timer: CycleTimer<S>,
    scheduled: ScheduledEvaluator,
    settings: MachineSettings,
    config: Option<IrrigationConfig>,
    tank: TankLevel,
    /// Local tank changes not yet written to the store.
    tank_dirty: bool,
    tank_saved_at: i64,
    shared: SharedState,
    db: Option<Db>,
}

impl<S: Store> ModeMachine<S> {
    pub fn new(store: S, shared: SharedState, settings: MachineSettings, db: Option<Db>) -> Self {
        let timer = CycleTimer::new(ValveChannel::new(store.clone()), settings.nominal_flow_lpm);
        let tank = settings.default_tank;
        Self {
            store,
            timer,
            scheduled: ScheduledEvaluator::default(),
            settings,
            config: None,
            tank,
            tank_dirty: false,
            tank_saved_at: 0,
            shared,
            db,
        }
    }

    #[cfg(test)]
    pub fn is_watering(&self) -> bool {
        self.timer.is_running()
    }

    #[cfg(test)]
    pub fn tank(&self) -> TankLevel {
        self.tank
    }

    /// Startup: pick up the stored tank level and run the first evaluation.
    pub async fn mount(&mut self, now: i64) -> Decision {
        info!(
            flow_lpm = self.settings.nominal_flow_lpm,
            utc_offset = %self.settings.utc_offset,
            "mode machine mounted"
        );
        self.shared
            .write()
            .await
            .record_system(now, "engine started".into());
        self.poll(now).await
    }

    // -----------------------------------------------------------------------
    // Evaluation
    // -----------------------------------------------------------------------

    /// One evaluator pass. Store failures skip the pass without side effects.
    pub async fn poll(&mut self, now: i64) -> Decision {
        let config = match self.load_config(now).await {
            Ok(c) => c,
            Err(e) => {
                warn!("poll skipped: {e}");
                return self.skip(now, None, Skip::StoreUnavailable, "").await;
            }
        };
        self.set_store_available(true).await;
        self.apply_config(config.clone(), now).await;

        if !self.timer.is_running() {
            self.sync_tank(now).await;
            self.close_stray_valve(now, &config).await;
        }

        let last_auto_trigger = if config.mode == Mode::Automatic {
            match store::read::<_, LastAutoTriggerMark>(&self.store, keys::LAST_AUTO_TRIGGER_MARK)
                .await
            {
                Ok(mark) => mark,
                Err(e) => {
                    warn!("poll skipped, trigger mark unreadable: {e}");
                    return self
                        .skip(now, Some(config.mode), Skip::StoreUnavailable, "")
                        .await;
                }
            }
        } else {
            None
        };

        let snap = Snapshot {
            config: config.clone(),
            last_auto_trigger,
            watering: self.timer.is_running(),
            tank_empty: self.tank.is_empty(),
        };

        let decision = evaluator::evaluate(now, self.settings.utc_offset, &snap, &self.scheduled);
        let decision = match decision {
            Decision::StartCycle => self.start_triggered(now, &config, last_auto_trigger).await,
            Decision::NoAction(skip) => self.skip(now, Some(config.mode), skip, "").await,
        };
        self.publish().await;
        decision
    }

    /// Fence then actuate. For automatic mode the trigger mark is written
    /// before the valve opens; if that write fails nothing starts.
    async fn start_triggered(
        &mut self,
        now: i64,
        config: &IrrigationConfig,
        previous: Option<LastAutoTriggerMark>,
    ) -> Decision {
        let reason = match config.mode {
            Mode::Automatic => {
                let mark = LastAutoTriggerMark {
                    timestamp: previous.map_or(now, |m| m.timestamp.max(now)),
                };
                if let Err(e) = store::write(&self.store, keys::LAST_AUTO_TRIGGER_MARK, &mark).await
                {
                    warn!("trigger mark write failed, not starting: {e}");
                    return self
                        .skip(now, Some(config.mode), Skip::StoreUnavailable, "trigger mark write")
                        .await;
                }
                match previous {
                    Some(p) => format!("due, last trigger {}s ago", now - p.timestamp),
                    None => "first automatic trigger".to_string(),
                }
            }
            Mode::Scheduled => {
                self.scheduled.mark_fired(now);
                format!("scheduled time {} reached", config.scheduled_time_of_day)
            }
            Mode::Manual => return self.skip(now, Some(config.mode), Skip::ManualMode, "").await,
        };

        match self
            .timer
            .start(now, config.cycle_duration_minutes, config.mode, &self.tank)
            .await
        {
            Ok(session) => {
                self.log_decision(now, Some(config.mode), Decision::StartCycle, &reason)
                    .await;
                self.shared.write().await.record_cycle(
                    now,
                    format!(
                        "{} cycle started for {}s ({reason})",
                        session.trigger, session.duration_seconds
                    ),
                );
                Decision::StartCycle
            }
            Err(skip) => self.skip(now, Some(config.mode), skip, "start refused").await,
        }
    }

    async fn skip(&mut self, now: i64, mode: Option<Mode>, skip: Skip, context: &str) -> Decision {
        if skip == Skip::StoreUnavailable {
            self.set_store_available(false).await;
        }
        let decision = Decision::NoAction(skip);
        self.log_decision(now, mode, decision, context).await;
        decision
    }

    // -----------------------------------------------------------------------
    // Config
    // -----------------------------------------------------------------------

    /// Current config from the store. An empty store gets the defaults.
    async fn load_config(&mut self, now: i64) -> Result<IrrigationConfig, StoreError> {
        if let Some(config) = store::read(&self.store, keys::IRRIGATION_CONFIG).await? {
            return Ok(config);
        }
        let mut config = self.settings.defaults.clone();
        config.updated_at = now;
        store::write(&self.store, keys::IRRIGATION_CONFIG, &config).await?;
        info!(mode = %config.mode, active = config.active, "seeded default irrigation config");
        self.shared
            .write()
            .await
            .record_system(now, format!("seeded default config ({} mode)", config.mode));
        Ok(config)
    }

    /// Take a new config and cancel a running cycle it no longer allows.
    async fn apply_config(&mut self, config: IrrigationConfig, now: i64) {
        if let Some(session) = self.timer.session().copied() {
            let reason = if !config.active {
                Some(EndReason::Deactivated)
            } else if config.mode != session.trigger {
                Some(EndReason::ModeChanged)
            } else {
                None
            };
            if let Some(reason) = reason {
                if let Some(finished) = self.timer.terminate(now, reason).await {
                    self.finish(finished).await;
                }
            }
        }
        if self.config.as_ref().map(|c| c.mode) != Some(config.mode) {
            debug!(mode = %config.mode, "mode applied");
        }
        self.config = Some(config);
    }

    /// Someone wrote `irrigationConfig`. The store is re-read so an older
    /// notification can never undo a newer write.
    pub async fn on_config_change(&mut self, value: Value, now: i64) {
        let config = match store::read::<_, IrrigationConfig>(&self.store, keys::IRRIGATION_CONFIG)
            .await
        {
            Ok(Some(c)) => c,
            Ok(None) => return,
            Err(e) => match serde_json::from_value(value) {
                Ok(c) => {
                    debug!("config re-read failed, using notification: {e}");
                    c
                }
                Err(parse) => {
                    warn!("ignoring config change: {e}; payload: {parse}");
                    return;
                }
            },
        };
        self.apply_config(config.clone(), now).await;
        self.close_stray_valve(now, &config).await;
        self.publish().await;
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    pub async fn tick(&mut self, now: i64, elapsed_secs: u32) -> TickOutcome {
        let outcome = self.timer.tick(now, elapsed_secs, &mut self.tank).await;
        match outcome {
            TickOutcome::Finished(finished) => self.finish(finished).await,
            TickOutcome::Running { .. } => {
                self.tank_dirty = true;
                if now - self.tank_saved_at >= TANK_PERSIST_EVERY_SECS {
                    self.persist_tank(now).await;
                }
            }
            TickOutcome::Idle => {}
        }
        self.publish().await;
        outcome
    }

    async fn finish(&mut self, f: Finished) {
        self.tank_dirty = true;
        {
            let mut st = self.shared.write().await;
            st.record_cycle(
                f.ended_at,
                format!(
                    "{} cycle ended ({}) after {}s, {:.2} L used",
                    f.session.trigger,
                    f.reason,
                    f.session.elapsed_seconds(),
                    f.liters_used
                ),
            );
            if f.reason == EndReason::TankEmpty {
                st.record_warning(f.ended_at, "tank empty, valve closed".into());
            }
        }
        self.persist_tank(f.ended_at).await;

        if let Some(db) = &self.db {
            let event = WateringEvent {
                ts_start: f.session.started_at,
                ts_end: f.ended_at,
                trigger_mode: f.session.trigger.to_string(),
                outcome: f.reason.to_string(),
                liters_used: f.liters_used,
            };
            if let Err(e) = db.insert_watering_event(&event).await {
                warn!("failed to record watering event: {e:#}");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Tank
    // -----------------------------------------------------------------------

    /// Adopt the stored level while idle, unless local changes are pending.
    async fn sync_tank(&mut self, now: i64) {
        if self.tank_dirty {
            self.persist_tank(now).await;
            return;
        }
        match store::read::<_, TankLevel>(&self.store, keys::TANK_LEVEL).await {
            Ok(Some(t)) => self.tank = t.clamped(),
            Ok(None) => {
                self.tank = self.settings.default_tank;
                self.tank_dirty = true;
                self.persist_tank(now).await;
            }
            Err(e) => warn!("tank level unreadable, keeping local value: {e}"),
        }
    }

    async fn persist_tank(&mut self, now: i64) {
        match store::write(&self.store, keys::TANK_LEVEL, &self.tank).await {
            Ok(()) => {
                self.tank_dirty = false;
                self.tank_saved_at = now;
            }
            Err(e) => warn!("tank level write failed, will retry: {e}"),
        }
    }

    /// Close an open valve this machine is not running a cycle for, when
    /// nothing could justify it: irrigation is off, the tank is dry, or the
    /// command is older than any cycle could last (its engine went away
    /// mid-cycle). A recent open command under an active config may belong
    /// to another engine and is left alone.
    async fn close_stray_valve(&mut self, now: i64, config: &IrrigationConfig) {
        if self.timer.is_running() {
            return;
        }
        let cmd = match self.timer.stored_command().await {
            Ok(Some(cmd)) if cmd.open => cmd,
            _ => return,
        };
        let longest = i64::from(config.cycle_duration_minutes) * 60;
        let why = if !config.active {
            "irrigation inactive"
        } else if self.tank.is_empty() {
            "tank empty"
        } else if now - cmd.issued_at >= longest {
            "left open by a previous run"
        } else {
            return;
        };
        warn!(issued_at = cmd.issued_at, why, "closing stray open valve");
        self.timer.force_close(now).await;
        self.shared
            .write()
            .await
            .record_warning(now, format!("closed open valve ({why})"));
    }

    // -----------------------------------------------------------------------
    // Operator actions
    // -----------------------------------------------------------------------

    /// Apply an operator action. The role check happens in `SchedulerHandle`.
    pub async fn handle(&mut self, cmd: OperatorCommand, now: i64) -> Result<(), CommandError> {
        let result = match cmd {
            OperatorCommand::Switch { on: true } => self.switch_on(now).await,
            OperatorCommand::Switch { on: false } => self.switch_off(now).await,
            OperatorCommand::SaveConfig(config) => self.save_config(config, now).await,
            OperatorCommand::RefillTank { liters } => self.refill(liters, now).await,
        };
        self.publish().await;
        result
    }

    async fn switch_on(&mut self, now: i64) -> Result<(), CommandError> {
        let mut config = self.load_config(now).await?;
        if config.mode != Mode::Manual {
            return Err(CommandError::Rejected(format!(
                "switch is only available in manual mode (mode is {})",
                config.mode
            )));
        }
        if self.timer.is_running() {
            return Err(CommandError::Rejected(Skip::AlreadyWatering.to_string()));
        }
        if self.tank.is_empty() {
            return Err(CommandError::Rejected(Skip::TankEmpty.to_string()));
        }

        if !config.active {
            config.active = true;
            config.updated_at = now;
            store::write(&self.store, keys::IRRIGATION_CONFIG, &config).await?;
        }
        self.apply_config(config.clone(), now).await;

        let session = self
            .timer
            .start(now, config.cycle_duration_minutes, Mode::Manual, &self.tank)
            .await
            .map_err(|skip| CommandError::Rejected(skip.to_string()))?;

        self.log_decision(now, Some(Mode::Manual), Decision::StartCycle, "operator switch on")
            .await;
        self.shared.write().await.record_cycle(
            now,
            format!("manual cycle started for {}s", session.duration_seconds),
        );
        Ok(())
    }

    /// Cancels whatever is running. In manual mode the switch also drops
    /// `active`; in the timed modes it leaves the schedule alone.
    async fn switch_off(&mut self, now: i64) -> Result<(), CommandError> {
        if let Some(finished) = self.timer.terminate(now, EndReason::SwitchedOff).await {
            self.finish(finished).await;
        }

        if let Some(mut config) = self.config.clone() {
            if config.mode == Mode::Manual && config.active {
                config.active = false;
                config.updated_at = now;
                store::write(&self.store, keys::IRRIGATION_CONFIG, &config).await?;
                self.config = Some(config);
            }
        }
        Ok(())
    }

    async fn save_config(
        &mut self,
        mut config: IrrigationConfig,
        now: i64,
    ) -> Result<(), CommandError> {
        let errors = crate::config::check_irrigation(
            config.cycle_duration_minutes,
            config.auto_frequency_hours,
        );
        if !errors.is_empty() {
            return Err(CommandError::Rejected(errors.join("; ")));
        }

        config.updated_at = now;
        store::write(&self.store, keys::IRRIGATION_CONFIG, &config).await?;
        info!(mode = %config.mode, active = config.active, "irrigation config saved");
        self.shared.write().await.record_system(
            now,
            format!(
                "config saved ({} mode, {})",
                config.mode,
                if config.active { "active" } else { "inactive" }
            ),
        );
        self.apply_config(config, now).await;
        Ok(())
    }

    async fn refill(&mut self, liters: Option<f64>, now: i64) -> Result<(), CommandError> {
        if let Some(l) = liters {
            if !l.is_finite() || l <= 0.0 {
                return Err(CommandError::Rejected(format!(
                    "refill amount must be positive, got {l}"
                )));
            }
        }
        self.tank.refill(liters);
        store::write(&self.store, keys::TANK_LEVEL, &self.tank).await?;
        self.tank_dirty = false;
        self.tank_saved_at = now;

        info!(liters = self.tank.current_liters, "tank refilled");
        self.shared.write().await.record_system(
            now,
            format!(
                "tank refilled to {:.1} L ({:.0}%)",
                self.tank.current_liters,
                self.tank.percent()
            ),
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Observability
    // -----------------------------------------------------------------------

    /// Ring buffer always; SQLite only when the reason changed.
    async fn log_decision(&self, now: i64, mode: Option<Mode>, decision: Decision, context: &str) {
        let entry = {
            let mut st = self.shared.write().await;
            let repeat = matches!(decision, Decision::NoAction(skip) if st.last_skip_was(skip));
            st.record_decision(now, mode, decision, context);
            if repeat {
                None
            } else {
                st.decisions.back().cloned()
            }
        };

        if let (Some(db), Some(entry)) = (&self.db, entry) {
            if let Err(e) = db.insert_decision(&entry).await {
                warn!("failed to record decision: {e:#}");
            }
        }
    }

    async fn set_store_available(&self, available: bool) {
        let mut st = self.shared.write().await;
        if st.store_available != available {
            if available {
                st.record_system(now_unix(), "store available".into());
            } else {
                st.record_error(now_unix(), "store unavailable".into());
            }
        }
        st.store_available = available;
    }

    async fn publish(&self) {
        let mut st = self.shared.write().await;
        st.config = self.config.clone();
        st.cycle = self.timer.session().copied();
        st.tank = Some(self.tank);
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct Request {
    cmd: OperatorCommand,
    reply: oneshot::Sender<Result<(), CommandError>>,
}

/// Cloneable entry point for operator actions.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Request>,
}

impl SchedulerHandle {
    pub async fn submit(&self, role: Role, cmd: OperatorCommand) -> Result<(), CommandError> {
        if !can_mutate(role) {
            warn!(%role, ?cmd, "operator action forbidden");
            return Err(CommandError::Forbidden(role));
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request { cmd, reply })
            .await
            .map_err(|_| CommandError::EngineStopped)?;
        rx.await.map_err(|_| CommandError::EngineStopped)?
    }
}

/// Owns the machine task and the reconciler task. Dropping it stops both.
pub struct Scheduler {
    handle: SchedulerHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn spawn<S: Store>(machine: ModeMachine<S>, settings: SchedulerSettings) -> Self {
        let (tx, rx) = mpsc::channel(REQUEST_BUFFER);

        let reconciler = tokio::spawn(reconciler::run(
            machine.store.clone(),
            machine.shared.clone(),
            Reconciler::new(settings.confirmation_timeout_secs),
            settings.resend_on_stale,
            settings.tick_every,
        ));
        let machine = tokio::spawn(drive(machine, rx, settings));

        Self {
            handle: SchedulerHandle { tx },
            tasks: vec![machine, reconciler],
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Stop both tasks and wait for them to wind down.
    pub async fn shutdown(mut self) {
        for task in std::mem::take(&mut self.tasks) {
            task.abort();
            let _ = task.await;
        }
        info!("scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn drive<S: Store>(
    mut machine: ModeMachine<S>,
    mut requests: mpsc::Receiver<Request>,
    settings: SchedulerSettings,
) {
    // Subscribe before the first read so no change slips between them.
    let mut config_changes = machine.store.subscribe(keys::IRRIGATION_CONFIG);
    machine.mount(now_unix()).await;

    let tick_secs = u32::try_from(settings.tick_every.as_secs())
        .unwrap_or(u32::MAX)
        .max(1);
    // Missed ticks burst so the countdown and the drain keep wall-clock pace.
    let mut ticker = interval_at(Instant::now() + settings.tick_every, settings.tick_every);
    let mut poller = interval(settings.poll_every);
    poller.set_missed_tick_behavior(MissedTickBehavior::Skip);
    poller.tick().await;

    info!(
        poll_sec = settings.poll_every.as_secs(),
        tick_sec = tick_secs,
        "scheduler started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                machine.tick(now_unix(), tick_secs).await;
            }
            _ = poller.tick() => {
                machine.poll(now_unix()).await;
            }
            Some(value) = config_changes.next() => {
                machine.on_config_change(value, now_unix()).await;
            }
            req = requests.recv() => match req {
                Some(Request { cmd, reply }) => {
                    let result = machine.handle(cmd, now_unix()).await;
                    let _ = reply.send(result);
                }
                None => break,
            },
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ValveCommand;
    use crate::state::{self, EventKind};
    use crate::store::MemoryStore;
    use serde_json::json;

    const T: i64 = 1_750_000_000;
    /// 2024-06-01T06:30:00Z
    const AT_0630: i64 = 1_717_223_400;

    fn irrigation(mode: Mode, active: bool) -> IrrigationConfig {
        IrrigationConfig {
            mode,
            active,
            cycle_duration_minutes: 20,
            auto_frequency_hours: 12,
            scheduled_time_of_day: "06:30".parse().unwrap(),
            updated_at: 0,
        }
    }

    fn settings(flow_lpm: f64, tank: TankLevel) -> MachineSettings {
        MachineSettings {
            nominal_flow_lpm: flow_lpm,
            utc_offset: UtcOffset::UTC,
            defaults: irrigation(Mode::Manual, false),
            default_tank: tank,
        }
    }

    fn machine(store: &MemoryStore) -> ModeMachine<MemoryStore> {
        ModeMachine::new(
            store.clone(),
            state::shared(),
            settings(1.0, TankLevel::full(100.0, 20.0)),
            None,
        )
    }

    async fn seed(store: &MemoryStore, config: &IrrigationConfig) {
        store::write(store, keys::IRRIGATION_CONFIG, config)
            .await
            .unwrap();
    }

    async fn stored_config(store: &MemoryStore) -> IrrigationConfig {
        store::read(store, keys::IRRIGATION_CONFIG)
            .await
            .unwrap()
            .unwrap()
    }

    async fn commanded(store: &MemoryStore) -> Option<bool> {
        store::read::<_, ValveCommand>(store, keys::VALVE_COMMAND)
            .await
            .unwrap()
            .map(|c| c.open)
    }

    async fn marks(store: &MemoryStore) -> Vec<i64> {
        store
            .writes(keys::LAST_AUTO_TRIGGER_MARK)
            .await
            .iter()
            .map(|v| v["timestamp"].as_i64().unwrap())
            .collect()
    }

    // -- Automatic --------------------------------------------------------

    #[tokio::test]
    async fn automatic_spacing_survives_restart() {
        let store = MemoryStore::new();
        seed(&store, &irrigation(Mode::Automatic, true)).await;

        let mut first = machine(&store);
        assert_eq!(first.mount(T).await, Decision::StartCycle);
        drop(first);

        let mut second = machine(&store);
        assert!(matches!(
            second.mount(T + 60).await,
            Decision::NoAction(Skip::NotDue { .. })
        ));
        assert!(matches!(
            second.poll(T + 11 * 3600).await,
            Decision::NoAction(Skip::NotDue { .. })
        ));
        assert_eq!(second.poll(T + 12 * 3600).await, Decision::StartCycle);

        let marks = marks(&store).await;
        assert_eq!(marks, vec![T, T + 12 * 3600]);
    }

    #[tokio::test]
    async fn second_engine_sees_the_mark() {
        let store = MemoryStore::new();
        seed(&store, &irrigation(Mode::Automatic, true)).await;

        let mut a = machine(&store);
        let mut b = machine(&store);
        assert_eq!(a.poll(T).await, Decision::StartCycle);
        assert!(matches!(
            b.poll(T + 1).await,
            Decision::NoAction(Skip::NotDue { .. })
        ));
        assert_eq!(marks(&store).await.len(), 1);
        assert!(!b.is_watering());
    }

    #[tokio::test]
    async fn mark_write_failure_starts_nothing() {
        let store = MemoryStore::new();
        seed(&store, &irrigation(Mode::Automatic, true)).await;
        store.fail_writes_to(Some(keys::LAST_AUTO_TRIGGER_MARK)).await;

        let mut m = machine(&store);
        assert_eq!(
            m.poll(T).await,
            Decision::NoAction(Skip::StoreUnavailable)
        );
        assert!(!m.is_watering());
        assert!(commanded(&store).await.is_none());
    }

    #[tokio::test]
    async fn mark_never_moves_backwards() {
        let store = MemoryStore::new();
        seed(&store, &irrigation(Mode::Automatic, true)).await;
        store::write(
            &store,
            keys::LAST_AUTO_TRIGGER_MARK,
            &LastAutoTriggerMark { timestamp: T - 13 * 3600 },
        )
        .await
        .unwrap();

        let mut m = machine(&store);
        assert_eq!(m.poll(T).await, Decision::StartCycle);
        assert_eq!(marks(&store).await.last(), Some(&T));
    }

    #[tokio::test]
    async fn store_unavailable_skips_poll() {
        let store = MemoryStore::new();
        seed(&store, &irrigation(Mode::Automatic, true)).await;
        store.set_unavailable(true);

        let mut m = machine(&store);
        assert_eq!(
            m.poll(T).await,
            Decision::NoAction(Skip::StoreUnavailable)
        );
        assert!(!m.is_watering());

        let st = m.shared.read().await;
        assert!(!st.store_available);
        assert_eq!(st.decisions.back().unwrap().reason, "store unavailable");
    }

    #[tokio::test]
    async fn empty_store_is_seeded_with_defaults() {
        let store = MemoryStore::new();
        let mut m = machine(&store);
        assert_eq!(
            m.mount(T).await,
            Decision::NoAction(Skip::ManualMode)
        );

        let config = stored_config(&store).await;
        assert_eq!(config.mode, Mode::Manual);
        assert_eq!(config.updated_at, T);
        let tank: TankLevel = store::read(&store, keys::TANK_LEVEL).await.unwrap().unwrap();
        assert_eq!(tank.current_liters, 100.0);
    }

    // -- Scheduled --------------------------------------------------------

    #[tokio::test]
    async fn scheduled_fires_once_in_its_minute() {
        let store = MemoryStore::new();
        seed(&store, &irrigation(Mode::Scheduled, true)).await;
        let mut m = machine(&store);

        assert_eq!(m.poll(AT_0630 + 5).await, Decision::StartCycle);
        // Operator cuts the cycle short; the minute must still not refire.
        m.handle(OperatorCommand::Switch { on: false }, AT_0630 + 20)
            .await
            .unwrap();
        assert_eq!(
            m.poll(AT_0630 + 45).await,
            Decision::NoAction(Skip::AlreadyFiredThisMinute)
        );
        assert!(stored_config(&store).await.active);
    }

    // -- Cancellation -----------------------------------------------------

    #[tokio::test]
    async fn mode_switch_cancels_running_cycle() {
        let store = MemoryStore::new();
        seed(&store, &irrigation(Mode::Automatic, true)).await;
        let mut m = machine(&store);
        m.poll(T).await;
        assert!(m.is_watering());

        m.handle(
            OperatorCommand::SaveConfig(irrigation(Mode::Manual, true)),
            T + 30,
        )
        .await
        .unwrap();
        assert!(!m.is_watering());
        assert_eq!(commanded(&store).await, Some(false));
        assert!(m
            .shared
            .read()
            .await
            .events
            .iter()
            .any(|e| e.detail.contains("mode changed")));
    }

    #[tokio::test]
    async fn deactivation_from_another_client_cancels() {
        let store = MemoryStore::new();
        seed(&store, &irrigation(Mode::Automatic, true)).await;
        let mut m = machine(&store);
        m.poll(T).await;
        assert!(m.is_watering());

        let off = irrigation(Mode::Automatic, false);
        seed(&store, &off).await;
        m.on_config_change(serde_json::to_value(&off).unwrap(), T + 5)
            .await;

        assert!(!m.is_watering());
        assert_eq!(commanded(&store).await, Some(false));
    }

    #[tokio::test]
    async fn stale_notification_does_not_undo_newer_config() {
        let store = MemoryStore::new();
        seed(&store, &irrigation(Mode::Manual, false)).await;
        let mut m = machine(&store);
        m.poll(T).await;

        m.handle(OperatorCommand::Switch { on: true }, T + 1)
            .await
            .unwrap();
        // An old "inactive" notification arriving late.
        m.on_config_change(json!(irrigation(Mode::Manual, false)), T + 2)
            .await;
        assert!(m.is_watering());
    }

    // -- Tank -------------------------------------------------------------

    #[tokio::test]
    async fn valve_closes_on_the_tick_the_tank_runs_dry() {
        let store = MemoryStore::new();
        seed(&store, &irrigation(Mode::Manual, false)).await;
        let mut m = ModeMachine::new(
            store.clone(),
            state::shared(),
            settings(60.0, TankLevel::full(3.0, 20.0)),
            None,
        );
        m.mount(T).await;
        m.handle(OperatorCommand::Switch { on: true }, T).await.unwrap();

        assert!(matches!(m.tick(T + 1, 1).await, TickOutcome::Running { .. }));
        assert!(matches!(m.tick(T + 2, 1).await, TickOutcome::Running { .. }));
        match m.tick(T + 3, 1).await {
            TickOutcome::Finished(f) => assert_eq!(f.reason, EndReason::TankEmpty),
            other => panic!("expected finished, got {other:?}"),
        }
        assert_eq!(commanded(&store).await, Some(false));

        let tank: TankLevel = store::read(&store, keys::TANK_LEVEL).await.unwrap().unwrap();
        assert!(tank.is_empty());
        assert!(m
            .shared
            .read()
            .await
            .events
            .iter()
            .any(|e| e.kind == EventKind::Warning && e.detail.contains("tank empty")));
    }

    #[tokio::test]
    async fn empty_tank_blocks_switch_on_until_refill() {
        let store = MemoryStore::new();
        seed(&store, &irrigation(Mode::Manual, false)).await;
        let mut empty = TankLevel::full(50.0, 20.0);
        empty.drain(50.0);
        store::write(&store, keys::TANK_LEVEL, &empty).await.unwrap();

        let mut m = machine(&store);
        m.mount(T).await;
        assert!(matches!(
            m.handle(OperatorCommand::Switch { on: true }, T).await,
            Err(CommandError::Rejected(_))
        ));

        m.handle(OperatorCommand::RefillTank { liters: None }, T + 1)
            .await
            .unwrap();
        assert_eq!(m.tank().current_liters, 50.0);
        m.handle(OperatorCommand::Switch { on: true }, T + 2)
            .await
            .unwrap();
        assert!(m.is_watering());
    }

    #[tokio::test]
    async fn refill_rejects_non_positive_amounts() {
        let store = MemoryStore::new();
        let mut m = machine(&store);
        for bad in [0.0, -5.0, f64::NAN] {
            assert!(matches!(
                m.handle(OperatorCommand::RefillTank { liters: Some(bad) }, T)
                    .await,
                Err(CommandError::Rejected(_))
            ));
        }
    }

    // -- Manual switch ----------------------------------------------------

    #[tokio::test]
    async fn manual_switch_drives_active_flag() {
        let store = MemoryStore::new();
        seed(&store, &irrigation(Mode::Manual, false)).await;
        let mut m = machine(&store);
        m.mount(T).await;

        m.handle(OperatorCommand::Switch { on: true }, T + 1)
            .await
            .unwrap();
        assert!(m.is_watering());
        assert!(stored_config(&store).await.active);
        assert_eq!(commanded(&store).await, Some(true));

        m.handle(OperatorCommand::Switch { on: false }, T + 10)
            .await
            .unwrap();
        assert!(!m.is_watering());
        assert!(!stored_config(&store).await.active);
        assert_eq!(commanded(&store).await, Some(false));
    }

    #[tokio::test]
    async fn switch_on_rejected_outside_manual_mode() {
        let store = MemoryStore::new();
        seed(&store, &irrigation(Mode::Scheduled, true)).await;
        let mut m = machine(&store);

        let err = m
            .handle(OperatorCommand::Switch { on: true }, T)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("manual mode"), "{err}");
        assert!(!m.is_watering());
    }

    #[tokio::test]
    async fn second_switch_on_is_refused() {
        let store = MemoryStore::new();
        seed(&store, &irrigation(Mode::Manual, true)).await;
        let mut m = machine(&store);
        m.handle(OperatorCommand::Switch { on: true }, T).await.unwrap();
        assert!(matches!(
            m.handle(OperatorCommand::Switch { on: true }, T + 1).await,
            Err(CommandError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let store = MemoryStore::new();
        let mut m = machine(&store);
        let mut bad = irrigation(Mode::Automatic, true);
        bad.cycle_duration_minutes = 0;
        bad.auto_frequency_hours = 0;

        let err = m
            .handle(OperatorCommand::SaveConfig(bad), T)
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cycle_duration_minutes"), "{msg}");
        assert!(msg.contains("auto_frequency_hours"), "{msg}");
        assert!(store.writes(keys::IRRIGATION_CONFIG).await.is_empty());
    }

    #[tokio::test]
    async fn save_config_fails_when_store_is_down() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let mut m = machine(&store);
        assert!(matches!(
            m.handle(
                OperatorCommand::SaveConfig(irrigation(Mode::Automatic, true)),
                T
            )
            .await,
            Err(CommandError::Unavailable(_))
        ));
    }

    // -- Abandoned valve --------------------------------------------------

    #[tokio::test]
    async fn abandoned_open_valve_is_closed() {
        let store = MemoryStore::new();
        seed(&store, &irrigation(Mode::Manual, false)).await;
        ValveChannel::new(store.clone())
            .issue(true, T - 3600)
            .await
            .unwrap();

        let mut m = machine(&store);
        m.mount(T).await;
        assert_eq!(commanded(&store).await, Some(false));
    }

    #[tokio::test]
    async fn open_valve_is_closed_at_once_when_inactive() {
        let store = MemoryStore::new();
        seed(&store, &irrigation(Mode::Automatic, false)).await;
        ValveChannel::new(store.clone())
            .issue(true, T - 60)
            .await
            .unwrap();

        let mut m = machine(&store);
        m.mount(T).await;
        assert_eq!(commanded(&store).await, Some(false));
        assert!(m
            .shared
            .read()
            .await
            .events
            .iter()
            .any(|e| e.kind == EventKind::Warning && e.detail.contains("irrigation inactive")));
    }

    #[tokio::test]
    async fn open_valve_is_closed_at_once_when_tank_is_empty() {
        let store = MemoryStore::new();
        seed(&store, &irrigation(Mode::Automatic, true)).await;
        let mut empty = TankLevel::full(100.0, 20.0);
        empty.drain(100.0);
        store::write(&store, keys::TANK_LEVEL, &empty).await.unwrap();
        ValveChannel::new(store.clone())
            .issue(true, T - 60)
            .await
            .unwrap();

        let mut m = machine(&store);
        m.mount(T).await;
        assert_eq!(commanded(&store).await, Some(false));
    }

    #[tokio::test]
    async fn deactivation_closes_valve_opened_elsewhere() {
        let store = MemoryStore::new();
        seed(&store, &irrigation(Mode::Automatic, true)).await;
        store::write(
            &store,
            keys::LAST_AUTO_TRIGGER_MARK,
            &LastAutoTriggerMark { timestamp: T - 60 },
        )
        .await
        .unwrap();
        // Another engine opened the valve a minute ago.
        ValveChannel::new(store.clone())
            .issue(true, T - 60)
            .await
            .unwrap();

        let mut m = machine(&store);
        m.mount(T).await;
        assert!(!m.is_watering());
        assert_eq!(commanded(&store).await, Some(true));

        let off = irrigation(Mode::Automatic, false);
        seed(&store, &off).await;
        m.on_config_change(serde_json::to_value(&off).unwrap(), T + 1)
            .await;
        assert_eq!(commanded(&store).await, Some(false));
    }

    #[tokio::test]
    async fn recent_open_valve_from_other_engine_is_left_alone() {
        let store = MemoryStore::new();
        seed(&store, &irrigation(Mode::Manual, true)).await;
        ValveChannel::new(store.clone())
            .issue(true, T - 60)
            .await
            .unwrap();

        let mut m = machine(&store);
        m.mount(T).await;
        assert_eq!(commanded(&store).await, Some(true));
    }

    // -- Persistence ------------------------------------------------------

    #[tokio::test]
    async fn finished_cycle_is_recorded_in_db() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let store = MemoryStore::new();
        let mut cfg = irrigation(Mode::Manual, false);
        cfg.cycle_duration_minutes = 1;
        seed(&store, &cfg).await;

        let mut m = ModeMachine::new(
            store.clone(),
            state::shared(),
            settings(1.0, TankLevel::full(100.0, 20.0)),
            Some(db.clone()),
        );
        m.handle(OperatorCommand::Switch { on: true }, T).await.unwrap();
        for s in 1..=60 {
            m.tick(T + s, 1).await;
        }
        assert!(!m.is_watering());

        let events = db.recent_watering_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, "elapsed");
        assert_eq!(events[0].trigger_mode, "manual");
        assert!((events[0].liters_used - 1.0).abs() < 1e-9);

        let decisions = db.recent_decisions(10).await.unwrap();
        assert!(decisions.iter().any(|d| d.started));
    }

    #[tokio::test]
    async fn repeated_skips_are_persisted_once() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let store = MemoryStore::new();
        seed(&store, &irrigation(Mode::Manual, false)).await;
        let mut m = ModeMachine::new(
            store.clone(),
            state::shared(),
            settings(1.0, TankLevel::full(100.0, 20.0)),
            Some(db.clone()),
        );
        for i in 0..5 {
            m.poll(T + i * 60).await;
        }
        assert_eq!(m.shared.read().await.decisions.len(), 5);
        assert_eq!(db.recent_decisions(10).await.unwrap().len(), 1);
    }

    // -- Scheduler task ---------------------------------------------------

    fn fast_settings() -> SchedulerSettings {
        SchedulerSettings {
            poll_every: Duration::from_secs(60),
            tick_every: Duration::from_secs(1),
            confirmation_timeout_secs: 30,
            resend_on_stale: false,
        }
    }

    #[tokio::test]
    async fn viewer_is_forbidden() {
        let store = MemoryStore::new();
        let scheduler = Scheduler::spawn(machine(&store), fast_settings());

        let err = scheduler
            .handle()
            .submit(Role::Viewer, OperatorCommand::Switch { on: true })
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Forbidden(Role::Viewer)));
        assert!(store.writes(keys::VALVE_COMMAND).await.is_empty());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn operator_switch_goes_through_the_task() {
        let store = MemoryStore::new();
        let shared = state::shared();
        let m = ModeMachine::new(
            store.clone(),
            shared.clone(),
            settings(1.0, TankLevel::full(100.0, 20.0)),
            None,
        );
        let scheduler = Scheduler::spawn(m, fast_settings());

        scheduler
            .handle()
            .submit(Role::Operator, OperatorCommand::Switch { on: true })
            .await
            .unwrap();
        assert!(shared.read().await.cycle.is_some());
        assert_eq!(commanded(&store).await, Some(true));

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn handle_reports_stopped_engine() {
        let store = MemoryStore::new();
        let scheduler = Scheduler::spawn(machine(&store), fast_settings());
        let handle = scheduler.handle();
        scheduler.shutdown().await;

        assert!(matches!(
            handle
                .submit(Role::Admin, OperatorCommand::RefillTank { liters: None })
                .await,
            Err(CommandError::EngineStopped)
        ));
    }
}
