//! Tick scheduler: discrete time advancement with runtime controls.
//!
//! The scheduler owns the tick loop and the control state shared with the
//! command layer. Control fields are atomics plus a [`Notify`], so a
//! [`TickScheduler`] behind an [`Arc`](std::sync::Arc) can be paused,
//! resumed, slowed down, or stopped from any task while the loop runs.
//!
//! # State machine
//!
//! ```text
//! Stopped --start--> Running --pause--> Paused
//!    ^                  |  <--resume--    |
//!    +------stop--------+-------stop------+
//! ```
//!
//! `Stopped` is terminal: once a run ends, the scheduler must be
//! [`reset`](TickScheduler::reset) (the orchestrator does this on
//! re-initialize) before it can start again.
//!
//! # Ticks
//!
//! One tick advances the clock by the configured simulation time,
//! increments the tick counter, sweeps every engine, and captures a
//! snapshot when the tick is a multiple of the snapshot interval. A tick
//! always completes before the next one starts, and no lock is held across
//! a tick boundary.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::config::{ConfigError, SchedulerConfig};
use crate::engine::EngineFailure;
use crate::migration::MigrationRegistry;
use crate::snapshot::{Snapshot, SnapshotHistory};
use crate::state::{StateError, WorldState};

/// Lifecycle state of the tick loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerStatus {
    /// No loop is running.
    Stopped,
    /// The loop is advancing ticks.
    Running,
    /// The loop is waiting for resume.
    Paused,
}

impl SchedulerStatus {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Running => 1,
            Self::Paused => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Paused,
            _ => Self::Stopped,
        }
    }
}

impl core::fmt::Display for SchedulerStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::Running => f.write_str("running"),
            Self::Paused => f.write_str("paused"),
        }
    }
}

/// Errors from scheduler control and tick execution.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The requested transition is not allowed from the current state.
    #[error("cannot {action} while {from}")]
    InvalidTransition {
        /// State at the time of the request.
        from: SchedulerStatus,
        /// The rejected action.
        action: &'static str,
    },

    /// The scheduler stopped and needs re-initialization.
    #[error("scheduler has stopped; re-initialize before starting again")]
    Terminated,

    /// A command was sent while no tick loop was running.
    #[error("no tick loop is running")]
    NotRunning,

    /// Neither a retained snapshot nor the live state precedes the target.
    #[error("no snapshot available at or before {target}")]
    NoSnapshotAvailable {
        /// The requested time.
        target: DateTime<Utc>,
    },

    /// A critical engine failed.
    #[error("critical engine failure: {source}")]
    EngineCritical {
        /// The failure that halted the simulation.
        #[from]
        source: EngineFailure,
    },

    /// The loop halted while executing a queued command.
    #[error("simulation halted at tick {tick}")]
    Halted {
        /// Tick at which the loop halted.
        tick: u64,
    },

    /// The world state could not be advanced, captured, or restored.
    #[error("state error: {source}")]
    State {
        /// The underlying state error.
        #[from]
        source: StateError,
    },
}

/// Outcome of one engine sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Tick the sweep ran for.
    pub tick: u64,
    /// Engines whose tick call succeeded, in execution order.
    pub executed: Vec<String>,
    /// Isolated non-critical failures.
    pub failures: Vec<EngineFailure>,
    /// Mailbox events fed to `handle_event`.
    pub events_handled: u64,
    /// `handle_event` calls that failed.
    pub handler_errors: u64,
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEnd {
    /// [`TickScheduler::stop`] was called.
    StopRequested,
    /// The configured `max_ticks` was reached.
    MaxTicksReached,
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Why the run ended.
    pub end: RunEnd,
    /// Ticks executed by the loop itself.
    pub ticks_executed: u64,
    /// Tick count when the loop ended.
    pub final_tick: u64,
    /// Simulation time when the loop ended.
    pub final_time: DateTime<Utc>,
}

/// Result of a [`jump`](TickScheduler::jump).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JumpReport {
    /// The requested time.
    pub target: DateTime<Utc>,
    /// Tick of the snapshot restored, if the live state was not usable.
    pub restored_tick: Option<u64>,
    /// Ticks executed to catch up.
    pub ticks_replayed: u64,
    /// Tick count after the jump.
    pub final_tick: u64,
    /// Simulation time after the jump. The last tick time at or before
    /// the target.
    pub final_time: DateTime<Utc>,
}

/// What the scheduler drives. Implemented by the orchestrator.
#[async_trait]
pub trait TickTarget: Send {
    /// The live world.
    fn world(&self) -> &WorldState;

    /// The live world, mutably.
    fn world_mut(&mut self) -> &mut WorldState;

    /// Migrations used to decode snapshots.
    fn migrations(&self) -> &MigrationRegistry;

    /// Swap in a restored world.
    async fn replace_world(&mut self, state: WorldState);

    /// Run every engine once. An `Err` means a critical engine failed.
    async fn sweep(&mut self, delta: TimeDelta) -> Result<SweepReport, EngineFailure>;

    /// Hand a captured snapshot to persistence.
    async fn persist(&mut self, snapshot: &Snapshot);

    /// Called after every completed tick.
    fn tick_completed(&mut self, report: &SweepReport, elapsed: Duration) {
        let _ = (report, elapsed);
    }
}

#[derive(Debug)]
enum Command {
    FastForward {
        ticks: u64,
        reply: oneshot::Sender<Result<u64, SchedulerError>>,
    },
    Jump {
        target: DateTime<Utc>,
        reply: oneshot::Sender<Result<JumpReport, SchedulerError>>,
    },
}

/// Shared tick loop control state.
#[derive(Debug)]
pub struct TickScheduler {
    status: AtomicU8,
    terminated: AtomicBool,
    halted: AtomicBool,
    stop_requested: AtomicBool,

    /// Wakes the loop on resume, stop, or a queued command.
    wake: Notify,

    /// Real-time pause between ticks (runtime-adjustable).
    tick_interval_ms: AtomicU64,

    time_per_tick: TimeDelta,
    snapshot_interval: u64,
    max_ticks: u64,
    history: Mutex<SnapshotHistory>,
    commands: Mutex<Vec<Command>>,
}

impl TickScheduler {
    /// Build a stopped scheduler from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the tick length is invalid.
    pub fn from_config(config: &SchedulerConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            status: AtomicU8::new(SchedulerStatus::Stopped.as_u8()),
            terminated: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            wake: Notify::new(),
            tick_interval_ms: AtomicU64::new(config.tick_interval_ms),
            time_per_tick: config.time_per_tick()?,
            snapshot_interval: config.snapshot_interval_ticks,
            max_ticks: config.max_ticks,
            history: Mutex::new(SnapshotHistory::new(config.snapshot_retention)),
            commands: Mutex::new(Vec::new()),
        })
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Current lifecycle state.
    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Whether the loop is paused.
    pub fn is_paused(&self) -> bool {
        self.status() == SchedulerStatus::Paused
    }

    /// Whether a critical failure halted the simulation.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Whether the scheduler must be reset before it can run again.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    fn transition(
        &self,
        from: SchedulerStatus,
        to: SchedulerStatus,
        action: &'static str,
    ) -> Result<(), SchedulerError> {
        self.status
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|current| SchedulerError::InvalidTransition {
                from: SchedulerStatus::from_u8(current),
                action,
            })
    }

    // -----------------------------------------------------------------------
    // Pause / Resume / Stop
    // -----------------------------------------------------------------------

    /// Pause a running loop. The tick in progress, if any, completes.
    pub fn pause(&self) -> Result<(), SchedulerError> {
        self.transition(SchedulerStatus::Running, SchedulerStatus::Paused, "pause")?;
        info!("Tick loop paused");
        Ok(())
    }

    /// Resume a paused loop.
    pub fn resume(&self) -> Result<(), SchedulerError> {
        self.transition(SchedulerStatus::Paused, SchedulerStatus::Running, "resume")?;
        self.wake.notify_waiters();
        info!("Tick loop resumed");
        Ok(())
    }

    /// Stop a running or paused loop. An in-flight tick finishes; no new
    /// tick starts.
    pub fn stop(&self) -> Result<(), SchedulerError> {
        let previous = self
            .status
            .swap(SchedulerStatus::Stopped.as_u8(), Ordering::AcqRel);
        if SchedulerStatus::from_u8(previous) == SchedulerStatus::Stopped {
            return Err(SchedulerError::InvalidTransition {
                from: SchedulerStatus::Stopped,
                action: "stop",
            });
        }
        self.stop_requested.store(true, Ordering::Release);
        self.terminated.store(true, Ordering::Release);
        self.wake.notify_waiters();
        info!("Tick loop stop requested");
        Ok(())
    }

    /// Mark the scheduler terminal without a running loop.
    pub(crate) fn terminate(&self) {
        self.status
            .store(SchedulerStatus::Stopped.as_u8(), Ordering::Release);
        self.terminated.store(true, Ordering::Release);
        self.wake.notify_waiters();
    }

    /// Return to a fresh `Stopped` state and forget retained snapshots.
    pub async fn reset(&self) {
        self.status
            .store(SchedulerStatus::Stopped.as_u8(), Ordering::Release);
        self.terminated.store(false, Ordering::Release);
        self.halted.store(false, Ordering::Release);
        self.stop_requested.store(false, Ordering::Release);
        self.history.lock().await.clear();
        self.abandon_commands().await;
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    /// Current real-time pause between ticks.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.load(Ordering::Acquire))
    }

    /// Change the pause between ticks. Returns the previous value. Zero
    /// runs ticks back-to-back.
    pub fn set_tick_interval(&self, interval: Duration) -> Duration {
        let ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        let previous = self.tick_interval_ms.swap(ms, Ordering::AcqRel);
        info!(previous_ms = previous, tick_interval_ms = ms, "Tick interval changed");
        Duration::from_millis(previous)
    }

    /// Simulation time advanced per tick.
    pub const fn time_per_tick(&self) -> TimeDelta {
        self.time_per_tick
    }

    /// Ticks per run before the loop stops (0 = unlimited).
    pub const fn max_ticks(&self) -> u64 {
        self.max_ticks
    }

    // -----------------------------------------------------------------------
    // Snapshot history
    // -----------------------------------------------------------------------

    /// Retain a snapshot for [`jump`](Self::jump).
    pub async fn record_snapshot(&self, snapshot: Snapshot) {
        self.history.lock().await.push(snapshot);
    }

    /// The most recent retained snapshot.
    pub async fn latest_snapshot(&self) -> Option<Snapshot> {
        self.history.lock().await.latest().cloned()
    }

    /// Ticks of retained snapshots, oldest first.
    pub async fn snapshot_ticks(&self) -> Vec<u64> {
        self.history.lock().await.ticks().collect()
    }

    /// Forget retained snapshots.
    pub async fn clear_snapshots(&self) {
        self.history.lock().await.clear();
    }

    // -----------------------------------------------------------------------
    // Tick loop
    // -----------------------------------------------------------------------

    /// Run the tick loop until stopped, bounded by `max_ticks`, or halted.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Terminated`] if the scheduler was not reset
    /// since its last run, [`SchedulerError::InvalidTransition`] if a loop
    /// is already running, and the halting error after a critical failure.
    pub async fn run<T: TickTarget + ?Sized>(
        &self,
        target: &mut T,
    ) -> Result<RunSummary, SchedulerError> {
        if self.is_terminated() {
            return Err(SchedulerError::Terminated);
        }
        self.transition(SchedulerStatus::Stopped, SchedulerStatus::Running, "start")?;
        self.stop_requested.store(false, Ordering::Release);

        info!(
            tick = target.world().tick_count(),
            tick_interval_ms = self.tick_interval_ms.load(Ordering::Acquire),
            max_ticks = self.max_ticks,
            "Tick loop starting"
        );

        let outcome = self.drive(target).await;

        self.terminate();
        self.abandon_commands().await;

        match &outcome {
            Ok(summary) => info!(
                reason = ?summary.end,
                ticks_executed = summary.ticks_executed,
                final_tick = summary.final_tick,
                "Tick loop ended"
            ),
            Err(err) => error!(error = %err, "Tick loop halted"),
        }
        outcome
    }

    async fn drive<T: TickTarget + ?Sized>(
        &self,
        target: &mut T,
    ) -> Result<RunSummary, SchedulerError> {
        let mut executed: u64 = 0;

        let end = loop {
            let wake = self.wake.notified();
            tokio::pin!(wake);
            wake.as_mut().enable();

            self.run_commands(target).await?;

            if self.stop_requested.load(Ordering::Acquire) {
                break RunEnd::StopRequested;
            }
            if self.is_paused() {
                wake.await;
                continue;
            }

            let interval = self.tick_interval();
            if interval.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    () = &mut wake => continue,
                }
            }
            if self.stop_requested.load(Ordering::Acquire) || self.is_paused() {
                continue;
            }

            self.tick_once(target).await?;
            executed = executed.saturating_add(1);

            if self.max_ticks > 0 && executed >= self.max_ticks {
                info!(
                    tick = target.world().tick_count(),
                    max_ticks = self.max_ticks,
                    "Tick limit reached"
                );
                break RunEnd::MaxTicksReached;
            }
        };

        let world = target.world();
        Ok(RunSummary {
            end,
            ticks_executed: executed,
            final_tick: world.tick_count(),
            final_time: world.current_time(),
        })
    }

    /// Execute exactly one tick. A failure halts the scheduler and leaves
    /// the world exactly as it was before the tick: clock, counter, slices,
    /// random state, and pending events.
    async fn tick_once<T: TickTarget + ?Sized>(
        &self,
        target: &mut T,
    ) -> Result<SweepReport, SchedulerError> {
        let result = self.execute_tick(target).await;
        if let Err(err) = &result {
            self.halted.store(true, Ordering::Release);
            self.terminate();
            error!(
                tick = target.world().tick_count(),
                error = %err,
                "Simulation halted"
            );
        }
        result
    }

    async fn execute_tick<T: TickTarget + ?Sized>(
        &self,
        target: &mut T,
    ) -> Result<SweepReport, SchedulerError> {
        let started = Instant::now();
        let checkpoint = target.world().clone();

        let world = target.world_mut();
        let previous_day = world.current_time().date_naive();
        world.advance_tick(self.time_per_tick)?;
        let tick = world.tick_count();
        let today = world.current_time().date_naive();
        if today != previous_day {
            info!(tick, date = %today, "Day boundary");
        }

        let report = match target.sweep(self.time_per_tick).await {
            Ok(report) => report,
            Err(failure) => {
                *target.world_mut() = checkpoint;
                return Err(failure.into());
            }
        };

        if self.snapshot_interval > 0 && tick.checked_rem(self.snapshot_interval) == Some(0) {
            let snapshot = match Snapshot::capture(target.world()) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    *target.world_mut() = checkpoint;
                    return Err(err.into());
                }
            };
            self.history.lock().await.push(snapshot.clone());
            target.persist(&snapshot).await;
            debug!(tick, bytes = snapshot.as_bytes().len(), "Snapshot captured");
        }

        let elapsed = started.elapsed();
        target.tick_completed(&report, elapsed);
        debug!(
            tick,
            executed = report.executed.len(),
            failures = report.failures.len(),
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "Tick complete"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Fast-forward and jump
    // -----------------------------------------------------------------------

    /// Execute `ticks` ticks back-to-back, without pacing.
    ///
    /// For use while no loop is running; see
    /// [`request_fast_forward`](Self::request_fast_forward) otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Terminated`] after a stop, or the halting
    /// error if a tick fails critically.
    pub async fn fast_forward<T: TickTarget + ?Sized>(
        &self,
        target: &mut T,
        ticks: u64,
    ) -> Result<u64, SchedulerError> {
        if self.is_terminated() {
            return Err(SchedulerError::Terminated);
        }
        self.fast_forward_inner(target, ticks).await
    }

    async fn fast_forward_inner<T: TickTarget + ?Sized>(
        &self,
        target: &mut T,
        ticks: u64,
    ) -> Result<u64, SchedulerError> {
        for _ in 0..ticks {
            self.tick_once(target).await?;
        }
        info!(ticks, tick = target.world().tick_count(), "Fast-forward complete");
        Ok(ticks)
    }

    /// Move the world to `target_time`.
    ///
    /// The world restarts from the latest retained snapshot at or before
    /// the target, unless the live state is itself at or before the target
    /// and at least as recent. It then runs whole ticks while the next tick
    /// time is not past the target. Snapshots newer than a restored one
    /// are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NoSnapshotAvailable`] when nothing usable
    /// precedes the target; the live state is untouched in that case.
    pub async fn jump<T: TickTarget + ?Sized>(
        &self,
        target: &mut T,
        target_time: DateTime<Utc>,
    ) -> Result<JumpReport, SchedulerError> {
        if self.is_terminated() {
            return Err(SchedulerError::Terminated);
        }
        self.jump_inner(target, target_time).await
    }

    async fn jump_inner<T: TickTarget + ?Sized>(
        &self,
        target: &mut T,
        target_time: DateTime<Utc>,
    ) -> Result<JumpReport, SchedulerError> {
        let live_tick = target.world().tick_count();
        let live_time = target.world().current_time();
        let candidate = self
            .history
            .lock()
            .await
            .latest_at_or_before(target_time)
            .cloned();

        let live_usable = live_time <= target_time
            && candidate.as_ref().is_none_or(|s| s.tick() <= live_tick);

        let restored_tick = if live_usable {
            None
        } else {
            let snapshot = candidate.ok_or(SchedulerError::NoSnapshotAvailable {
                target: target_time,
            })?;
            let state = snapshot.restore(target.migrations())?;
            target.replace_world(state).await;
            self.history.lock().await.truncate_after(snapshot.tick());
            info!(
                from_tick = live_tick,
                restored_tick = snapshot.tick(),
                target = %target_time,
                "Restored snapshot for jump"
            );
            Some(snapshot.tick())
        };

        let mut replayed: u64 = 0;
        while target
            .world()
            .current_time()
            .checked_add_signed(self.time_per_tick)
            .is_some_and(|next| next <= target_time)
        {
            self.tick_once(target).await?;
            replayed = replayed.saturating_add(1);
        }

        let world = target.world();
        info!(
            target = %target_time,
            ticks_replayed = replayed,
            tick = world.tick_count(),
            "Jump complete"
        );
        Ok(JumpReport {
            target: target_time,
            restored_tick,
            ticks_replayed: replayed,
            final_tick: world.tick_count(),
            final_time: world.current_time(),
        })
    }

    // -----------------------------------------------------------------------
    // Commands for a running loop
    // -----------------------------------------------------------------------

    /// Ask the running loop to fast-forward between ticks. Works while
    /// paused.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotRunning`] when no loop is running,
    /// otherwise as [`fast_forward`](Self::fast_forward).
    pub async fn request_fast_forward(&self, ticks: u64) -> Result<u64, SchedulerError> {
        let (reply, response) = oneshot::channel();
        self.submit(Command::FastForward { ticks, reply }).await?;
        response.await.unwrap_or(Err(SchedulerError::NotRunning))
    }

    /// Ask the running loop to jump between ticks. Works while paused.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotRunning`] when no loop is running,
    /// otherwise as [`jump`](Self::jump).
    pub async fn request_jump(
        &self,
        target_time: DateTime<Utc>,
    ) -> Result<JumpReport, SchedulerError> {
        let (reply, response) = oneshot::channel();
        self.submit(Command::Jump {
            target: target_time,
            reply,
        })
        .await?;
        response.await.unwrap_or(Err(SchedulerError::NotRunning))
    }

    async fn submit(&self, command: Command) -> Result<(), SchedulerError> {
        let mut queue = self.commands.lock().await;
        if self.status() == SchedulerStatus::Stopped {
            return Err(SchedulerError::NotRunning);
        }
        queue.push(command);
        drop(queue);
        self.wake.notify_waiters();
        Ok(())
    }

    async fn run_commands<T: TickTarget + ?Sized>(
        &self,
        target: &mut T,
    ) -> Result<(), SchedulerError> {
        let pending = std::mem::take(&mut *self.commands.lock().await);
        for command in pending {
            match command {
                Command::FastForward { ticks, reply } => {
                    let result = self.fast_forward_inner(target, ticks).await;
                    // The requester may have stopped waiting.
                    let _ = reply.send(result);
                }
                Command::Jump { target: time, reply } => {
                    let result = self.jump_inner(target, time).await;
                    let _ = reply.send(result);
                }
            }
            if self.is_halted() {
                return Err(SchedulerError::Halted {
                    tick: target.world().tick_count(),
                });
            }
        }
        Ok(())
    }

    /// Drop queued commands; their requesters observe `NotRunning`.
    async fn abandon_commands(&self) {
        self.commands.lock().await.clear();
    }
}
