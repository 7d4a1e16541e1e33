//! Engine registration, lifecycle, and the per-tick sweep.
//!
//! The [`Orchestrator`] owns the world state, the event bus, and the
//! [`TickScheduler`]. Engines are registered before [`initialize`], which
//! resolves one deterministic execution order, binds a world, and calls
//! every engine's `initialize` in that order. [`start`] hands the loop to
//! the scheduler; each tick the scheduler asks the orchestrator to sweep.
//!
//! # Sweep
//!
//! 1. Wait, bounded, for the bus to settle and move every mailbox into the
//!    world's pending event queues.
//! 2. For each engine in order: take its queued events and feed them to
//!    `handle_event` in publish order, then call `tick` under the engine
//!    timeout.
//! 3. A successful call commits the engine's staged slice. A failed call
//!    leaves the slice and the engine's random draws as they were before
//!    the call. Critical failures end the sweep and halt the scheduler.
//! 4. Settle again and queue what this tick published. Undelivered events
//!    are part of the world, so snapshots, restores, jumps, and branches
//!    carry them.
//!
//! [`initialize`]: Orchestrator::initialize
//! [`start`]: Orchestrator::start

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use epoch_events::{Event, EventBus, EventHandler, HandlerError, SubscriptionId};
use epoch_types::{Location, ScenarioId};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, SimulationConfig};
use crate::engine::{Engine, EngineContext, EngineError, EngineFailure};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::migration::MigrationRegistry;
use crate::persistence::{Persistence, PersistenceError, SnapshotSelector};
use crate::registry::{EngineRegistration, resolve_order};
use crate::scheduler::{
    JumpReport, RunSummary, SchedulerError, SweepReport, TickScheduler, TickTarget,
};
use crate::snapshot::Snapshot;
use crate::state::{PendingEvent, StateError, WorldState};

/// Errors from orchestrator lifecycle calls.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The configuration is invalid.
    #[error("configuration error: {source}")]
    Configuration {
        /// The underlying configuration error.
        #[from]
        source: ConfigError,
    },

    /// Two engines share a name.
    #[error("engine {name:?} is already registered")]
    DuplicateEngine {
        /// The colliding name.
        name: String,
    },

    /// An engine depends on a name nobody registered.
    #[error("engine {engine:?} depends on unregistered engine {dependency:?}")]
    UnknownDependency {
        /// The dependent engine.
        engine: String,
        /// The missing dependency.
        dependency: String,
    },

    /// The declared dependencies contain a cycle.
    #[error("dependency cycle among engines: {}", engines.join(", "))]
    DependencyCycle {
        /// Engines that could not be ordered.
        engines: Vec<String>,
    },

    /// An engine's `initialize` failed; startup was aborted.
    #[error("engine {engine:?} failed to initialize: {source}")]
    EngineInitialization {
        /// The failing engine.
        engine: String,
        /// What went wrong.
        source: EngineError,
    },

    /// The call needs an initialized world.
    #[error("orchestrator is not initialized")]
    NotInitialized,

    /// Engines cannot be registered after initialize.
    #[error("engines cannot be registered after initialize")]
    AlreadyInitialized,

    /// The scheduler rejected the call or halted.
    #[error("scheduler error: {source}")]
    Scheduler {
        /// The underlying scheduler error.
        #[from]
        source: SchedulerError,
    },

    /// A state could not be captured or decoded.
    #[error("state error: {source}")]
    State {
        /// The underlying state error.
        #[from]
        source: StateError,
    },

    /// The persistence collaborator failed.
    #[error("persistence error: {source}")]
    Persistence {
        /// The underlying persistence error.
        #[from]
        source: PersistenceError,
    },

    /// `restore` was called without a persistence collaborator.
    #[error("no persistence collaborator configured")]
    NoPersistence,

    /// One or more engines failed to shut down. The rest still ran.
    #[error("{} engine(s) failed to shut down", failures.len())]
    Shutdown {
        /// Every failed shutdown call, in the order they ran.
        failures: Vec<EngineFailure>,
    },
}

// ---------------------------------------------------------------------------
// Mailboxes
// ---------------------------------------------------------------------------

type Mailbox = Arc<Mutex<VecDeque<Arc<Event>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bus handler that queues events for an engine's next tick.
struct MailboxHandler {
    mailbox: Mailbox,
}

#[async_trait]
impl EventHandler for MailboxHandler {
    async fn handle(&self, event: Arc<Event>) -> Result<(), HandlerError> {
        lock(&self.mailbox).push_back(event);
        Ok(())
    }
}

struct EngineSlot {
    engine: Box<dyn Engine>,
    registration: EngineRegistration,
    mailbox: Mailbox,
    subscriptions: Vec<SubscriptionId>,
}

/// Wait until events published so far have been routed, at most `limit`.
async fn settle_events(bus: &EventBus, limit: Duration) {
    if tokio::time::timeout(limit, bus.wait_idle()).await.is_err() {
        warn!(
            queue_depth = bus.stats().queue_depth,
            limit_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            "Event bus did not settle in time"
        );
    }
}

/// The event an engine sees for the `position`-th entry of its inbox.
fn delivery(position: usize, pending: PendingEvent) -> Event {
    Event {
        sequence: u64::try_from(position).unwrap_or(u64::MAX),
        event_type: pending.event_type,
        payload: pending.payload,
        published_at: pending.queued_at,
    }
}

/// Bound an engine call by the configured timeout.
async fn bounded<F>(limit: Option<Duration>, call: F) -> Result<(), EngineError>
where
    F: Future<Output = Result<(), EngineError>> + Send,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .unwrap_or_else(|_elapsed| {
                Err(EngineError::Timeout {
                    timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                })
            }),
        None => call.await,
    }
}

// ---------------------------------------------------------------------------
// Engine host
// ---------------------------------------------------------------------------

/// Everything the scheduler drives: the world plus the registered engines.
struct EngineHost {
    state: WorldState,
    slots: Vec<EngineSlot>,
    order: Vec<usize>,
    bus: EventBus,
    metrics: Arc<dyn MetricsSink>,
    persistence: Option<Arc<dyn Persistence>>,
    migrations: MigrationRegistry,
    engine_timeout: Option<Duration>,
    settle_timeout: Duration,
}

impl EngineHost {
    /// Bind a world: declared defaults, empty mailboxes. Events still in
    /// flight belong to the outgoing world and are discarded once the bus
    /// settles; the incoming world carries its own queue.
    async fn install(&mut self, mut state: WorldState) {
        settle_events(&self.bus, self.settle_timeout).await;
        for slot in &self.slots {
            state.register_default(
                slot.registration.name.clone(),
                slot.registration.default_state.clone(),
            );
            let discarded = {
                let mut mailbox = lock(&slot.mailbox);
                let count = mailbox.len();
                mailbox.clear();
                count
            };
            if discarded > 0 {
                debug!(engine = %slot.registration.name, discarded, "Mailbox cleared");
            }
        }
        self.state = state;
    }

    /// Wait for the bus to settle, then move every mailbox into the world's
    /// pending queues in publish order.
    async fn queue_mailboxes(&mut self) {
        settle_events(&self.bus, self.settle_timeout).await;
        let queued_at = self.state.current_time();
        for slot in &self.slots {
            let mut inbox: Vec<Arc<Event>> = lock(&slot.mailbox).drain(..).collect();
            inbox.sort_by_key(|event| event.sequence);
            self.state.queue_events(
                slot.registration.name.clone(),
                inbox.iter().map(|event| PendingEvent {
                    event_type: event.event_type.clone(),
                    payload: event.payload.clone(),
                    queued_at,
                }),
            );
        }
    }

    /// Point every engine's subscriptions at its mailbox, replacing any
    /// subscriptions from a previous bootstrap.
    fn subscribe_mailboxes(&mut self) {
        for slot in &mut self.slots {
            for id in slot.subscriptions.drain(..) {
                self.bus.unsubscribe(id);
            }
            for topic in &slot.registration.subscriptions {
                let handler = Arc::new(MailboxHandler {
                    mailbox: Arc::clone(&slot.mailbox),
                });
                slot.subscriptions
                    .push(self.bus.subscribe(topic.as_str(), handler));
                debug!(engine = %slot.registration.name, topic = %topic, "Mailbox subscribed");
            }
        }
    }

    /// Initialize engines in execution order. If one fails, the engines
    /// already initialized are shut down in reverse order before the error
    /// is returned.
    async fn initialize_engines(&mut self) -> Result<(), OrchestratorError> {
        let mut initialized = Vec::new();
        let failure = {
            let Self {
                state,
                slots,
                order,
                bus,
                engine_timeout,
                ..
            } = &mut *self;
            let mut failure = None;

            for &index in order.iter() {
                let Some(EngineSlot {
                    engine,
                    registration,
                    ..
                }) = slots.get_mut(index)
                else {
                    continue;
                };
                let mut ctx = EngineContext::new(&registration.name, &mut *state, &*bus);
                if let Err(source) = bounded(*engine_timeout, engine.initialize(&mut ctx)).await {
                    error!(engine = %registration.name, error = %source, "Engine initialize failed");
                    failure = Some((registration.name.clone(), source));
                    break;
                }
                ctx.commit();
                initialized.push(index);
                debug!(engine = %registration.name, "Engine initialized");
            }
            failure
        };

        match failure {
            None => Ok(()),
            Some((engine, source)) => {
                self.unwind_initialized(&initialized).await;
                Err(OrchestratorError::EngineInitialization { engine, source })
            }
        }
    }

    /// Shut down engines that did initialize, newest first, after a later
    /// engine failed to.
    async fn unwind_initialized(&mut self, initialized: &[usize]) {
        let Self {
            state,
            slots,
            bus,
            engine_timeout,
            ..
        } = self;
        for &index in initialized.iter().rev() {
            let Some(EngineSlot {
                engine,
                registration,
                ..
            }) = slots.get_mut(index)
            else {
                continue;
            };
            let mut ctx = EngineContext::new(&registration.name, &mut *state, &*bus);
            match bounded(*engine_timeout, engine.shutdown(&mut ctx)).await {
                Ok(()) => {
                    ctx.commit();
                    debug!(engine = %registration.name, "Engine shut down after failed startup");
                }
                Err(err) => {
                    error!(engine = %registration.name, error = %err, "Engine shutdown failed");
                }
            }
        }
    }

    /// Shut engines down in reverse execution order, collecting failures.
    async fn shutdown_engines(&mut self) -> Vec<EngineFailure> {
        let Self {
            state,
            slots,
            order,
            bus,
            engine_timeout,
            ..
        } = self;
        let tick = state.tick_count();
        let mut failures = Vec::new();

        for &index in order.iter().rev() {
            let Some(EngineSlot {
                engine,
                registration,
                ..
            }) = slots.get_mut(index)
            else {
                continue;
            };
            let mut ctx = EngineContext::new(&registration.name, &mut *state, &*bus);
            match bounded(*engine_timeout, engine.shutdown(&mut ctx)).await {
                Ok(()) => {
                    ctx.commit();
                    debug!(engine = %registration.name, "Engine shut down");
                }
                Err(err) => {
                    error!(engine = %registration.name, tick, error = %err, "Engine shutdown failed");
                    failures.push(EngineFailure {
                        engine: registration.name.clone(),
                        tick,
                        critical: registration.critical,
                        error: err,
                    });
                }
            }
        }
        failures
    }

}

#[async_trait]
impl TickTarget for EngineHost {
    fn world(&self) -> &WorldState {
        &self.state
    }

    fn world_mut(&mut self) -> &mut WorldState {
        &mut self.state
    }

    fn migrations(&self) -> &MigrationRegistry {
        &self.migrations
    }

    async fn replace_world(&mut self, state: WorldState) {
        self.install(state).await;
    }

    async fn sweep(&mut self, delta: TimeDelta) -> Result<SweepReport, EngineFailure> {
        self.queue_mailboxes().await;

        let Self {
            state,
            slots,
            order,
            bus,
            metrics,
            engine_timeout,
            ..
        } = &mut *self;
        let tick = state.tick_count();
        let mut report = SweepReport {
            tick,
            ..SweepReport::default()
        };

        for &index in order.iter() {
            let Some(EngineSlot {
                engine,
                registration,
                ..
            }) = slots.get_mut(index)
            else {
                continue;
            };
            let name = registration.name.as_str();
            let inbox = state.take_events(name);
            let saved_random = state.random().clone();
            let started = Instant::now();
            let mut ctx = EngineContext::new(name, &mut *state, &*bus);

            for (position, pending) in inbox.into_iter().enumerate() {
                let event = delivery(position, pending);
                report.events_handled = report.events_handled.saturating_add(1);
                if let Err(err) =
                    bounded(*engine_timeout, engine.handle_event(&mut ctx, &event)).await
                {
                    report.handler_errors = report.handler_errors.saturating_add(1);
                    error!(
                        engine = name,
                        tick,
                        event_type = %event.event_type,
                        error = %err,
                        "Engine event handler failed"
                    );
                }
            }

            let result = bounded(*engine_timeout, engine.tick(&mut ctx, delta)).await;
            metrics.record_engine_call(name, started.elapsed(), result.is_ok());

            match result {
                Ok(()) => {
                    ctx.commit();
                    report.executed.push(name.to_owned());
                }
                Err(err) => {
                    drop(ctx);
                    *state.random_mut() = saved_random;
                    let failure = EngineFailure {
                        engine: name.to_owned(),
                        tick,
                        critical: registration.critical,
                        error: err,
                    };
                    if failure.critical {
                        error!(engine = name, tick, error = %failure.error, "Critical engine failed");
                        return Err(failure);
                    }
                    warn!(engine = name, tick, error = %failure.error, "Engine tick failed, slice unchanged");
                    report.failures.push(failure);
                }
            }
        }

        self.queue_mailboxes().await;
        Ok(report)
    }

    async fn persist(&mut self, snapshot: &Snapshot) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        if let Err(err) = persistence.save(snapshot.as_bytes(), snapshot.tick()).await {
            warn!(tick = snapshot.tick(), error = %err, "Snapshot save failed");
        }
    }

    fn tick_completed(&mut self, report: &SweepReport, elapsed: Duration) {
        self.metrics.record_tick(report.tick, elapsed);
        self.metrics.record_bus(&self.bus.stats());
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Registers engines and drives their lifecycle.
pub struct Orchestrator {
    config: SimulationConfig,
    scheduler: Arc<TickScheduler>,
    host: EngineHost,
    initialized: bool,
}

impl Orchestrator {
    /// Build an orchestrator from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Configuration`] for invalid settings.
    pub fn new(config: SimulationConfig) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let scheduler = Arc::new(TickScheduler::from_config(&config.scheduler)?);
        let state = WorldState::new(
            ScenarioId::new(config.scenario.id.clone()),
            config.scenario.start,
            Location::new(config.scenario.location.clone()),
            config.world.seed,
        );
        let host = EngineHost {
            state,
            slots: Vec::new(),
            order: Vec::new(),
            bus: EventBus::new(config.event_bus.clone()),
            metrics: Arc::new(NoopMetrics),
            persistence: None,
            migrations: MigrationRegistry::default(),
            engine_timeout: config.scheduler.engine_timeout(),
            settle_timeout: config.scheduler.event_settle_timeout(),
        };
        Ok(Self {
            config,
            scheduler,
            host,
            initialized: false,
        })
    }

    /// Report measurements to `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.host.metrics = metrics;
        self
    }

    /// Save snapshots to, and restore from, `persistence`.
    #[must_use]
    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.host.persistence = Some(persistence);
        self
    }

    /// Decode stored states with `migrations`.
    #[must_use]
    pub fn with_migrations(mut self, migrations: MigrationRegistry) -> Self {
        self.host.migrations = migrations;
        self
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register an engine. Must happen before [`initialize`](Self::initialize).
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::DuplicateEngine`] on a name collision
    /// and [`OrchestratorError::AlreadyInitialized`] after initialize.
    pub fn register_engine(&mut self, engine: Box<dyn Engine>) -> Result<(), OrchestratorError> {
        if self.initialized {
            return Err(OrchestratorError::AlreadyInitialized);
        }
        let registration = EngineRegistration::from_engine(engine.as_ref(), self.host.slots.len());
        if self
            .host
            .slots
            .iter()
            .any(|slot| slot.registration.name == registration.name)
        {
            return Err(OrchestratorError::DuplicateEngine {
                name: registration.name,
            });
        }
        info!(
            engine = %registration.name,
            priority = registration.priority,
            dependencies = ?registration.dependencies,
            critical = registration.critical,
            "Engine registered"
        );
        self.host.slots.push(EngineSlot {
            engine,
            registration,
            mailbox: Arc::default(),
            subscriptions: Vec::new(),
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Bind a fresh world for `scenario_id`, seeded from configuration, and
    /// initialize every engine in execution order.
    ///
    /// # Errors
    ///
    /// Ordering errors ([`OrchestratorError::UnknownDependency`],
    /// [`OrchestratorError::DependencyCycle`]) and the first
    /// [`OrchestratorError::EngineInitialization`] abort startup.
    pub async fn initialize(
        &mut self,
        scenario_id: ScenarioId,
        initial_time: DateTime<Utc>,
        location: Location,
    ) -> Result<(), OrchestratorError> {
        let state = WorldState::new(scenario_id, initial_time, location, self.config.world.seed);
        self.bootstrap(state).await
    }

    /// Bind a world loaded from the persistence collaborator. The stored
    /// random state is kept, so the world continues its exact draw sequence.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::NoPersistence`] without a collaborator,
    /// load and decode errors, and the errors of [`initialize`](Self::initialize).
    pub async fn restore(&mut self, selector: SnapshotSelector) -> Result<(), OrchestratorError> {
        let persistence = self
            .host
            .persistence
            .clone()
            .ok_or(OrchestratorError::NoPersistence)?;
        let blob = persistence.load(selector).await?;
        let state = WorldState::from_compressed(&blob, &self.host.migrations)?;
        info!(
            selector = %selector,
            tick = state.tick_count(),
            timeline = %state.timeline_id(),
            "Restoring world from persistence"
        );
        self.bootstrap(state).await
    }

    /// Bind the world captured in `snapshot`.
    ///
    /// # Errors
    ///
    /// As [`restore`](Self::restore), minus the persistence errors.
    pub async fn restore_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), OrchestratorError> {
        let state = snapshot.restore(&self.host.migrations)?;
        info!(tick = state.tick_count(), "Restoring world from snapshot");
        self.bootstrap(state).await
    }

    async fn bootstrap(&mut self, state: WorldState) -> Result<(), OrchestratorError> {
        self.initialized = false;
        let registrations: Vec<EngineRegistration> = self
            .host
            .slots
            .iter()
            .map(|slot| slot.registration.clone())
            .collect();
        self.host.order = resolve_order(&registrations)?;

        self.scheduler.reset().await;
        self.host.install(state).await;
        self.host.bus.start();
        self.host.subscribe_mailboxes();
        self.host.initialize_engines().await?;
        self.host.queue_mailboxes().await;

        let snapshot = Snapshot::capture(&self.host.state)?;
        self.scheduler.record_snapshot(snapshot.clone()).await;
        self.host.persist(&snapshot).await;
        self.initialized = true;

        info!(
            scenario = %self.host.state.scenario_id(),
            location = %self.host.state.location(),
            timeline = %self.host.state.timeline_id(),
            tick = self.host.state.tick_count(),
            seed = self.host.state.seed(),
            order = ?self.execution_order(),
            "Orchestrator initialized"
        );
        Ok(())
    }

    const fn ensure_initialized(&self) -> Result<(), OrchestratorError> {
        if self.initialized {
            Ok(())
        } else {
            Err(OrchestratorError::NotInitialized)
        }
    }

    /// Run the tick loop until stopped, bounded by `max_ticks`, or halted.
    ///
    /// Use [`scheduler`](Self::scheduler) to pause, resume, or stop it from
    /// another task.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::NotInitialized`] before initialize and
    /// [`OrchestratorError::Scheduler`] when the scheduler refuses to start
    /// or halts on a critical failure.
    pub async fn start(&mut self) -> Result<RunSummary, OrchestratorError> {
        self.ensure_initialized()?;
        Ok(self.scheduler.run(&mut self.host).await?)
    }

    /// Stop the loop and shut every engine down in reverse execution order.
    ///
    /// Every engine gets its shutdown call even if earlier ones fail. The
    /// bus is drained and stopped afterwards. A new
    /// [`initialize`](Self::initialize) is needed to run again.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Shutdown`] listing every failed call.
    pub async fn stop(&mut self) -> Result<(), OrchestratorError> {
        self.ensure_initialized()?;
        self.scheduler.terminate();
        let failures = self.host.shutdown_engines().await;
        self.host.bus.shutdown().await;
        self.host.metrics.record_bus(&self.host.bus.stats());
        self.initialized = false;

        info!(
            tick = self.host.state.tick_count(),
            failures = failures.len(),
            "Orchestrator stopped"
        );
        if failures.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::Shutdown { failures })
        }
    }

    // -----------------------------------------------------------------------
    // Time travel and branching
    // -----------------------------------------------------------------------

    /// Execute `ticks` ticks back-to-back while the loop is not running.
    ///
    /// # Errors
    ///
    /// As [`TickScheduler::fast_forward`].
    pub async fn fast_forward(&mut self, ticks: u64) -> Result<u64, OrchestratorError> {
        self.ensure_initialized()?;
        Ok(self.scheduler.fast_forward(&mut self.host, ticks).await?)
    }

    /// Move the world to `target` while the loop is not running.
    ///
    /// # Errors
    ///
    /// As [`TickScheduler::jump`].
    pub async fn jump(&mut self, target: DateTime<Utc>) -> Result<JumpReport, OrchestratorError> {
        self.ensure_initialized()?;
        Ok(self.scheduler.jump(&mut self.host, target).await?)
    }

    /// Continue on a fork of the current world and return the ancestor.
    ///
    /// Retained snapshots belong to the ancestor timeline and are
    /// replaced by a snapshot of the fork.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::NotInitialized`] or a capture error.
    pub async fn branch(&mut self, label: &str) -> Result<WorldState, OrchestratorError> {
        self.ensure_initialized()?;
        self.host.queue_mailboxes().await;
        let fork = self.host.state.fork(label);
        let snapshot = Snapshot::capture(&fork)?;
        let ancestor = std::mem::replace(&mut self.host.state, fork);

        self.scheduler.clear_snapshots().await;
        self.scheduler.record_snapshot(snapshot).await;

        info!(
            label,
            parent = %ancestor.timeline_id(),
            timeline = %self.host.state.timeline_id(),
            tick = self.host.state.tick_count(),
            pending_events = self.host.state.pending_event_count(),
            "Timeline branched"
        );
        Ok(ancestor)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// The live world.
    pub const fn state(&self) -> &WorldState {
        &self.host.state
    }

    /// The event bus engines publish on.
    pub const fn event_bus(&self) -> &EventBus {
        &self.host.bus
    }

    /// Shared handle for pause, resume, stop, speed, and queued commands.
    pub fn scheduler(&self) -> Arc<TickScheduler> {
        Arc::clone(&self.scheduler)
    }

    /// The configuration the orchestrator was built with.
    pub const fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Whether a world is bound and engines are initialized.
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Engine names in resolved execution order. Empty before initialize.
    pub fn execution_order(&self) -> Vec<&str> {
        self.host
            .order
            .iter()
            .filter_map(|&index| self.host.slots.get(index))
            .map(|slot| slot.registration.name.as_str())
            .collect()
    }
}
