//! Integration tests for the orchestrator lifecycle and the tick loop.
//!
//! Engines here are small scripted engines that record their calls, so the
//! tests can check execution order, failure isolation, halting, and runtime
//! control through the public API only.

#![allow(
    clippy::unwrap_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use epoch_core::{
    Engine, EngineContext, EngineError, InMemoryMetrics, Orchestrator, OrchestratorError,
    RunEnd, SchedulerError, SchedulerStatus, SimulationConfig,
};
use epoch_events::Event;
use epoch_types::{Location, ScenarioId};
use rand::RngCore;
use serde_json::json;

type Log = Arc<Mutex<Vec<(u64, String)>>>;

struct Scripted {
    name: &'static str,
    priority: i32,
    dependencies: Vec<String>,
    critical: bool,
    log: Log,
    fail: bool,
    fail_at: Option<(u64, Arc<AtomicBool>)>,
    delay: Option<Duration>,
    topics: Vec<String>,
    seen: Arc<Mutex<Vec<String>>>,
    publish: Option<&'static str>,
}

impl Scripted {
    fn new(name: &'static str, priority: i32, log: &Log) -> Self {
        Self {
            name,
            priority,
            dependencies: Vec::new(),
            critical: false,
            log: Arc::clone(log),
            fail: false,
            fail_at: None,
            delay: None,
            topics: Vec::new(),
            seen: Arc::default(),
            publish: None,
        }
    }

    fn depends_on(mut self, dependency: &str) -> Self {
        self.dependencies.push(dependency.to_owned());
        self
    }
}

#[async_trait]
impl Engine for Scripted {
    fn name(&self) -> &str {
        self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    fn is_critical(&self) -> bool {
        self.critical
    }

    fn subscriptions(&self) -> Vec<String> {
        self.topics.clone()
    }

    async fn initialize(&mut self, _ctx: &mut EngineContext<'_>) -> Result<(), EngineError> {
        Ok(())
    }

    async fn handle_event(
        &mut self,
        _ctx: &mut EngineContext<'_>,
        event: &Event,
    ) -> Result<(), EngineError> {
        let label = event.payload["label"].as_str().unwrap_or_default().to_owned();
        self.seen.lock().unwrap().push(label);
        Ok(())
    }

    async fn tick(
        &mut self,
        ctx: &mut EngineContext<'_>,
        _delta: TimeDelta,
    ) -> Result<(), EngineError> {
        let tick = ctx.tick_count();
        self.log.lock().unwrap().push((tick, self.name.to_owned()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let count = ctx.own_state()["count"].as_u64().unwrap_or(0);
        let draw = ctx.rng("main").next_u64();
        ctx.set_own_state(json!({ "count": count + 1, "draw": draw }));

        if let Some(event_type) = self.publish {
            ctx.publish(event_type, json!({ "label": format!("{tick}-a") })).await;
            ctx.publish(event_type, json!({ "label": format!("{tick}-b") })).await;
        }

        let scheduled = self
            .fail_at
            .as_ref()
            .is_some_and(|(at, armed)| tick == *at && armed.swap(false, Ordering::SeqCst));
        if scheduled {
            return Err(EngineError::failed("scheduled failure"));
        }
        if self.fail {
            return Err(EngineError::failed("always fails"));
        }
        Ok(())
    }
}

fn config(max_ticks: u64) -> SimulationConfig {
    let mut config = SimulationConfig::default();
    config.world.seed = 42;
    config.scheduler.tick_interval_ms = 0;
    config.scheduler.snapshot_interval_ticks = 0;
    config.scheduler.max_ticks = max_ticks;
    config
}

fn start_time() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap()
}

async fn initialize(orchestrator: &mut Orchestrator) {
    orchestrator
        .initialize(ScenarioId::new("lifecycle"), start_time(), Location::new("Cleveland, USA"))
        .await
        .unwrap();
}

fn ticks_of(log: &Log, tick: u64) -> Vec<String> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|(t, _)| *t == tick)
        .map(|(_, name)| name.clone())
        .collect()
}

#[tokio::test]
async fn priority_and_dependency_order_is_stable_across_ticks() {
    let log = Log::default();
    let metrics = Arc::new(InMemoryMetrics::new());
    let mut orchestrator = Orchestrator::new(config(5))
        .unwrap()
        .with_metrics(metrics.clone());
    orchestrator
        .register_engine(Box::new(Scripted::new("A", 0, &log)))
        .unwrap();
    orchestrator
        .register_engine(Box::new(Scripted::new("B", 1, &log)))
        .unwrap();
    orchestrator
        .register_engine(Box::new(Scripted::new("C", 1, &log).depends_on("A")))
        .unwrap();
    initialize(&mut orchestrator).await;

    let summary = orchestrator.start().await.unwrap();
    assert_eq!(summary.end, RunEnd::MaxTicksReached);
    assert_eq!(orchestrator.state().tick_count(), 5);

    let first = ticks_of(&log, 1);
    let a = first.iter().position(|n| n == "A").unwrap();
    let c = first.iter().position(|n| n == "C").unwrap();
    assert!(a < c);
    for tick in 2..=5 {
        assert_eq!(ticks_of(&log, tick), first);
    }

    let recorded = metrics.summary();
    assert_eq!(recorded.ticks, 5);
    assert!(recorded.engines.values().all(|stats| stats.failures == 0));
}

#[tokio::test]
async fn failing_engine_does_not_stop_the_others_or_the_clock() {
    let log = Log::default();
    let mut orchestrator = Orchestrator::new(config(0)).unwrap();
    let mut broken = Scripted::new("broken", 0, &log);
    broken.fail = true;
    orchestrator.register_engine(Box::new(broken)).unwrap();
    orchestrator
        .register_engine(Box::new(Scripted::new("healthy", 1, &log)))
        .unwrap();
    initialize(&mut orchestrator).await;

    orchestrator.fast_forward(4).await.unwrap();
    let state = orchestrator.state();
    assert_eq!(state.tick_count(), 4);
    assert_eq!(
        state.current_time(),
        start_time() + TimeDelta::days(4)
    );
    assert!(state.get_engine_state("broken").is_null());
    assert_eq!(state.get_engine_state("healthy")["count"], json!(4));
    assert_eq!(ticks_of(&log, 4), vec!["broken", "healthy"]);
}

#[tokio::test]
async fn slow_engine_times_out_as_an_isolated_failure() {
    let log = Log::default();
    let mut config = config(0);
    config.scheduler.engine_timeout_ms = 20;
    let metrics = Arc::new(InMemoryMetrics::new());
    let mut orchestrator = Orchestrator::new(config)
        .unwrap()
        .with_metrics(metrics.clone());
    let mut slow = Scripted::new("slow", 0, &log);
    slow.delay = Some(Duration::from_millis(500));
    orchestrator.register_engine(Box::new(slow)).unwrap();
    orchestrator
        .register_engine(Box::new(Scripted::new("fast", 1, &log)))
        .unwrap();
    initialize(&mut orchestrator).await;

    orchestrator.fast_forward(2).await.unwrap();
    assert_eq!(orchestrator.state().tick_count(), 2);
    assert!(orchestrator.state().get_engine_state("slow").is_null());
    assert_eq!(orchestrator.state().get_engine_state("fast")["count"], json!(2));

    let recorded = metrics.summary();
    assert_eq!(recorded.engines["slow"].failures, 2);
    assert_eq!(recorded.engines["fast"].failures, 0);
}

#[tokio::test]
async fn critical_failure_halts_until_reinitialize() {
    let log = Log::default();
    let mut orchestrator = Orchestrator::new(config(10)).unwrap();
    let mut core = Scripted::new("core", 0, &log);
    core.critical = true;
    core.fail_at = Some((3, Arc::new(AtomicBool::new(true))));
    orchestrator.register_engine(Box::new(core)).unwrap();
    orchestrator
        .register_engine(Box::new(Scripted::new("after", 1, &log)))
        .unwrap();
    initialize(&mut orchestrator).await;

    match orchestrator.start().await.unwrap_err() {
        OrchestratorError::Scheduler {
            source: SchedulerError::EngineCritical { source },
        } => {
            assert_eq!(source.engine, "core");
            assert_eq!(source.tick, 3);
            assert!(source.critical);
        }
        other => panic!("unexpected error: {other}"),
    }
    let scheduler = orchestrator.scheduler();
    assert!(scheduler.is_halted());
    assert_eq!(scheduler.status(), SchedulerStatus::Stopped);
    // The failed tick is rolled back; the halted world sits at tick 2.
    assert_eq!(orchestrator.state().tick_count(), 2);
    assert_eq!(orchestrator.state().current_time(), start_time() + TimeDelta::days(2));
    // The sweep stopped at the critical engine.
    assert_eq!(ticks_of(&log, 3), vec!["core"]);

    assert!(matches!(
        orchestrator.start().await,
        Err(OrchestratorError::Scheduler {
            source: SchedulerError::Terminated
        })
    ));

    initialize(&mut orchestrator).await;
    let summary = orchestrator.start().await.unwrap();
    assert_eq!(summary.end, RunEnd::MaxTicksReached);
    assert_eq!(orchestrator.state().tick_count(), 10);
}

#[tokio::test]
async fn jump_without_a_usable_snapshot_fails() {
    let log = Log::default();
    let mut orchestrator = Orchestrator::new(config(0)).unwrap();
    orchestrator
        .register_engine(Box::new(Scripted::new("a", 0, &log)))
        .unwrap();
    initialize(&mut orchestrator).await;
    orchestrator.fast_forward(3).await.unwrap();
    let before = orchestrator.state().serialize().unwrap();

    let target = start_time() - TimeDelta::days(30);
    match orchestrator.jump(target).await.unwrap_err() {
        OrchestratorError::Scheduler {
            source: SchedulerError::NoSnapshotAvailable { target: reported },
        } => assert_eq!(reported, target),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(orchestrator.state().serialize().unwrap(), before);
}

#[tokio::test]
async fn same_type_events_reach_subscribers_in_publish_order() {
    let log = Log::default();
    let mut orchestrator = Orchestrator::new(config(0)).unwrap();
    let mut talker = Scripted::new("talker", 0, &log);
    talker.publish = Some("chatter");
    orchestrator.register_engine(Box::new(talker)).unwrap();

    let mut listener = Scripted::new("listener", 1, &log);
    listener.topics = vec![String::from("chatter")];
    let seen = Arc::clone(&listener.seen);
    orchestrator.register_engine(Box::new(listener)).unwrap();
    initialize(&mut orchestrator).await;

    orchestrator.fast_forward(4).await.unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["1-a", "1-b", "2-a", "2-b", "3-a", "3-b"]
    );
    let queued: Vec<&str> = orchestrator
        .state()
        .pending_events("listener")
        .iter()
        .map(|event| event.payload["label"].as_str().unwrap())
        .collect();
    assert_eq!(queued, vec!["4-a", "4-b"]);
}

#[tokio::test]
async fn shutdown_runs_every_engine_in_reverse() {
    let log = Log::default();
    let mut orchestrator = Orchestrator::new(config(0)).unwrap();
    orchestrator
        .register_engine(Box::new(Scripted::new("first", 0, &log)))
        .unwrap();
    orchestrator
        .register_engine(Box::new(Scripted::new("second", 1, &log)))
        .unwrap();
    initialize(&mut orchestrator).await;
    orchestrator.fast_forward(1).await.unwrap();

    orchestrator.stop().await.unwrap();
    assert!(!orchestrator.is_initialized());
    assert!(!orchestrator.event_bus().is_running());
    assert!(matches!(
        orchestrator.start().await,
        Err(OrchestratorError::NotInitialized)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn running_loop_accepts_pause_commands_and_stop() {
    let log = Log::default();
    let mut orchestrator = Orchestrator::new(config(0)).unwrap();
    orchestrator
        .register_engine(Box::new(Scripted::new("a", 0, &log)))
        .unwrap();
    initialize(&mut orchestrator).await;

    let scheduler = orchestrator.scheduler();
    scheduler.set_tick_interval(Duration::from_millis(5));
    let run = tokio::spawn(async move {
        let outcome = orchestrator.start().await;
        (orchestrator, outcome)
    });

    while scheduler.status() != SchedulerStatus::Running {
        tokio::task::yield_now().await;
    }
    scheduler.pause().unwrap();
    assert!(matches!(
        scheduler.pause(),
        Err(SchedulerError::InvalidTransition {
            from: SchedulerStatus::Paused,
            ..
        })
    ));
    assert_eq!(scheduler.request_fast_forward(5).await.unwrap(), 5);

    scheduler.resume().unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    scheduler.stop().unwrap();

    let (orchestrator, outcome) = run.await.unwrap();
    let summary = outcome.unwrap();
    assert_eq!(summary.end, RunEnd::StopRequested);
    assert_eq!(orchestrator.state().tick_count(), summary.ticks_executed + 5);
    assert!(matches!(
        scheduler.request_fast_forward(1).await,
        Err(SchedulerError::NotRunning)
    ));
}
