//! Integration tests for reproducibility: seeded runs, snapshots, restore,
//! time travel, migration, and branching.
//!
//! Every engine here keeps all of its simulation data in its state slice
//! and draws only from its own random stream, so whole-world byte
//! comparisons are meaningful. The walkers never talk to each other; the
//! herald and oracle pair exchanges events every tick, so undelivered
//! events are in flight at every snapshot.

#![allow(
    clippy::unwrap_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use epoch_core::{
    Engine, EngineContext, EngineError, InMemoryPersistence, MigrationRegistry, Orchestrator,
    SimulationConfig, Snapshot, SnapshotSelector, WorldState,
};
use epoch_events::Event;
use epoch_types::{Location, ScenarioId};
use rand::Rng;
use serde_json::{Value, json};

/// Random walk over its own stream.
struct Walker {
    name: &'static str,
    priority: i32,
}

#[async_trait]
impl Engine for Walker {
    fn name(&self) -> &str {
        self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn default_state(&self) -> Value {
        json!({ "position": 0, "steps": 0 })
    }

    async fn initialize(&mut self, _ctx: &mut EngineContext<'_>) -> Result<(), EngineError> {
        Ok(())
    }

    async fn tick(
        &mut self,
        ctx: &mut EngineContext<'_>,
        _delta: TimeDelta,
    ) -> Result<(), EngineError> {
        let position = ctx.own_state()["position"].as_i64().unwrap_or(0);
        let steps = ctx.own_state()["steps"].as_u64().unwrap_or(0);
        let step: i64 = ctx.rng("walk").random_range(-10..=10);
        ctx.set_own_state(json!({ "position": position + step, "steps": steps + 1 }));
        Ok(())
    }
}

/// Publishes one omen per tick.
struct Herald;

#[async_trait]
impl Engine for Herald {
    fn name(&self) -> &str {
        "herald"
    }

    fn default_state(&self) -> Value {
        json!({ "omens": 0 })
    }

    async fn initialize(&mut self, _ctx: &mut EngineContext<'_>) -> Result<(), EngineError> {
        Ok(())
    }

    async fn tick(
        &mut self,
        ctx: &mut EngineContext<'_>,
        _delta: TimeDelta,
    ) -> Result<(), EngineError> {
        let omens = ctx.own_state()["omens"].as_u64().unwrap_or(0);
        let strength: u64 = ctx.rng("omen").random_range(0..1_000);
        ctx.publish("omen", json!({ "tick": ctx.tick_count(), "strength": strength }))
            .await;
        ctx.set_own_state(json!({ "omens": omens + 1 }));
        Ok(())
    }
}

/// Folds every omen it hears into its slice, then drifts on its own stream.
struct Oracle;

#[async_trait]
impl Engine for Oracle {
    fn name(&self) -> &str {
        "oracle"
    }

    fn priority(&self) -> i32 {
        1
    }

    fn subscriptions(&self) -> Vec<String> {
        vec![String::from("omen")]
    }

    fn default_state(&self) -> Value {
        json!({ "heard": 0, "total": 0, "mood": 0, "last": null })
    }

    async fn initialize(&mut self, _ctx: &mut EngineContext<'_>) -> Result<(), EngineError> {
        Ok(())
    }

    async fn handle_event(
        &mut self,
        ctx: &mut EngineContext<'_>,
        event: &Event,
    ) -> Result<(), EngineError> {
        let mut slice = ctx.own_state().clone();
        let heard = slice["heard"].as_u64().unwrap_or(0);
        let total = slice["total"].as_u64().unwrap_or(0);
        let strength = event.payload["strength"].as_u64().unwrap_or(0);
        slice["heard"] = json!(heard + 1);
        slice["total"] = json!(total + strength);
        slice["last"] = json!({
            "tick": event.payload["tick"],
            "position": event.sequence,
            "at": event.published_at,
        });
        ctx.set_own_state(slice);
        Ok(())
    }

    async fn tick(
        &mut self,
        ctx: &mut EngineContext<'_>,
        _delta: TimeDelta,
    ) -> Result<(), EngineError> {
        let mut slice = ctx.own_state().clone();
        let mood = slice["mood"].as_i64().unwrap_or(0);
        let drift: i64 = ctx.rng("mood").random_range(-5..=5);
        slice["mood"] = json!(mood + drift);
        ctx.set_own_state(slice);
        Ok(())
    }
}

fn config(seed: u64, snapshot_interval_ticks: u64) -> SimulationConfig {
    let mut config = SimulationConfig::default();
    config.world.seed = seed;
    config.scheduler.tick_interval_ms = 0;
    config.scheduler.snapshot_interval_ticks = snapshot_interval_ticks;
    config
}

fn start_time() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap()
}

fn orchestrator(config: SimulationConfig) -> Orchestrator {
    let mut orchestrator = Orchestrator::new(config).unwrap();
    orchestrator
        .register_engine(Box::new(Walker {
            name: "north",
            priority: 0,
        }))
        .unwrap();
    orchestrator
        .register_engine(Box::new(Walker {
            name: "south",
            priority: 1,
        }))
        .unwrap();
    orchestrator
}

fn chatty(config: SimulationConfig) -> Orchestrator {
    let mut orchestrator = Orchestrator::new(config).unwrap();
    orchestrator.register_engine(Box::new(Herald)).unwrap();
    orchestrator.register_engine(Box::new(Oracle)).unwrap();
    orchestrator
}

async fn initialize(orchestrator: &mut Orchestrator) {
    orchestrator
        .initialize(ScenarioId::new("determinism"), start_time(), Location::new("Cleveland, USA"))
        .await
        .unwrap();
}

async fn run_chatty(seed: u64, ticks: u64) -> Orchestrator {
    let mut orchestrator = chatty(config(seed, 0));
    initialize(&mut orchestrator).await;
    orchestrator.fast_forward(ticks).await.unwrap();
    orchestrator
}

async fn run(seed: u64, ticks: u64) -> Orchestrator {
    let mut orchestrator = orchestrator(config(seed, 0));
    orchestrator
        .initialize(ScenarioId::new("determinism"), start_time(), Location::new("Cleveland, USA"))
        .await
        .unwrap();
    orchestrator.fast_forward(ticks).await.unwrap();
    orchestrator
}

#[tokio::test]
async fn same_seed_same_bytes() {
    let first = run(42, 25).await;
    let second = run(42, 25).await;
    assert_eq!(
        first.state().serialize().unwrap(),
        second.state().serialize().unwrap()
    );

    let other = run(43, 25).await;
    assert_ne!(
        first.state().get_engine_state("north"),
        other.state().get_engine_state("north")
    );
}

#[tokio::test]
async fn clock_advances_exactly_once_per_tick() {
    let orchestrator = run(7, 17).await;
    let state = orchestrator.state();
    assert_eq!(state.tick_count(), 17);
    assert_eq!(state.current_time(), start_time() + TimeDelta::days(17));
    assert_eq!(state.get_engine_state("south")["steps"], json!(17));
}

#[tokio::test]
async fn reachable_states_round_trip() {
    let orchestrator = run(11, 9).await;
    let migrations = MigrationRegistry::default();
    let bytes = orchestrator.state().serialize().unwrap();
    let decoded = WorldState::deserialize(&bytes, &migrations).unwrap();
    assert_eq!(decoded.serialize().unwrap(), bytes);

    let compressed = orchestrator.state().to_compressed().unwrap();
    let restored = WorldState::from_compressed(&compressed, &migrations).unwrap();
    assert_eq!(restored.serialize().unwrap(), bytes);
}

#[tokio::test]
async fn diffs_rebuild_the_later_state() {
    let mut orchestrator = run(5, 3).await;
    let earlier = orchestrator.state().clone();
    orchestrator.fast_forward(4).await.unwrap();

    let diff = orchestrator.state().diff(&earlier);
    let mut rebuilt = earlier;
    rebuilt.apply_diff(&diff).unwrap();
    assert_eq!(
        rebuilt.serialize().unwrap(),
        orchestrator.state().serialize().unwrap()
    );
}

#[tokio::test]
async fn restore_from_persistence_continues_identically() {
    let persistence = Arc::new(InMemoryPersistence::new());
    let mut original = orchestrator(config(42, 5)).with_persistence(persistence.clone());
    original
        .initialize(ScenarioId::new("determinism"), start_time(), Location::new("Cleveland, USA"))
        .await
        .unwrap();
    original.fast_forward(10).await.unwrap();
    assert_eq!(persistence.ticks().await, vec![0, 5, 10]);

    let mut resumed = orchestrator(config(42, 5)).with_persistence(persistence.clone());
    resumed.restore(SnapshotSelector::AtTick(5)).await.unwrap();
    assert_eq!(resumed.state().tick_count(), 5);
    resumed.fast_forward(5).await.unwrap();
    assert_eq!(
        resumed.state().serialize().unwrap(),
        original.state().serialize().unwrap()
    );

    let mut latest = orchestrator(config(42, 5)).with_persistence(persistence);
    latest.restore(SnapshotSelector::Latest).await.unwrap();
    assert_eq!(latest.state().tick_count(), 10);
}

#[tokio::test]
async fn jump_back_replays_to_the_same_state() {
    let mut orchestrator = orchestrator(config(42, 5));
    orchestrator
        .initialize(ScenarioId::new("determinism"), start_time(), Location::new("Cleveland, USA"))
        .await
        .unwrap();
    orchestrator.fast_forward(12).await.unwrap();

    let target = start_time() + TimeDelta::days(7) + TimeDelta::hours(6);
    let report = orchestrator.jump(target).await.unwrap();
    assert_eq!(report.restored_tick, Some(5));
    assert_eq!(report.ticks_replayed, 2);
    assert_eq!(report.final_tick, 7);
    assert_eq!(report.final_time, start_time() + TimeDelta::days(7));

    let straight = run(42, 7).await;
    assert_eq!(
        orchestrator.state().serialize().unwrap(),
        straight.state().serialize().unwrap()
    );
    assert_eq!(orchestrator.scheduler().snapshot_ticks().await, vec![0, 5]);

    let forward = orchestrator
        .jump(start_time() + TimeDelta::days(9))
        .await
        .unwrap();
    assert_eq!(forward.restored_tick, None);
    assert_eq!(forward.final_tick, 9);
}

#[tokio::test]
async fn version_zero_documents_migrate_without_loss() {
    let orchestrator = run(42, 4).await;
    let mut legacy: Value =
        serde_json::from_slice(&orchestrator.state().serialize().unwrap()).unwrap();
    let object = legacy.as_object_mut().unwrap();
    object.insert(String::from("schema_version"), json!(0));
    let location = object.remove("location").unwrap();
    object.insert(String::from("current_location"), location);
    object.remove("timeline_id");
    object.remove("random");
    object.insert(String::from("seed"), json!(42));

    let bytes = serde_json::to_vec(&legacy).unwrap();
    let migrated = WorldState::deserialize(&bytes, &MigrationRegistry::default()).unwrap();
    assert_eq!(migrated.schema_version(), 1);
    assert_eq!(migrated.location().as_str(), "Cleveland, USA");
    assert_eq!(migrated.tick_count(), 4);
    assert_eq!(migrated.timeline_id(), orchestrator.state().timeline_id());
    assert_eq!(
        migrated.get_engine_state("north"),
        orchestrator.state().get_engine_state("north")
    );
    assert_eq!(
        migrated.get_engine_state("south"),
        orchestrator.state().get_engine_state("south")
    );
}

#[tokio::test]
async fn branches_evolve_independently() {
    let mut orchestrator = run(42, 6).await;
    let ancestor_bytes = orchestrator.state().serialize().unwrap();

    let ancestor = orchestrator.branch("drought").await.unwrap();
    orchestrator.fast_forward(6).await.unwrap();
    assert_eq!(ancestor.serialize().unwrap(), ancestor_bytes);

    // The ancestor continues exactly as if the branch never happened.
    let mut replay = resumed_at(&ancestor, self::orchestrator(config(42, 0))).await;
    replay.fast_forward(6).await.unwrap();
    let straight = run(42, 12).await;
    assert_eq!(
        replay.state().serialize().unwrap(),
        straight.state().serialize().unwrap()
    );

    assert_eq!(orchestrator.state().tick_count(), 12);
    assert_eq!(
        orchestrator.state().parent_timeline(),
        Some(straight.state().timeline_id())
    );
    assert_ne!(
        orchestrator.state().timeline_id(),
        straight.state().timeline_id()
    );
}

async fn resumed_at(state: &WorldState, mut orchestrator: Orchestrator) -> Orchestrator {
    let snapshot = Snapshot::capture(state).unwrap();
    orchestrator.restore_snapshot(&snapshot).await.unwrap();
    orchestrator
}

#[tokio::test]
async fn subscribers_hear_every_event_exactly_once() {
    let orchestrator = run_chatty(42, 10).await;
    let state = orchestrator.state();
    assert_eq!(state.get_engine_state("herald")["omens"], json!(10));
    // Omens from tick N are heard at tick N + 1; the last one is queued.
    assert_eq!(state.get_engine_state("oracle")["heard"], json!(9));
    assert_eq!(state.get_engine_state("oracle")["last"]["tick"], json!(9));
    let queued = state.pending_events("oracle");
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].payload["tick"], json!(10));
    assert_eq!(queued[0].queued_at, state.current_time());

    let again = run_chatty(42, 10).await;
    assert_eq!(
        again.state().serialize().unwrap(),
        state.serialize().unwrap()
    );
}

#[tokio::test]
async fn restore_with_queued_events_continues_identically() {
    let persistence = Arc::new(InMemoryPersistence::new());
    let mut original = chatty(config(42, 5)).with_persistence(persistence.clone());
    initialize(&mut original).await;
    original.fast_forward(10).await.unwrap();

    let mut resumed = chatty(config(42, 5)).with_persistence(persistence);
    resumed.restore(SnapshotSelector::AtTick(5)).await.unwrap();
    assert_eq!(resumed.state().pending_events("oracle").len(), 1);
    resumed.fast_forward(5).await.unwrap();

    assert_eq!(
        resumed.state().get_engine_state("oracle")["heard"],
        json!(9)
    );
    assert_eq!(
        resumed.state().serialize().unwrap(),
        original.state().serialize().unwrap()
    );
}

#[tokio::test]
async fn jump_back_with_queued_events_matches_a_straight_run() {
    let mut orchestrator = chatty(config(42, 5));
    initialize(&mut orchestrator).await;
    orchestrator.fast_forward(12).await.unwrap();

    let report = orchestrator
        .jump(start_time() + TimeDelta::days(7))
        .await
        .unwrap();
    assert_eq!(report.restored_tick, Some(5));
    assert_eq!(report.ticks_replayed, 2);

    let straight = run_chatty(42, 7).await;
    assert_eq!(
        orchestrator.state().serialize().unwrap(),
        straight.state().serialize().unwrap()
    );
}

#[tokio::test]
async fn branch_with_queued_events_matches_its_parent() {
    let mut orchestrator = run_chatty(42, 6).await;
    let ancestor = orchestrator.branch("eclipse").await.unwrap();

    let fork = orchestrator.state();
    assert_eq!(fork.tick_count(), ancestor.tick_count());
    assert_eq!(fork.pending_events("oracle").len(), 1);
    assert_eq!(
        fork.pending_events("oracle"),
        ancestor.pending_events("oracle")
    );
    for engine in ["herald", "oracle"] {
        assert_eq!(
            fork.get_engine_state(engine),
            ancestor.get_engine_state(engine)
        );
    }

    let mut replay = resumed_at(&ancestor, chatty(config(42, 0))).await;
    replay.fast_forward(6).await.unwrap();
    let straight = run_chatty(42, 12).await;
    assert_eq!(
        replay.state().serialize().unwrap(),
        straight.state().serialize().unwrap()
    );

    orchestrator.fast_forward(6).await.unwrap();
    assert_eq!(
        orchestrator.state().get_engine_state("oracle"),
        straight.state().get_engine_state("oracle")
    );
}
