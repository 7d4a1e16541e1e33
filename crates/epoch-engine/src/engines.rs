//! Demonstration engines wired into the binary.
//!
//! These are stand-ins for real domain models. Together they exercise the
//! engine contract: state slices, namespaced random streams, declared
//! dependencies, and cross-engine events through mailboxes.
//!
//! - [`CalendarEngine`] tracks the calendar and announces new years.
//! - [`PopulationEngine`] draws births and deaths each tick.
//! - [`MarketEngine`] moves a price in response to population changes.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeDelta, Utc};
use epoch_core::{Engine, EngineContext, EngineError};
use epoch_events::Event;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

/// Published by the calendar when the simulation enters a new year.
pub const NEW_YEAR: &str = "calendar.new_year";

/// Published by the population engine after every tick.
pub const POPULATION_CHANGED: &str = "population.changed";

const CALENDAR: &str = "calendar";
const POPULATION: &str = "population";
const MARKET: &str = "market";

const INITIAL_POPULATION: u64 = 10_000;
const INITIAL_PRICE_CENTS: u64 = 1_000;

/// All demonstration engines, in no particular order.
pub fn demonstration_engines() -> Vec<Box<dyn Engine>> {
    vec![
        Box::new(MarketEngine),
        Box::new(PopulationEngine),
        Box::new(CalendarEngine),
    ]
}

async fn announce(ctx: &EngineContext<'_>, event_type: &str, payload: Value) {
    let outcome = ctx.publish(event_type, payload).await;
    if !outcome.is_accepted() {
        warn!(engine = ctx.engine_name(), event_type, "Event dropped by the bus");
    }
}

// ---------------------------------------------------------------------------
// Calendar
// ---------------------------------------------------------------------------

/// Calendar slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarState {
    /// Current year.
    pub year: i32,
    /// Day of the year, starting at 1.
    pub day_of_year: u32,
    /// Whole simulated days since initialize.
    pub days_elapsed: u64,
}

impl CalendarState {
    fn at(time: DateTime<Utc>, days_elapsed: u64) -> Self {
        Self {
            year: time.year(),
            day_of_year: time.ordinal(),
            days_elapsed,
        }
    }
}

/// Keeps the calendar slice and announces year changes. Critical: the
/// other engines lean on it.
#[derive(Debug, Default)]
pub struct CalendarEngine;

#[async_trait]
impl Engine for CalendarEngine {
    fn name(&self) -> &str {
        CALENDAR
    }

    fn is_critical(&self) -> bool {
        true
    }

    async fn initialize(&mut self, ctx: &mut EngineContext<'_>) -> Result<(), EngineError> {
        if !ctx.has_own_state() {
            ctx.set_own_state_from(&CalendarState::at(ctx.current_time(), 0))?;
        }
        Ok(())
    }

    async fn tick(
        &mut self,
        ctx: &mut EngineContext<'_>,
        delta: TimeDelta,
    ) -> Result<(), EngineError> {
        let now = ctx.current_time();
        let previous = ctx
            .own_state_as::<CalendarState>()?
            .unwrap_or_else(|| CalendarState::at(now, 0));
        let elapsed = u64::try_from(delta.num_days()).unwrap_or(0);
        let current = CalendarState::at(now, previous.days_elapsed.saturating_add(elapsed));

        if current.year != previous.year {
            debug!(year = current.year, tick = ctx.tick_count(), "New year");
            announce(ctx, NEW_YEAR, json!({ "year": current.year })).await;
        }
        ctx.set_own_state_from(&current)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Population
// ---------------------------------------------------------------------------

/// Population slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulationState {
    /// Living population.
    pub size: u64,
    /// Births during the last tick.
    pub births: u64,
    /// Deaths during the last tick.
    pub deaths: u64,
    /// Year of the last census, taken on each new year.
    pub census_year: Option<i32>,
}

impl Default for PopulationState {
    fn default() -> Self {
        Self {
            size: INITIAL_POPULATION,
            births: 0,
            deaths: 0,
            census_year: None,
        }
    }
}

/// Draws births and deaths from its own random streams.
#[derive(Debug, Default)]
pub struct PopulationEngine;

#[async_trait]
impl Engine for PopulationEngine {
    fn name(&self) -> &str {
        POPULATION
    }

    fn priority(&self) -> i32 {
        1
    }

    fn dependencies(&self) -> Vec<String> {
        vec![CALENDAR.to_owned()]
    }

    fn subscriptions(&self) -> Vec<String> {
        vec![NEW_YEAR.to_owned()]
    }

    async fn initialize(&mut self, ctx: &mut EngineContext<'_>) -> Result<(), EngineError> {
        if !ctx.has_own_state() {
            ctx.set_own_state_from(&PopulationState::default())?;
        }
        Ok(())
    }

    async fn handle_event(
        &mut self,
        ctx: &mut EngineContext<'_>,
        event: &Event,
    ) -> Result<(), EngineError> {
        if event.event_type != NEW_YEAR {
            return Ok(());
        }
        let year = event
            .payload
            .get("year")
            .and_then(Value::as_i64)
            .and_then(|year| i32::try_from(year).ok())
            .ok_or_else(|| EngineError::failed("new-year event without a year"))?;
        let mut state = ctx.own_state_as::<PopulationState>()?.unwrap_or_default();
        state.census_year = Some(year);
        ctx.set_own_state_from(&state)
    }

    async fn tick(
        &mut self,
        ctx: &mut EngineContext<'_>,
        delta: TimeDelta,
    ) -> Result<(), EngineError> {
        let mut state = ctx.own_state_as::<PopulationState>()?.unwrap_or_default();
        let days = u64::try_from(delta.num_days().max(1)).unwrap_or(1);
        let ceiling = state.size.saturating_mul(days).saturating_div(2_000);

        let births = ctx.rng("births").random_range(0..=ceiling);
        let deaths = ctx.rng("deaths").random_range(0..=ceiling);
        state.size = state.size.saturating_add(births).saturating_sub(deaths);
        state.births = births;
        state.deaths = deaths;

        ctx.set_own_state_from(&state)?;
        announce(
            ctx,
            POPULATION_CHANGED,
            json!({ "size": state.size, "births": births, "deaths": deaths }),
        )
        .await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Market
// ---------------------------------------------------------------------------

/// Market slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketState {
    /// Price of the single traded good, in cents.
    pub price_cents: u64,
    /// Population size from the last `population.changed` event.
    pub observed_population: u64,
    /// `population.changed` events received.
    pub updates: u64,
}

/// Random-walk price nudged by population growth.
#[derive(Debug, Default)]
pub struct MarketEngine;

impl MarketEngine {
    fn current(ctx: &EngineContext<'_>) -> Result<MarketState, EngineError> {
        Ok(ctx
            .own_state_as::<MarketState>()?
            .unwrap_or(MarketState {
                price_cents: INITIAL_PRICE_CENTS,
                observed_population: 0,
                updates: 0,
            }))
    }
}

#[async_trait]
impl Engine for MarketEngine {
    fn name(&self) -> &str {
        MARKET
    }

    fn priority(&self) -> i32 {
        2
    }

    fn dependencies(&self) -> Vec<String> {
        vec![POPULATION.to_owned()]
    }

    fn subscriptions(&self) -> Vec<String> {
        vec![POPULATION_CHANGED.to_owned()]
    }

    async fn initialize(&mut self, ctx: &mut EngineContext<'_>) -> Result<(), EngineError> {
        if !ctx.has_own_state() {
            let observed = ctx
                .state_of(POPULATION)
                .get("size")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            ctx.set_own_state_from(&MarketState {
                price_cents: INITIAL_PRICE_CENTS,
                observed_population: observed,
                updates: 0,
            })?;
        }
        Ok(())
    }

    async fn handle_event(
        &mut self,
        ctx: &mut EngineContext<'_>,
        event: &Event,
    ) -> Result<(), EngineError> {
        let size = event
            .payload
            .get("size")
            .and_then(Value::as_u64)
            .ok_or_else(|| EngineError::failed("population event without a size"))?;
        let mut state = Self::current(ctx)?;
        state.observed_population = size;
        state.updates = state.updates.saturating_add(1);
        ctx.set_own_state_from(&state)
    }

    async fn tick(
        &mut self,
        ctx: &mut EngineContext<'_>,
        _delta: TimeDelta,
    ) -> Result<(), EngineError> {
        let mut state = Self::current(ctx)?;
        let population = ctx
            .state_of(POPULATION)
            .get("size")
            .and_then(Value::as_u64)
            .unwrap_or(state.observed_population);

        let pressure: i64 = match population.cmp(&state.observed_population) {
            core::cmp::Ordering::Greater => 5,
            core::cmp::Ordering::Less => -5,
            core::cmp::Ordering::Equal => 0,
        };
        let shock: i64 = ctx.rng("prices").random_range(-25..=25);
        state.price_cents = state
            .price_cents
            .saturating_add_signed(shock.saturating_add(pressure))
            .max(1);

        ctx.set_own_state_from(&state)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]
mod tests {
    use epoch_core::{Orchestrator, SimulationConfig, Snapshot};
    use epoch_types::{Location, ScenarioId};

    use super::*;

    fn demo(snapshot_interval_ticks: u64) -> Orchestrator {
        let mut config = SimulationConfig::default();
        config.scheduler.tick_interval_ms = 0;
        config.scheduler.snapshot_interval_ticks = snapshot_interval_ticks;
        let mut orchestrator = Orchestrator::new(config).unwrap();
        for engine in demonstration_engines() {
            orchestrator.register_engine(engine).unwrap();
        }
        orchestrator
    }

    async fn started(snapshot_interval_ticks: u64, start: DateTime<Utc>) -> Orchestrator {
        let mut orchestrator = demo(snapshot_interval_ticks);
        orchestrator
            .initialize(ScenarioId::new("demo"), start, Location::new("Cleveland, USA"))
            .await
            .unwrap();
        orchestrator
    }

    async fn run(start: DateTime<Utc>, ticks: u64) -> Orchestrator {
        let mut orchestrator = started(0, start).await;
        orchestrator.fast_forward(ticks).await.unwrap();
        orchestrator
    }

    fn market_updates(orchestrator: &Orchestrator) -> u64 {
        let market: MarketState = orchestrator
            .state()
            .engine_state_as(MARKET)
            .unwrap()
            .unwrap();
        market.updates
    }

    fn jan_first() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap()
    }

    #[tokio::test]
    async fn dependencies_fix_the_order() {
        let orchestrator = run(jan_first(), 0).await;
        assert_eq!(
            orchestrator.execution_order(),
            vec![CALENDAR, POPULATION, MARKET]
        );
    }

    #[tokio::test]
    async fn market_sees_every_population_change() {
        let orchestrator = run(jan_first(), 30).await;
        let state = orchestrator.state();

        let calendar: CalendarState = state.engine_state_as(CALENDAR).unwrap().unwrap();
        assert_eq!(calendar.days_elapsed, 30);
        assert_eq!(calendar.day_of_year, 31);

        let market: MarketState = state.engine_state_as(MARKET).unwrap().unwrap();
        // Events from tick N reach the market at tick N + 1.
        assert_eq!(market.updates, 29);
        assert!(market.price_cents >= 1);
    }

    #[tokio::test]
    async fn census_follows_the_new_year() {
        let start = DateTime::<Utc>::from_timestamp(1_767_052_800, 0).unwrap(); // 2025-12-30
        let orchestrator = run(start, 3).await;
        let population: PopulationState = orchestrator
            .state()
            .engine_state_as(POPULATION)
            .unwrap()
            .unwrap();
        assert_eq!(population.census_year, Some(2026));
    }

    #[tokio::test]
    async fn restored_world_delivers_the_queued_population_change() {
        let mut original = run(jan_first(), 5).await;
        let snapshot = Snapshot::capture(original.state()).unwrap();
        original.fast_forward(5).await.unwrap();
        assert_eq!(market_updates(&original), 9);

        let mut resumed = demo(0);
        resumed.restore_snapshot(&snapshot).await.unwrap();
        resumed.fast_forward(5).await.unwrap();
        assert_eq!(market_updates(&resumed), 9);
        assert_eq!(
            resumed.state().serialize().unwrap(),
            original.state().serialize().unwrap()
        );
    }

    #[tokio::test]
    async fn jumping_back_replays_the_market_exactly() {
        let mut orchestrator = started(5, jan_first()).await;
        orchestrator.fast_forward(12).await.unwrap();

        let report = orchestrator
            .jump(jan_first() + TimeDelta::days(8))
            .await
            .unwrap();
        assert_eq!(report.restored_tick, Some(5));
        assert_eq!(report.ticks_replayed, 3);

        let straight = run(jan_first(), 8).await;
        assert_eq!(market_updates(&orchestrator), 7);
        assert_eq!(
            orchestrator.state().serialize().unwrap(),
            straight.state().serialize().unwrap()
        );
    }

    #[tokio::test]
    async fn branch_starts_from_its_parent_and_the_parent_carries_on() {
        let mut orchestrator = run(jan_first(), 6).await;
        let ancestor = orchestrator.branch("tariff").await.unwrap();

        for engine in [CALENDAR, POPULATION, MARKET] {
            assert_eq!(
                orchestrator.state().get_engine_state(engine),
                ancestor.get_engine_state(engine)
            );
            assert_eq!(
                orchestrator.state().pending_events(engine),
                ancestor.pending_events(engine)
            );
        }
        assert_eq!(ancestor.pending_events(MARKET).len(), 1);

        let mut parent = demo(0);
        parent
            .restore_snapshot(&Snapshot::capture(&ancestor).unwrap())
            .await
            .unwrap();
        parent.fast_forward(4).await.unwrap();
        let straight = run(jan_first(), 10).await;
        assert_eq!(
            parent.state().serialize().unwrap(),
            straight.state().serialize().unwrap()
        );
    }

    #[tokio::test]
    async fn runs_are_reproducible() {
        let first = run(jan_first(), 40).await;
        let second = run(jan_first(), 40).await;
        assert_eq!(
            first.state().serialize().unwrap(),
            second.state().serialize().unwrap()
        );
    }
}
