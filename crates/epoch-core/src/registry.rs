//! Engine registration records and execution-order resolution.
//!
//! The order is a stable topological sort over declared dependencies.
//! Among engines whose dependencies are all placed, the one with the lowest
//! priority runs first, and registration order breaks remaining ties. The
//! result depends only on the registrations, never on hashing or timing.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::engine::Engine;
use crate::orchestrator::OrchestratorError;

/// What the orchestrator knows about a registered engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineRegistration {
    /// Unique engine name.
    pub name: String,
    /// Lower runs earlier.
    pub priority: i32,
    /// Engines that must run first.
    pub dependencies: Vec<String>,
    /// Whether a failure halts the simulation.
    pub critical: bool,
    /// Slice returned before the engine writes one.
    pub default_state: Value,
    /// Event topics fed to the engine's mailbox.
    pub subscriptions: Vec<String>,
    /// Position in registration order.
    pub index: usize,
}

impl EngineRegistration {
    /// Read the registration record from an engine.
    pub fn from_engine(engine: &dyn Engine, index: usize) -> Self {
        Self {
            name: engine.name().to_owned(),
            priority: engine.priority(),
            dependencies: engine.dependencies(),
            critical: engine.is_critical(),
            default_state: engine.default_state(),
            subscriptions: engine.subscriptions(),
            index,
        }
    }
}

/// Resolve the execution order. Returns indices into `registrations`.
///
/// # Errors
///
/// Returns [`OrchestratorError::DuplicateEngine`],
/// [`OrchestratorError::UnknownDependency`], or
/// [`OrchestratorError::DependencyCycle`].
pub fn resolve_order(registrations: &[EngineRegistration]) -> Result<Vec<usize>, OrchestratorError> {
    let mut by_name: BTreeMap<&str, usize> = BTreeMap::new();
    for (position, registration) in registrations.iter().enumerate() {
        if by_name.insert(registration.name.as_str(), position).is_some() {
            return Err(OrchestratorError::DuplicateEngine {
                name: registration.name.clone(),
            });
        }
    }

    let mut pending: Vec<usize> = vec![0; registrations.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); registrations.len()];
    for (position, registration) in registrations.iter().enumerate() {
        let unique: BTreeSet<&str> = registration.dependencies.iter().map(String::as_str).collect();
        for dependency in unique {
            let Some(&upstream) = by_name.get(dependency) else {
                return Err(OrchestratorError::UnknownDependency {
                    engine: registration.name.clone(),
                    dependency: dependency.to_owned(),
                });
            };
            if let Some(list) = dependents.get_mut(upstream) {
                list.push(position);
            }
            if let Some(count) = pending.get_mut(position) {
                *count = count.saturating_add(1);
            }
        }
    }

    let key = |position: usize| {
        let registration = registrations.get(position);
        (
            registration.map_or(0, |r| r.priority),
            registration.map_or(position, |r| r.index),
            position,
        )
    };

    let mut ready: BTreeSet<(i32, usize, usize)> = pending
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == 0)
        .map(|(position, _)| key(position))
        .collect();

    let mut order = Vec::with_capacity(registrations.len());
    while let Some((_, _, position)) = ready.pop_first() {
        order.push(position);
        for &downstream in dependents.get(position).into_iter().flatten() {
            if let Some(count) = pending.get_mut(downstream) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    ready.insert(key(downstream));
                }
            }
        }
    }

    if order.len() < registrations.len() {
        let engines = pending
            .iter()
            .zip(registrations)
            .filter(|(count, _)| **count > 0)
            .map(|(_, registration)| registration.name.clone())
            .collect();
        return Err(OrchestratorError::DependencyCycle { engines });
    }
    Ok(order)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn reg(name: &str, priority: i32, dependencies: &[&str]) -> EngineRegistration {
        EngineRegistration {
            name: name.to_owned(),
            priority,
            dependencies: dependencies.iter().map(|d| (*d).to_owned()).collect(),
            critical: false,
            default_state: Value::Null,
            subscriptions: Vec::new(),
            index: 0,
        }
    }

    fn indexed(mut registrations: Vec<EngineRegistration>) -> Vec<EngineRegistration> {
        for (i, registration) in registrations.iter_mut().enumerate() {
            registration.index = i;
        }
        registrations
    }

    fn names(registrations: &[EngineRegistration], order: &[usize]) -> Vec<String> {
        order
            .iter()
            .map(|&i| registrations[i].name.clone())
            .collect()
    }

    #[test]
    fn priority_then_dependencies() {
        let regs = indexed(vec![reg("a", 0, &[]), reg("b", 1, &[]), reg("c", 1, &["a"])]);
        let order = resolve_order(&regs).unwrap();
        assert_eq!(names(&regs, &order), vec!["a", "b", "c"]);
    }

    #[test]
    fn dependencies_override_priority() {
        let regs = indexed(vec![reg("late", 10, &[]), reg("eager", -5, &["late"])]);
        let order = resolve_order(&regs).unwrap();
        assert_eq!(names(&regs, &order), vec!["late", "eager"]);
    }

    #[test]
    fn registration_order_breaks_ties() {
        let regs = indexed(vec![reg("z", 0, &[]), reg("y", 0, &[]), reg("x", 0, &[])]);
        let order = resolve_order(&regs).unwrap();
        assert_eq!(names(&regs, &order), vec!["z", "y", "x"]);
    }

    #[test]
    fn order_is_stable_across_calls() {
        let regs = indexed(vec![
            reg("geo", 0, &[]),
            reg("pop", 1, &["geo"]),
            reg("econ", 1, &["pop", "geo"]),
            reg("belief", 2, &["pop"]),
            reg("weather", 0, &[]),
        ]);
        let first = resolve_order(&regs).unwrap();
        for _ in 0..10 {
            assert_eq!(resolve_order(&regs).unwrap(), first);
        }
        assert_eq!(
            names(&regs, &first),
            vec!["geo", "weather", "pop", "econ", "belief"]
        );
    }

    #[test]
    fn duplicate_dependency_entries_are_harmless() {
        let regs = indexed(vec![reg("a", 0, &[]), reg("b", 0, &["a", "a"])]);
        assert_eq!(names(&regs, &resolve_order(&regs).unwrap()), vec!["a", "b"]);
    }

    #[test]
    fn cycles_are_reported() {
        let regs = indexed(vec![
            reg("a", 0, &["c"]),
            reg("b", 0, &["a"]),
            reg("c", 0, &["b"]),
            reg("free", 0, &[]),
        ]);
        match resolve_order(&regs).unwrap_err() {
            OrchestratorError::DependencyCycle { engines } => {
                assert_eq!(engines, vec!["a", "b", "c"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let regs = indexed(vec![reg("a", 0, &["a"])]);
        assert!(matches!(
            resolve_order(&regs),
            Err(OrchestratorError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn unknown_dependency() {
        let regs = indexed(vec![reg("a", 0, &["ghost"])]);
        assert!(matches!(
            resolve_order(&regs),
            Err(OrchestratorError::UnknownDependency { ref dependency, .. }) if dependency == "ghost"
        ));
    }

    #[test]
    fn duplicate_names() {
        let regs = indexed(vec![reg("a", 0, &[]), reg("a", 1, &[])]);
        assert!(matches!(
            resolve_order(&regs),
            Err(OrchestratorError::DuplicateEngine { .. })
        ));
    }
}
