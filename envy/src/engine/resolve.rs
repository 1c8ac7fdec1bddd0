//! Weak/bare dependency resolution and cycle detection.
//!
//! Runs inside a recipe's check phase, after the resolution barrier: every
//! recipe has completed recipe-load, so query matching sees the full static
//! graph. Weak fallbacks instantiated here are the only recipes created
//! after the barrier.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use itertools::Itertools;
use tracing::debug;

use crate::core::errors::EnvyError;
use crate::core::key::RecipeKey;
use crate::core::phase::Phase;
use crate::core::recipe::{DepEdge, ProductDep, Recipe, ResolvedDep};
use crate::engine::EngineInner;

/// Binds every pending edge of `recipe`, rebuilds its product-dependency
/// map, and rejects cycles reachable from it.
pub(crate) fn resolve_edges(engine: &EngineInner, recipe: &Arc<Recipe>) -> Result<()> {
    let snapshot = recipe.data().edges.clone();
    let consumer = recipe.key();

    let mut resolved = Vec::with_capacity(snapshot.len());
    for edge in snapshot {
        match edge {
            DepEdge::Resolved(dep) => resolved.push(dep),
            DepEdge::PendingWeak {
                query,
                fallback,
                needed_by,
                product,
            } => {
                let matches = engine.find_matches(&query);
                let key = match matches.len() {
                    1 => matches[0].key().clone(),
                    0 => {
                        debug!(
                            consumer = %consumer,
                            query = %query,
                            fallback = %fallback.identity,
                            "weak dependency unmatched, instantiating fallback"
                        );
                        let child = engine.ensure_recipe(&fallback)?;
                        engine.extend_target(child.key(), Phase::RecipeLoad);
                        engine.register_alias(query.clone(), child.key().clone())?;
                        child.key().clone()
                    }
                    _ => return Err(ambiguous(consumer, &query, &matches)),
                };
                resolved.push(ResolvedDep {
                    query,
                    key,
                    needed_by,
                    product,
                });
            }
            DepEdge::PendingBare {
                query,
                needed_by,
                product,
            } => {
                let matches = engine.find_matches(&query);
                let key = match matches.len() {
                    1 => matches[0].key().clone(),
                    0 => {
                        return Err(EnvyError::MissingDependency {
                            consumer: consumer.to_string(),
                            query: query.to_string(),
                        }
                        .into());
                    }
                    _ => return Err(ambiguous(consumer, &query, &matches)),
                };
                resolved.push(ResolvedDep {
                    query,
                    key,
                    needed_by,
                    product,
                });
            }
        }
    }

    {
        let mut data = recipe.data();
        data.product_deps = resolved
            .iter()
            .filter_map(|dep| {
                dep.product.as_ref().map(|name| {
                    (
                        name.clone(),
                        ProductDep {
                            provider: dep.key.clone(),
                            needed_by: dep.needed_by,
                            constraint: dep.query.clone(),
                        },
                    )
                })
            })
            .collect();
        data.edges = resolved.into_iter().map(DepEdge::Resolved).collect();
    }

    detect_cycles(engine, consumer)
}

fn ambiguous(consumer: &RecipeKey, query: &str, matches: &[Arc<Recipe>]) -> anyhow::Error {
    EnvyError::AmbiguousDependency {
        consumer: consumer.to_string(),
        query: query.to_string(),
        matches: matches
            .iter()
            .map(|r| r.key().to_string())
            .sorted()
            .collect(),
    }
    .into()
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum VisitState {
    Visiting,
    Done,
}

/// Depth-first search over resolved edges, rejecting any cycle reachable
/// from `start` — including self-edges. Edges of other recipes that are
/// still pending are invisible here; whichever recipe resolves them later
/// repeats the check from its own root.
pub(crate) fn detect_cycles(engine: &EngineInner, start: &RecipeKey) -> Result<()> {
    let mut states: HashMap<RecipeKey, VisitState> = HashMap::new();
    let mut path: Vec<RecipeKey> = Vec::new();
    visit(engine, start, &mut states, &mut path)
}

fn visit(
    engine: &EngineInner,
    key: &RecipeKey,
    states: &mut HashMap<RecipeKey, VisitState>,
    path: &mut Vec<RecipeKey>,
) -> Result<()> {
    match states.get(key) {
        Some(VisitState::Done) => return Ok(()),
        Some(VisitState::Visiting) => {
            let start = path.iter().position(|k| k == key).unwrap_or(0);
            let cycle = path[start..]
                .iter()
                .chain(std::iter::once(key))
                .map(|k| k.to_string())
                .collect();
            return Err(EnvyError::DependencyCycle { path: cycle }.into());
        }
        None => {}
    }

    states.insert(key.clone(), VisitState::Visiting);
    path.push(key.clone());
    if let Some(recipe) = engine.recipe(key) {
        for edge in recipe.resolved_edges() {
            visit(engine, &edge.key, states, path)?;
        }
    }
    path.pop();
    states.insert(key.clone(), VisitState::Done);
    Ok(())
}
