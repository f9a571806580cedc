//! Deterministic queue references for directives.
//!
//! A reference is `<Prefix>_<hash8>`, where `hash8` is the first 8 hex
//! characters of the SHA-256 digest of the directive's canonical JSON (object
//! keys sorted recursively). References that repeat within one upload get a
//! `_<n>` suffix on every occurrence so that no item overwrites another.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::core::types::{Action, Directive, DirectiveSet};

pub const HASH_LEN: usize = 8;

/// A directive ready to be enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedItem {
    pub reference: String,
    /// Canonical JSON of the directive.
    pub payload: String,
    pub directive: Directive,
}

/// All items of one action class, uploaded as a single bulk call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedBatch {
    pub action: Action,
    pub items: Vec<PlannedItem>,
}

/// Serialise `value` with object keys sorted at every level.
pub fn canonical_json<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let value = serde_json::to_value(value)?;
    serde_json::to_string(&sort_keys(&value))
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(key, val)| (key, sort_keys(val))).collect();
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(key, val)| (key.clone(), val))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Short digest of a value's canonical serialisation.
pub fn hash8<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let canonical = canonical_json(value)?;
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(HASH_LEN);
    Ok(hex)
}

pub fn reference_for(directive: &Directive) -> serde_json::Result<String> {
    Ok(format!(
        "{}_{}",
        directive.action.reference_prefix(),
        hash8(directive)?
    ))
}

/// Compute references for every directive and disambiguate repeats.
///
/// Batches come out in [`Action::ALL`] order; empty classes yield empty batches.
pub fn plan_batches(set: &DirectiveSet) -> serde_json::Result<Vec<PlannedBatch>> {
    let mut batches = Vec::with_capacity(Action::ALL.len());
    for action in Action::ALL {
        let mut items = Vec::new();
        for directive in set.list(action) {
            items.push(PlannedItem {
                reference: reference_for(directive)?,
                payload: canonical_json(directive)?,
                directive: directive.clone(),
            });
        }
        batches.push(PlannedBatch { action, items });
    }
    disambiguate(&mut batches);
    Ok(batches)
}

fn disambiguate(batches: &mut [PlannedBatch]) {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for item in batches.iter().flat_map(|batch| batch.items.iter()) {
        *counts.entry(item.reference.clone()).or_default() += 1;
    }

    let mut used: HashSet<String> = counts
        .iter()
        .filter(|(_, count)| **count == 1)
        .map(|(reference, _)| reference.clone())
        .collect();
    let mut next_index: HashMap<String, usize> = HashMap::new();

    for item in batches.iter_mut().flat_map(|batch| batch.items.iter_mut()) {
        if counts.get(&item.reference).copied().unwrap_or(0) < 2 {
            continue;
        }
        let index = next_index.entry(item.reference.clone()).or_insert(0);
        loop {
            *index += 1;
            let candidate = format!("{}_{}", item.reference, index);
            if used.insert(candidate.clone()) {
                item.reference = candidate;
                break;
            }
        }
    }
}
