//! Policy registry: declared policies plus runtime field overrides.
//!
//! Reads load an immutable snapshot through `ArcSwap` and never block. Writers are
//! serialized, rebuild the affected entry and publish a new snapshot, so a reader
//! observes either the old or the new resolved policy, never a mix.

use crate::error::PolicyError;
use crate::policy::{GuardedOperationPolicy, OperationId, PolicyKind};
use arc_swap::ArcSwap;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

type Overrides = BTreeMap<(PolicyKind, String), String>;

#[derive(Debug)]
struct Entry {
    declared: GuardedOperationPolicy,
    overrides: Overrides,
    resolved: Arc<GuardedOperationPolicy>,
}

/// Per-operation policies with last-writer-wins field overrides.
pub struct PolicyRegistry {
    entries: ArcSwap<HashMap<OperationId, Arc<Entry>>>,
    writer: Mutex<()>,
}

impl fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyRegistry").field("operations", &self.entries.load().len()).finish()
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self { entries: ArcSwap::from_pointee(HashMap::new()), writer: Mutex::new(()) }
    }

    /// Register (or replace) the declared policy of an operation.
    ///
    /// Replacing keeps existing overrides and re-applies them on top of the new
    /// declaration; if they no longer fit, the registration is rejected.
    pub fn register(
        &self,
        operation: impl Into<OperationId>,
        policy: GuardedOperationPolicy,
    ) -> Result<Arc<GuardedOperationPolicy>, PolicyError> {
        let operation = operation.into();
        policy.validate()?;

        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.entries.load_full();
        let overrides = match current.get(&operation) {
            Some(previous) => {
                warn!(
                    target: "faultline::registry",
                    operation = %operation,
                    "policy replaced; last registration wins"
                );
                previous.overrides.clone()
            }
            None => Overrides::new(),
        };
        let resolved = Arc::new(resolve(&operation, &policy, &overrides)?);
        self.publish(&current, operation, Entry { declared: policy, overrides, resolved: resolved.clone() });
        Ok(resolved)
    }

    /// Resolved policy of an operation.
    pub fn resolve(&self, operation: &str) -> Result<Arc<GuardedOperationPolicy>, PolicyError> {
        self.entries
            .load()
            .get(operation)
            .map(|entry| entry.resolved.clone())
            .ok_or_else(|| PolicyError::UnknownOperation(OperationId::from(operation)))
    }

    /// Override one field of one declared strategy.
    ///
    /// The candidate policy is resolved and validated before it is published; a failing
    /// override leaves the registry unchanged.
    pub fn override_field(
        &self,
        operation: &str,
        kind: PolicyKind,
        field: &str,
        value: &str,
    ) -> Result<Arc<GuardedOperationPolicy>, PolicyError> {
        self.update_overrides(operation, |overrides| {
            overrides.insert((kind, field.trim().to_string()), value.trim().to_string());
        })
        .map(|resolved| {
            debug!(operation, %kind, field, value, "policy override applied");
            resolved
        })
    }

    /// Drop one override, falling back to the declared value.
    pub fn clear_override(
        &self,
        operation: &str,
        kind: PolicyKind,
        field: &str,
    ) -> Result<Arc<GuardedOperationPolicy>, PolicyError> {
        self.update_overrides(operation, |overrides| {
            overrides.remove(&(kind, field.trim().to_string()));
        })
    }

    /// Active overrides of an operation as `(kind, field, value)`.
    pub fn overrides(&self, operation: &str) -> Vec<(PolicyKind, String, String)> {
        self.entries
            .load()
            .get(operation)
            .map(|entry| {
                entry
                    .overrides
                    .iter()
                    .map(|((kind, field), value)| (*kind, field.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resolved policies sorted by operation id.
    pub fn operations(&self) -> Vec<(OperationId, Arc<GuardedOperationPolicy>)> {
        let entries = self.entries.load();
        let mut operations: Vec<_> =
            entries.iter().map(|(id, entry)| (id.clone(), entry.resolved.clone())).collect();
        operations.sort_by(|a, b| a.0.cmp(&b.0));
        operations
    }

    fn update_overrides<F>(
        &self,
        operation: &str,
        edit: F,
    ) -> Result<Arc<GuardedOperationPolicy>, PolicyError>
    where
        F: FnOnce(&mut Overrides),
    {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.entries.load_full();
        let (id, entry) = current
            .get_key_value(operation)
            .ok_or_else(|| PolicyError::UnknownOperation(OperationId::from(operation)))?;

        let mut overrides = entry.overrides.clone();
        edit(&mut overrides);
        let resolved = Arc::new(resolve(id, &entry.declared, &overrides)?);
        let next = Entry { declared: entry.declared.clone(), overrides, resolved: resolved.clone() };
        self.publish(&current, id.clone(), next);
        Ok(resolved)
    }

    fn publish(&self, current: &HashMap<OperationId, Arc<Entry>>, id: OperationId, entry: Entry) {
        let mut next = current.clone();
        next.insert(id, Arc::new(entry));
        self.entries.store(Arc::new(next));
    }
}

/// `backoff` goes first so it can reset the dependent fields, `enabled` goes last.
fn field_rank(field: &str) -> u8 {
    match field {
        "backoff" => 0,
        "enabled" => 2,
        _ => 1,
    }
}

fn resolve(
    operation: &OperationId,
    declared: &GuardedOperationPolicy,
    overrides: &Overrides,
) -> Result<GuardedOperationPolicy, PolicyError> {
    let mut ordered: Vec<_> = overrides.iter().collect();
    ordered.sort_by_key(|((kind, field), _)| (*kind, field_rank(field)));

    let mut resolved = declared.clone();
    for ((kind, field), value) in ordered {
        if !declared.declares(*kind) {
            return Err(PolicyError::NotDeclared { operation: operation.clone(), kind: *kind });
        }
        if !resolved.declares(*kind) {
            continue;
        }
        resolved.apply_field(operation, *kind, field, value)?;
    }
    resolved.validate()?;
    Ok(resolved)
}
