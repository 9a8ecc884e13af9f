//! Layered overlay resolution.
//!
//! Overlays live in ordered, immutable scopes. A lookup searches the
//! scopes most-specific-first and returns the first match; a miss is a
//! typed error naming the key and every scope searched. Scopes are
//! snapshots: once a chain is built nothing mutates it.
//!
//! The canonical precedence order, most specific to least specific:
//!
//! 1. reserved overlays (`rig_index`, `rig_hostname`, `rig_logdir`)
//! 2. caller-supplied runtime overlays
//! 3. environment-derived overlays (explicit allow-list)
//! 4. template-local index-keyed overlay lists
//! 5. template-local scalar overlays
//! 6. test-wide index-keyed overlay lists
//! 7. test-wide scalar overlays
//! 8. configuration-file default overlays
//!
//! Reserved names can never be supplied by a lower scope; building a
//! chain that tries is a fatal [`OverlayError::ReservedCollision`].

use std::collections::BTreeMap;

use netrig_common::value::OverlayValue;

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("overlay {key} not found (searched scopes: {})", .scopes.join(", "))]
    KeyNotFound { key: String, scopes: Vec<String> },

    #[error("reserved overlay name(s) declared by the test: {}", .keys.join(", "))]
    ReservedCollision { keys: Vec<String> },
}

/// One named, read-only overlay scope.
#[derive(Debug, Clone)]
pub struct Scope {
    name: String,
    values: BTreeMap<String, OverlayValue>,
}

impl Scope {
    pub fn new(name: impl Into<String>, values: BTreeMap<String, OverlayValue>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    /// An empty scope, useful as a placeholder level.
    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, BTreeMap::new())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&OverlayValue> {
        self.values.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// An ordered list of scopes, most specific first.
#[derive(Debug, Clone)]
pub struct ScopeChain {
    scopes: Vec<Scope>,
}

impl ScopeChain {
    /// Build a chain with a harness-populated reserved scope on top.
    ///
    /// Every lower scope is checked against the reserved name set; any
    /// hit fails with [`OverlayError::ReservedCollision`] naming all
    /// offending keys.
    pub fn build(reserved: Scope, lower: Vec<Scope>) -> Result<Self, OverlayError> {
        check_reserved(&lower)?;
        let mut scopes = Vec::with_capacity(lower.len() + 1);
        scopes.push(reserved);
        scopes.extend(lower);
        Ok(Self { scopes })
    }

    /// Build a chain with no reserved scope (used for files that get no
    /// per-host injection). Lower scopes are still checked.
    pub fn without_reserved(lower: Vec<Scope>) -> Result<Self, OverlayError> {
        check_reserved(&lower)?;
        Ok(Self { scopes: lower })
    }

    /// Resolve a key against the chain, first scope wins.
    pub fn lookup(&self, key: &str) -> Result<&OverlayValue, OverlayError> {
        self.get(key).ok_or_else(|| OverlayError::KeyNotFound {
            key: key.to_string(),
            scopes: self.scopes.iter().map(|s| s.name.clone()).collect(),
        })
    }

    pub fn get(&self, key: &str) -> Option<&OverlayValue> {
        self.scopes.iter().find_map(|s| s.values.get(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

fn check_reserved(lower: &[Scope]) -> Result<(), OverlayError> {
    let mut keys: Vec<String> = lower
        .iter()
        .flat_map(|s| s.keys())
        .filter(|k| netrig_common::is_reserved_overlay(k))
        .map(str::to_string)
        .collect();
    if keys.is_empty() {
        return Ok(());
    }
    keys.sort();
    keys.dedup();
    Err(OverlayError::ReservedCollision { keys })
}
