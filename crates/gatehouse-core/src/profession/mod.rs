//! Profession and driver registry.
//!
//! The gateway's plugin taxonomy: a profession is a category of pluggable
//! behavior (`auth`, `router`, ...); a driver is one implementation
//! registered under it. Workers consult the registry when checking a
//! configuration push — an unowned profession or driver yields `SKILL`, a
//! registered driver whose validation rejects the body yields `FAIL`.
//!
//! The registry is a typed map keyed by profession name with explicit
//! `get / set / delete / list` operations; both the master and its workers
//! seed it from the same configuration file so the catalog agrees across
//! the process boundary.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

/// One driver implementation registered under a profession.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriverDetail {
    /// Driver name, unique within its profession.
    pub name: String,
    /// Short human-readable label.
    #[serde(default)]
    pub label: String,
    /// Longer description for operator-facing listings.
    #[serde(default)]
    pub description: String,
    /// Top-level JSON fields a configuration body must carry to validate.
    #[serde(default)]
    pub required: Vec<String>,
}

/// One profession and the drivers registered under it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profession {
    /// Profession name, unique within the registry.
    pub name: String,
    /// Registered drivers.
    #[serde(default)]
    pub drivers: Vec<DriverDetail>,
}

impl Profession {
    /// Looks up a driver by name.
    #[must_use]
    pub fn driver(&self, name: &str) -> Option<&DriverDetail> {
        self.drivers.iter().find(|d| d.name == name)
    }

    /// Whether a driver of this name is registered.
    #[must_use]
    pub fn has_driver(&self, name: &str) -> bool {
        self.driver(name).is_some()
    }

    /// Registers or replaces a driver.
    pub fn set_driver(&mut self, detail: DriverDetail) {
        if let Some(existing) = self.drivers.iter_mut().find(|d| d.name == detail.name) {
            *existing = detail;
        } else {
            self.drivers.push(detail);
        }
    }

    /// Removes a driver, returning it if present.
    pub fn delete_driver(&mut self, name: &str) -> Option<DriverDetail> {
        let index = self.drivers.iter().position(|d| d.name == name)?;
        Some(self.drivers.remove(index))
    }
}

/// Outcome of checking a configuration body against the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckResult {
    /// The body validates against the targeted driver.
    Accepted,
    /// This process does not own the targeted profession or driver; the
    /// caller should treat the push as a no-op for this process.
    Unowned(String),
    /// The body was rejected; the message says why.
    Rejected(String),
}

/// Typed registry of professions, shared across a process.
///
/// Cheap to clone; clones share the same backing map.
#[derive(Clone, Default)]
pub struct ProfessionRegistry {
    shared: Arc<RwLock<HashMap<String, Profession>>>,
}

impl ProfessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from configuration seeds.
    #[must_use]
    pub fn from_seeds(seeds: &[Profession]) -> Self {
        let registry = Self::new();
        for profession in seeds {
            registry.set(profession.clone());
        }
        registry
    }

    /// Returns a snapshot of the named profession.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Profession> {
        self.shared.read().ok()?.get(name).cloned()
    }

    /// Registers or replaces a profession.
    pub fn set(&self, profession: Profession) {
        if let Ok(mut map) = self.shared.write() {
            map.insert(profession.name.clone(), profession);
        }
    }

    /// Removes a profession, returning it if present.
    pub fn delete(&self, name: &str) -> Option<Profession> {
        self.shared.write().ok()?.remove(name)
    }

    /// All professions, sorted by name for stable listings.
    #[must_use]
    pub fn list(&self) -> Vec<Profession> {
        let mut professions: Vec<Profession> = self
            .shared
            .read()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default();
        professions.sort_by(|a, b| a.name.cmp(&b.name));
        professions
    }

    /// Whether `driver` is registered under `profession`.
    #[must_use]
    pub fn has_driver(&self, profession: &str, driver: &str) -> bool {
        self.get(profession)
            .is_some_and(|p| p.has_driver(driver))
    }

    /// Checks a configuration body against the targeted driver.
    ///
    /// Ownership misses (`Unowned`) map to the push protocol's `SKILL`
    /// status; body rejections (`Rejected`) map to `FAIL`.
    #[must_use]
    pub fn check(&self, profession: &str, driver: &str, body: &[u8]) -> CheckResult {
        let Some(owned) = self.get(profession) else {
            return CheckResult::Unowned(format!("profession {profession:?} is not owned here"));
        };
        let Some(detail) = owned.driver(driver) else {
            return CheckResult::Unowned(format!(
                "driver {driver:?} is not registered under profession {profession:?}"
            ));
        };

        let value: serde_json::Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(err) => {
                return CheckResult::Rejected(format!(
                    "configuration body is not valid JSON: {err}"
                ))
            },
        };
        let Some(object) = value.as_object() else {
            return CheckResult::Rejected("configuration body must be a JSON object".to_string());
        };

        for field in &detail.required {
            if !object.contains_key(field) {
                return CheckResult::Rejected(format!(
                    "missing required field {field:?} for driver {profession}/{driver}"
                ));
            }
        }
        CheckResult::Accepted
    }
}

impl std::fmt::Debug for ProfessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .shared
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("ProfessionRegistry")
            .field("professions", &names)
            .finish()
    }
}
