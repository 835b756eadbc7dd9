//! Static name → unit registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use bgmigrate_core::name::InvalidMigrationName;
use bgmigrate_core::{ArgumentList, MigrationError, MigrationName, MigrationResult};

use crate::extract_url::ExtractUrl;
use crate::normalize_email::NormalizeEmail;
use crate::storage::RecordStore;
use crate::unit::{FnUnit, MigrationUnit};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidName(#[from] InvalidMigrationName),
    #[error("migration `{0}` is registered twice")]
    Duplicate(MigrationName),
}

/// Resolves migration names to units.
///
/// Populated once at process start and shared behind an `Arc`; there is no way
/// to add units once workers are running, so the set of code a queued job can
/// reach only changes with a deploy.
#[derive(Clone, Default)]
pub struct MigrationRegistry {
    units: BTreeMap<MigrationName, Arc<dyn MigrationUnit>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in unit.
    pub fn standard() -> Result<Self, RegistryError> {
        Self::new().with(ExtractUrl)?.with(NormalizeEmail)
    }

    pub fn with<U: MigrationUnit>(mut self, unit: U) -> Result<Self, RegistryError> {
        self.register(unit)?;
        Ok(self)
    }

    pub fn register<U: MigrationUnit>(&mut self, unit: U) -> Result<(), RegistryError> {
        let name = MigrationName::new(unit.name())?;
        if self.units.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.units.insert(name, Arc::new(unit));
        Ok(())
    }

    /// Register a closure as a unit.
    pub fn register_fn<F>(&mut self, name: &'static str, perform: F) -> Result<(), RegistryError>
    where
        F: Fn(&dyn RecordStore, &ArgumentList) -> MigrationResult<()> + Send + Sync + 'static,
    {
        self.register(FnUnit::new(name, perform))
    }

    pub fn resolve(&self, name: &MigrationName) -> Result<Arc<dyn MigrationUnit>, MigrationError> {
        self.units
            .get(name)
            .cloned()
            .ok_or_else(|| MigrationError::Unresolvable(name.clone()))
    }

    pub fn contains(&self, name: &MigrationName) -> bool {
        self.units.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &MigrationName> {
        self.units.keys()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl core::fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.units.keys()).finish()
    }
}
