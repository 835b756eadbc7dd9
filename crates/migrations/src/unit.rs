use bgmigrate_core::{ArgumentList, MigrationResult};

use crate::storage::RecordStore;

/// A named, stateless, idempotent transformation over one record (or a small
/// batch of records) identified by its arguments.
///
/// Implementations must:
/// - re-fetch what they need through `store`; a missing row is success
/// - resolve unparseable source data locally (default value or no-op), never
///   by returning an error that would be retried forever
/// - converge: running twice with the same arguments leaves the same state as
///   running once, and the second run does not fail
/// - only return [`MigrationError::Transient`] for failures a retry can fix
///
/// [`MigrationError::Transient`]: bgmigrate_core::MigrationError::Transient
pub trait MigrationUnit: Send + Sync + 'static {
    /// Name the unit is scheduled under. Must be a valid `MigrationName`.
    fn name(&self) -> &'static str;

    fn perform(&self, store: &dyn RecordStore, args: &ArgumentList) -> MigrationResult<()>;
}

type PerformFn = dyn Fn(&dyn RecordStore, &ArgumentList) -> MigrationResult<()> + Send + Sync;

/// Unit backed by a closure, for one-off migrations and tests.
pub struct FnUnit {
    name: &'static str,
    perform: Box<PerformFn>,
}

impl FnUnit {
    pub fn new<F>(name: &'static str, perform: F) -> Self
    where
        F: Fn(&dyn RecordStore, &ArgumentList) -> MigrationResult<()> + Send + Sync + 'static,
    {
        Self {
            name,
            perform: Box::new(perform),
        }
    }
}

impl core::fmt::Debug for FnUnit {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FnUnit").field("name", &self.name).finish()
    }
}

impl MigrationUnit for FnUnit {
    fn name(&self) -> &'static str {
        self.name
    }

    fn perform(&self, store: &dyn RecordStore, args: &ArgumentList) -> MigrationResult<()> {
        (self.perform)(store, args)
    }
}
