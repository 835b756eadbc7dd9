//! `bgmigrate-migrations`
//!
//! **Responsibility:** the migration units themselves and the static registry
//! that resolves them by name.
//!
//! This crate is intentionally **not** allowed to know about the application:
//! - Units see a narrow [`RecordStore`] and their [`ArgumentList`], nothing else.
//! - Units must tolerate duplicate delivery and vanished records.
//! - The registry is built once at process start and is read-only afterwards.
//!
//! [`ArgumentList`]: bgmigrate_core::ArgumentList

pub mod extract_url;
pub mod normalize_email;
pub mod registry;
pub mod storage;
pub mod unit;

pub use extract_url::ExtractUrl;
pub use normalize_email::NormalizeEmail;
pub use registry::{MigrationRegistry, RegistryError};
pub use storage::{FieldValue, InMemoryRecordStore, Record, RecordStore, StorageError};
pub use unit::{FnUnit, MigrationUnit};
